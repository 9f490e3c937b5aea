pub mod academics;
pub mod core;
pub mod promotion;
pub mod results;
pub mod rules;
pub mod students;
pub mod subjects;
