use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One request line off stdin: `{id, method, params}`. `params` defaults to
/// JSON null so bare method calls stay valid.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Connection state for the lifetime of the process. No workspace is open
/// until the frontend sends `workspace.select`.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
        }
    }
}
