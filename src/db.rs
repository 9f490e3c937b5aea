use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("sis.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Idempotent schema setup. Also usable against an in-memory connection.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            start_date TEXT,
            end_date TEXT,
            is_current INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_current ON sessions(is_current)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            name TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT,
            is_current INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            UNIQUE(session_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_terms_session ON terms(session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_terms_session_sort ON terms(session_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_levels(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            sort_order INTEGER NOT NULL UNIQUE
        )",
        [],
    )?;
    ensure_class_levels_description(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            category TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_active_name ON subjects(active, name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            admission_no TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            middle_name TEXT,
            gender TEXT,
            class_level_id TEXT,
            enrollment_session_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            graduation_date TEXT,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(class_level_id) REFERENCES class_levels(id),
            FOREIGN KEY(enrollment_session_id) REFERENCES sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_active ON students(class_level_id, active)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_name ON students(last_name, first_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            ca_score REAL NOT NULL DEFAULT 0,
            theory_score REAL NOT NULL DEFAULT 0,
            exam_score REAL NOT NULL DEFAULT 0,
            total_score REAL NOT NULL DEFAULT 0,
            grade TEXT NOT NULL DEFAULT '',
            remark TEXT NOT NULL DEFAULT '',
            cumulative_score REAL,
            cumulative_grade TEXT,
            position INTEGER,
            class_average REAL,
            total_students INTEGER,
            highest_score REAL,
            lowest_score REAL,
            uploaded_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            UNIQUE(student_id, subject_id, session_id, term_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_results_student_session ON exam_results(student_id, session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_results_session_term ON exam_results(session_id, term_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS promotion_rules(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            class_level_id TEXT,
            pass_mark REAL NOT NULL DEFAULT 50,
            compulsory_subject_ids TEXT NOT NULL DEFAULT '[]',
            min_additional_subjects INTEGER NOT NULL DEFAULT 0,
            promotion_mode TEXT NOT NULL DEFAULT 'recommend',
            allow_carryover INTEGER NOT NULL DEFAULT 0,
            max_carryover_subjects INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            FOREIGN KEY(class_level_id) REFERENCES class_levels(id)
        )",
        [],
    )?;
    ensure_promotion_rules_category_pass_marks(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_promotion_rules_scope ON promotion_rules(session_id, class_level_id, active)",
        [],
    )?;

    Ok(())
}

fn ensure_class_levels_description(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "class_levels", "description")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE class_levels ADD COLUMN description TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    Ok(())
}

fn ensure_promotion_rules_category_pass_marks(conn: &Connection) -> anyhow::Result<()> {
    // Older workspaces predate per-category pass marks; the column holds a
    // JSON object mapping a subject category label to its override mark.
    if table_has_column(conn, "promotion_rules", "category_pass_marks")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE promotion_rules ADD COLUMN category_pass_marks TEXT NOT NULL DEFAULT '{}'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
