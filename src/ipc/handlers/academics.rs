use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Dates ride along as ISO strings; reject anything chrono cannot parse.
fn check_iso_date(value: &str, key: &str) -> Result<(), HandlerErr> {
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| HandlerErr {
            code: "bad_params",
            message: format!("{} must be YYYY-MM-DD", key),
            details: None,
        })
}

fn sessions_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name must not be empty".to_string(),
            details: None,
        });
    }
    let start_date = get_optional_str(params, "startDate");
    let end_date = get_optional_str(params, "endDate");
    if let Some(d) = &start_date {
        check_iso_date(d, "startDate")?;
    }
    if let Some(d) = &end_date {
        check_iso_date(d, "endDate")?;
    }

    let session_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sessions(id, name, start_date, end_date, is_current)
         VALUES(?, ?, ?, ?, 0)",
        (&session_id, &name, &start_date, &end_date),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "sessions" })),
    })?;

    Ok(json!({ "sessionId": session_id, "name": name }))
}

fn sessions_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, start_date, end_date, is_current
             FROM sessions
             ORDER BY name DESC",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let sessions = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, Option<String>>(2)?,
                "endDate": r.get::<_, Option<String>>(3)?,
                "isCurrent": r.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "sessions": sessions }))
}

/// Marking a session current clears the flag on every other session.
fn sessions_set_current(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?", [&session_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "session not found".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    if let Err(e) = tx
        .execute("UPDATE sessions SET is_current = 0 WHERE is_current = 1", [])
        .and_then(|_| tx.execute("UPDATE sessions SET is_current = 1 WHERE id = ?", [&session_id]))
    {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "sessions" })),
        });
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "ok": true }))
}

fn terms_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name must not be empty".to_string(),
            details: None,
        });
    }
    let start_date = get_optional_str(params, "startDate");
    let end_date = get_optional_str(params, "endDate");
    if let Some(d) = &start_date {
        check_iso_date(d, "startDate")?;
    }
    if let Some(d) = &end_date {
        check_iso_date(d, "endDate")?;
    }

    let session_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?", [&session_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if session_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "session not found".to_string(),
            details: None,
        });
    }

    // Creation order is the recency key the promotion engine sorts on.
    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), 0) + 1 FROM terms WHERE session_id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let term_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO terms(id, session_id, name, start_date, end_date, is_current, sort_order)
         VALUES(?, ?, ?, ?, ?, 0, ?)",
        (&term_id, &session_id, &name, &start_date, &end_date, next_sort),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "terms" })),
    })?;

    Ok(json!({ "termId": term_id, "name": name, "sortOrder": next_sort }))
}

fn terms_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, start_date, end_date, is_current, sort_order
             FROM terms
             WHERE session_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let terms = stmt
        .query_map([&session_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, Option<String>>(2)?,
                "endDate": r.get::<_, Option<String>>(3)?,
                "isCurrent": r.get::<_, i64>(4)? != 0,
                "sortOrder": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "terms": terms }))
}

/// Current-term is a per-session marker; only siblings are cleared.
fn terms_set_current(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    let session_id: Option<String> = conn
        .query_row("SELECT session_id FROM terms WHERE id = ?", [&term_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(session_id) = session_id else {
        return Err(HandlerErr {
            code: "not_found",
            message: "term not found".to_string(),
            details: None,
        });
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    if let Err(e) = tx
        .execute(
            "UPDATE terms SET is_current = 0 WHERE session_id = ? AND is_current = 1",
            [&session_id],
        )
        .and_then(|_| tx.execute("UPDATE terms SET is_current = 1 WHERE id = ?", [&term_id]))
    {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "terms" })),
        });
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "ok": true }))
}

fn class_levels_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name must not be empty".to_string(),
            details: None,
        });
    }
    let sort_order = params
        .get("sortOrder")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing sortOrder".to_string(),
            details: None,
        })?;
    let description = get_optional_str(params, "description");

    let level_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO class_levels(id, name, sort_order, description) VALUES(?, ?, ?, ?)",
        (&level_id, &name, sort_order, description.unwrap_or_default()),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "class_levels" })),
    })?;

    Ok(json!({ "classLevelId": level_id, "name": name }))
}

fn class_levels_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT cl.id, cl.name, cl.sort_order, cl.description,
               (SELECT COUNT(*) FROM students s
                WHERE s.class_level_id = cl.id AND s.active = 1) AS student_count
             FROM class_levels cl
             ORDER BY cl.sort_order",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let levels = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "sortOrder": r.get::<_, i64>(2)?,
                "description": r.get::<_, Option<String>>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "classLevels": levels }))
}

fn handle_sessions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match sessions_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_sessions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match sessions_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_sessions_set_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match sessions_set_current(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_terms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match terms_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_terms_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match terms_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_terms_set_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match terms_set_current(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_class_levels_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match class_levels_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_class_levels_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match class_levels_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.create" => Some(handle_sessions_create(state, req)),
        "sessions.list" => Some(handle_sessions_list(state, req)),
        "sessions.setCurrent" => Some(handle_sessions_set_current(state, req)),
        "terms.create" => Some(handle_terms_create(state, req)),
        "terms.list" => Some(handle_terms_list(state, req)),
        "terms.setCurrent" => Some(handle_terms_set_current(state, req)),
        "classLevels.create" => Some(handle_class_levels_create(state, req)),
        "classLevels.list" => Some(handle_class_levels_list(state, req)),
        _ => None,
    }
}
