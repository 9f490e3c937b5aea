use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
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

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    let code = get_required_str(params, "code")?.trim().to_uppercase();
    if name.is_empty() || code.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name and code must not be empty".to_string(),
            details: None,
        });
    }
    let category = params
        .get("category")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code, category, active) VALUES(?, ?, ?, ?, 1)",
        (&subject_id, &name, &code, &category),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "subjects" })),
    })?;

    Ok(json!({ "subjectId": subject_id, "name": name, "code": code }))
}

fn subjects_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let active_only = params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let sql = if active_only {
        "SELECT id, name, code, category, active FROM subjects WHERE active = 1 ORDER BY name"
    } else {
        "SELECT id, name, code, category, active FROM subjects ORDER BY name"
    };
    let mut stmt = conn.prepare(sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let subjects = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "category": r.get::<_, Option<String>>(3)?,
                "active": r.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing/invalid patch".to_string(),
            details: None,
        });
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<SqlValue> = Vec::new();

    if let Some(v) = patch.get("name") {
        let Some(s) = v.as_str() else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "patch.name must be a string".to_string(),
                details: None,
            });
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "name must not be empty".to_string(),
                details: None,
            });
        }
        set_parts.push("name = ?".into());
        bind_values.push(SqlValue::Text(s));
    }
    if let Some(v) = patch.get("category") {
        if v.is_null() {
            set_parts.push("category = ?".into());
            bind_values.push(SqlValue::Null);
        } else if let Some(s) = v.as_str() {
            let t = s.trim().to_string();
            set_parts.push("category = ?".into());
            if t.is_empty() {
                bind_values.push(SqlValue::Null);
            } else {
                bind_values.push(SqlValue::Text(t));
            }
        } else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "patch.category must be a string or null".to_string(),
                details: None,
            });
        }
    }
    if let Some(v) = patch.get("active") {
        let Some(b) = v.as_bool() else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "patch.active must be a boolean".to_string(),
                details: None,
            });
        };
        set_parts.push("active = ?".into());
        bind_values.push(SqlValue::Integer(if b { 1 } else { 0 }));
    }

    if set_parts.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "patch must include at least one field".to_string(),
            details: None,
        });
    }

    let sql = format!("UPDATE subjects SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(SqlValue::Text(subject_id));

    let changed = conn
        .execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "subjects" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    }

    Ok(json!({ "ok": true }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match subjects_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match subjects_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match subjects_update(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        _ => None,
    }
}
