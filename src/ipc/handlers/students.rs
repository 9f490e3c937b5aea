use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
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

fn class_level_exists(conn: &Connection, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM class_levels WHERE id = ?", [id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

/// Admission numbers are `STU/<year>/<serial>`, serial zero-padded to three
/// digits. The count-based seed can collide with explicitly supplied
/// numbers, so step the serial forward until a free one turns up.
fn generate_admission_no(conn: &Connection) -> Result<String, HandlerErr> {
    let year = Utc::now().year();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let mut serial = count + 1;
    loop {
        let candidate = format!("STU/{}/{:03}", year, serial);
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM students WHERE admission_no = ?",
                [&candidate],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        if exists.is_none() {
            return Ok(candidate);
        }
        serial += 1;
    }
}

fn students_enroll(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    if last_name.is_empty() || first_name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "lastName and firstName must not be empty".to_string(),
            details: None,
        });
    }
    let middle_name = get_optional_str(params, "middleName");
    let gender = get_optional_str(params, "gender");
    if let Some(g) = &gender {
        if g != "M" && g != "F" {
            return Err(HandlerErr {
                code: "bad_params",
                message: "gender must be M or F".to_string(),
                details: None,
            });
        }
    }

    let class_level_id = get_optional_str(params, "classLevelId");
    if let Some(id) = &class_level_id {
        if !class_level_exists(conn, id)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "class level not found".to_string(),
                details: None,
            });
        }
    }
    let session_id = get_optional_str(params, "enrollmentSessionId");
    if let Some(id) = &session_id {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM sessions WHERE id = ?", [id], |r| r.get(0))
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
    }

    let admission_no = match get_optional_str(params, "admissionNo") {
        Some(n) => n,
        None => generate_admission_no(conn)?,
    };

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(
            id, admission_no, last_name, first_name, middle_name, gender,
            class_level_id, enrollment_session_id, active, graduation_date,
            created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, NULL,
            strftime('%Y-%m-%dT%H:%M:%SZ','now'),
            strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &student_id,
            &admission_no,
            &last_name,
            &first_name,
            &middle_name,
            &gender,
            &class_level_id,
            &session_id,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    Ok(json!({ "studentId": student_id, "admissionNo": admission_no }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_level_id = get_optional_str(params, "classLevelId");
    let include_inactive = params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut sql = String::from(
        "SELECT s.id, s.admission_no, s.last_name, s.first_name, s.middle_name,
                s.gender, s.class_level_id, cl.name, s.active, s.graduation_date
         FROM students s
         LEFT JOIN class_levels cl ON cl.id = s.class_level_id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<SqlValue> = Vec::new();
    if !include_inactive {
        clauses.push("s.active = 1");
    }
    if let Some(id) = &class_level_id {
        clauses.push("s.class_level_id = ?");
        binds.push(SqlValue::Text(id.clone()));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY s.last_name, s.first_name");

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let students = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "admissionNo": r.get::<_, String>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "firstName": r.get::<_, String>(3)?,
                "middleName": r.get::<_, Option<String>>(4)?,
                "gender": r.get::<_, Option<String>>(5)?,
                "classLevelId": r.get::<_, Option<String>>(6)?,
                "classLevel": r.get::<_, Option<String>>(7)?,
                "active": r.get::<_, i64>(8)? != 0,
                "graduationDate": r.get::<_, Option<String>>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "students": students }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing/invalid patch".to_string(),
            details: None,
        });
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<SqlValue> = Vec::new();

    for (key, column) in [("lastName", "last_name"), ("firstName", "first_name")] {
        if let Some(v) = patch.get(key) {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("patch.{} must be a string", key),
                    details: None,
                });
            };
            let s = s.trim().to_string();
            if s.is_empty() {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("{} must not be empty", key),
                    details: None,
                });
            }
            set_parts.push(format!("{} = ?", column));
            bind_values.push(SqlValue::Text(s));
        }
    }
    if let Some(v) = patch.get("middleName") {
        if v.is_null() {
            set_parts.push("middle_name = ?".into());
            bind_values.push(SqlValue::Null);
        } else if let Some(s) = v.as_str() {
            let t = s.trim().to_string();
            set_parts.push("middle_name = ?".into());
            if t.is_empty() {
                bind_values.push(SqlValue::Null);
            } else {
                bind_values.push(SqlValue::Text(t));
            }
        } else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "patch.middleName must be a string or null".to_string(),
                details: None,
            });
        }
    }
    if let Some(v) = patch.get("gender") {
        if v.is_null() {
            set_parts.push("gender = ?".into());
            bind_values.push(SqlValue::Null);
        } else if let Some(s) = v.as_str() {
            if s != "M" && s != "F" {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "gender must be M or F".to_string(),
                    details: None,
                });
            }
            set_parts.push("gender = ?".into());
            bind_values.push(SqlValue::Text(s.to_string()));
        } else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "patch.gender must be a string or null".to_string(),
                details: None,
            });
        }
    }
    if let Some(v) = patch.get("classLevelId") {
        if v.is_null() {
            set_parts.push("class_level_id = ?".into());
            bind_values.push(SqlValue::Null);
        } else if let Some(s) = v.as_str() {
            if !class_level_exists(conn, s)? {
                return Err(HandlerErr {
                    code: "not_found",
                    message: "class level not found".to_string(),
                    details: None,
                });
            }
            set_parts.push("class_level_id = ?".into());
            bind_values.push(SqlValue::Text(s.to_string()));
        } else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "patch.classLevelId must be a string or null".to_string(),
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

    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(SqlValue::Text(student_id));

    let changed = conn
        .execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    Ok(json!({ "ok": true }))
}

fn handle_students_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_enroll(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_update(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.enroll" => Some(handle_students_enroll(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        _ => None,
    }
}
