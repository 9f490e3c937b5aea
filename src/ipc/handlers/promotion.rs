use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::promotion::{self, GRADUATED};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

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

fn class_level_id_by_name(conn: &Connection, name: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row("SELECT id FROM class_levels WHERE name = ?", [name], |r| {
        r.get(0)
    })
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

/// Apply an approved promotion batch. The requested transition must match
/// the fixed progression exactly; anything else is rejected before any row
/// is touched. Students that are missing, inactive or sitting in a
/// different class become per-student error entries and are skipped; the
/// remaining mutations commit or roll back as one unit.
fn promotion_commit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let from_class = get_required_str(params, "fromClass")?;
    let to_class = get_required_str(params, "toClass")?;
    let Some(ids) = params.get("studentIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing studentIds".to_string(),
            details: None,
        });
    };
    let mut student_ids = Vec::with_capacity(ids.len());
    for v in ids {
        let Some(s) = v.as_str() else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "studentIds entries must be strings".to_string(),
                details: None,
            });
        };
        student_ids.push(s.to_string());
    }
    if student_ids.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "studentIds must not be empty".to_string(),
            details: None,
        });
    }

    match promotion::next_class_level(&from_class) {
        Some(next) if next == to_class => {}
        _ => {
            return Err(HandlerErr {
                code: "invalid_transition",
                message: format!("cannot promote from {} to {}", from_class, to_class),
                details: None,
            });
        }
    }

    let Some(from_id) = class_level_id_by_name(conn, &from_class)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "class level not found".to_string(),
            details: Some(json!({ "classLevel": from_class })),
        });
    };
    let to_id = if to_class == GRADUATED {
        None
    } else {
        let Some(id) = class_level_id_by_name(conn, &to_class)? else {
            return Err(HandlerErr {
                code: "not_found",
                message: "class level not found".to_string(),
                details: Some(json!({ "classLevel": to_class })),
            });
        };
        Some(id)
    };

    // Pre-filter: a bad id is reported, not fatal, and never rolls back
    // the students that do qualify.
    let mut eligible: Vec<(String, String)> = Vec::new();
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for student_id in &student_ids {
        let row: Option<String> = conn
            .query_row(
                "SELECT admission_no FROM students
                 WHERE id = ? AND class_level_id = ? AND active = 1",
                rusqlite::params![student_id, from_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        match row {
            Some(admission_no) => eligible.push((student_id.clone(), admission_no)),
            None => errors.push(json!({
                "studentId": student_id,
                "error": "Student not found or not in expected class",
            })),
        }
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut promoted_count = 0_i64;
    let mut graduated_count = 0_i64;
    let today = Utc::now().date_naive().to_string();
    for (student_id, admission_no) in &eligible {
        let update = match &to_id {
            Some(to_id) => tx.execute(
                "UPDATE students
                 SET class_level_id = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
                 WHERE id = ?",
                rusqlite::params![to_id, student_id],
            ),
            None => tx.execute(
                "UPDATE students
                 SET active = 0, graduation_date = ?,
                     updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
                 WHERE id = ?",
                rusqlite::params![today, student_id],
            ),
        };
        if let Err(e) = update {
            let _ = tx.rollback();
            tracing::error!(
                student_id = %student_id,
                error = %e,
                "promotion batch rolled back"
            );
            return Err(HandlerErr {
                code: "db_tx_failed",
                message: e.to_string(),
                details: Some(json!({ "studentId": student_id })),
            });
        }
        if to_id.is_some() {
            promoted_count += 1;
            tracing::info!(
                admission_no = %admission_no,
                from = %from_class,
                to = %to_class,
                "student promoted"
            );
        } else {
            graduated_count += 1;
            tracing::info!(admission_no = %admission_no, "student graduated");
        }
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "fromClass": from_class,
        "toClass": to_class,
        "promotedCount": promoted_count,
        "graduatedCount": graduated_count,
        "errors": errors,
    }))
}

fn handle_class_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_level = match req.params.get("classLevel").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classLevel", None),
    };
    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };

    match promotion::build_class_report(conn, &class_level, &session_id) {
        Ok(report) => match serde_json::to_value(&report) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "bad_json", e.to_string(), None),
        },
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_commit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match promotion_commit(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "promotion.classReport" => Some(handle_class_report(state, req)),
        "promotion.commit" => Some(handle_commit(state, req)),
        _ => None,
    }
}
