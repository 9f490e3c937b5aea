use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::promotion;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
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

fn get_scope_class_level(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<Option<String>, HandlerErr> {
    let Some(v) = params.get("classLevelId") else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(id) = v.as_str() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "classLevelId must be a string or null".to_string(),
            details: None,
        });
    };
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM class_levels WHERE id = ?", [id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "class level not found".to_string(),
            details: None,
        });
    }
    Ok(Some(id.to_string()))
}

fn rules_save(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
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
    let class_level_id = get_scope_class_level(conn, params)?;

    let pass_mark = params
        .get("passMark")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing or non-numeric passMark".to_string(),
            details: None,
        })?;
    if !(0.0..=100.0).contains(&pass_mark) {
        return Err(HandlerErr {
            code: "bad_params",
            message: "passMark must be between 0 and 100".to_string(),
            details: None,
        });
    }

    let promotion_mode = get_required_str(params, "promotionMode")?;
    if !matches!(promotion_mode.as_str(), "auto" | "recommend" | "manual") {
        return Err(HandlerErr {
            code: "bad_params",
            message: "promotionMode must be auto, recommend or manual".to_string(),
            details: None,
        });
    }

    let min_additional = params
        .get("minAdditionalSubjects")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing or non-integer minAdditionalSubjects".to_string(),
            details: None,
        })?;
    let max_carryover = params
        .get("maxCarryoverSubjects")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if min_additional < 0 || max_carryover < 0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "subject counts must not be negative".to_string(),
            details: None,
        });
    }
    let allow_carryover = params
        .get("allowCarryover")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let compulsory: Vec<String> = match params.get("compulsorySubjectIds") {
        None => Vec::new(),
        Some(v) => {
            let Some(arr) = v.as_array() else {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "compulsorySubjectIds must be an array".to_string(),
                    details: None,
                });
            };
            let mut ids = Vec::with_capacity(arr.len());
            for item in arr {
                let Some(id) = item.as_str() else {
                    return Err(HandlerErr {
                        code: "bad_params",
                        message: "compulsorySubjectIds entries must be strings".to_string(),
                        details: None,
                    });
                };
                let exists: Option<i64> = conn
                    .query_row("SELECT 1 FROM subjects WHERE id = ?", [id], |r| r.get(0))
                    .optional()
                    .map_err(|e| HandlerErr {
                        code: "db_query_failed",
                        message: e.to_string(),
                        details: None,
                    })?;
                if exists.is_none() {
                    return Err(HandlerErr {
                        code: "not_found",
                        message: "compulsory subject not found".to_string(),
                        details: Some(json!({ "subjectId": id })),
                    });
                }
                if !ids.contains(&id.to_string()) {
                    ids.push(id.to_string());
                }
            }
            ids
        }
    };

    let category_pass_marks: HashMap<String, f64> = match params.get("categoryPassMarks") {
        None => HashMap::new(),
        Some(v) if v.is_null() => HashMap::new(),
        Some(v) => {
            let Some(obj) = v.as_object() else {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "categoryPassMarks must be an object".to_string(),
                    details: None,
                });
            };
            let mut map = HashMap::with_capacity(obj.len());
            for (k, val) in obj {
                let Some(mark) = val.as_f64() else {
                    return Err(HandlerErr {
                        code: "bad_params",
                        message: format!("categoryPassMarks.{} must be a number", k),
                        details: None,
                    });
                };
                if !(0.0..=100.0).contains(&mark) {
                    return Err(HandlerErr {
                        code: "bad_params",
                        message: format!("categoryPassMarks.{} must be between 0 and 100", k),
                        details: None,
                    });
                }
                map.insert(k.clone(), mark);
            }
            map
        }
    };

    let compulsory_json = serde_json::to_string(&compulsory).map_err(|e| HandlerErr {
        code: "bad_params",
        message: e.to_string(),
        details: None,
    })?;
    let cats_json = serde_json::to_string(&category_pass_marks).map_err(|e| HandlerErr {
        code: "bad_params",
        message: e.to_string(),
        details: None,
    })?;

    // Saving supersedes any active rule with the same scope; both writes
    // land or neither does.
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let deactivate = match &class_level_id {
        Some(cl) => tx.execute(
            "UPDATE promotion_rules SET active = 0
             WHERE session_id = ? AND class_level_id = ? AND active = 1",
            rusqlite::params![session_id, cl],
        ),
        None => tx.execute(
            "UPDATE promotion_rules SET active = 0
             WHERE session_id = ? AND class_level_id IS NULL AND active = 1",
            rusqlite::params![session_id],
        ),
    };
    if let Err(e) = deactivate {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "promotion_rules" })),
        });
    }

    let rule_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO promotion_rules(
            id, session_id, class_level_id, pass_mark, compulsory_subject_ids,
            min_additional_subjects, promotion_mode, allow_carryover,
            max_carryover_subjects, category_pass_marks, active, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        rusqlite::params![
            rule_id,
            session_id,
            class_level_id,
            pass_mark,
            compulsory_json,
            min_additional,
            promotion_mode,
            if allow_carryover { 1_i64 } else { 0 },
            max_carryover,
            cats_json,
        ],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "promotion_rules" })),
        });
    }

    if let Err(e) = tx.commit() {
        return Err(HandlerErr {
            code: "db_commit_failed",
            message: e.to_string(),
            details: None,
        });
    }

    tracing::info!(
        rule_id = %rule_id,
        session_id = %session_id,
        scope = %class_level_id.as_deref().unwrap_or("session"),
        "promotion rule saved"
    );

    Ok(json!({ "ruleId": rule_id }))
}

fn rules_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = params.get("sessionId").and_then(|v| v.as_str());

    let sql = "SELECT r.id, r.session_id, se.name, r.class_level_id, cl.name,
                      r.pass_mark, r.compulsory_subject_ids, r.min_additional_subjects,
                      r.promotion_mode, r.allow_carryover, r.max_carryover_subjects,
                      r.category_pass_marks, r.active, r.updated_at
               FROM promotion_rules r
               JOIN sessions se ON se.id = r.session_id
               LEFT JOIN class_levels cl ON cl.id = r.class_level_id";
    let (sql, binds): (String, Vec<String>) = match session_id {
        Some(s) => (
            format!("{} WHERE r.session_id = ? ORDER BY r.updated_at DESC", sql),
            vec![s.to_string()],
        ),
        None => (format!("{} ORDER BY r.updated_at DESC", sql), Vec::new()),
    };

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let rules = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            let compulsory_raw: String = r.get(6)?;
            let cats_raw: String = r.get(11)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "sessionId": r.get::<_, String>(1)?,
                "session": r.get::<_, String>(2)?,
                "classLevelId": r.get::<_, Option<String>>(3)?,
                "classLevel": r.get::<_, Option<String>>(4)?,
                "passMark": r.get::<_, f64>(5)?,
                "compulsorySubjectIds":
                    serde_json::from_str::<serde_json::Value>(&compulsory_raw)
                        .unwrap_or_else(|_| json!([])),
                "minAdditionalSubjects": r.get::<_, i64>(7)?,
                "promotionMode": r.get::<_, String>(8)?,
                "allowCarryover": r.get::<_, i64>(9)? != 0,
                "maxCarryoverSubjects": r.get::<_, i64>(10)?,
                "categoryPassMarks":
                    serde_json::from_str::<serde_json::Value>(&cats_raw)
                        .unwrap_or_else(|_| json!({})),
                "active": r.get::<_, i64>(12)? != 0,
                "updatedAt": r.get::<_, Option<String>>(13)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "rules": rules }))
}

fn rules_deactivate(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let rule_id = get_required_str(params, "ruleId")?;
    let changed = conn
        .execute(
            "UPDATE promotion_rules SET active = 0,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE id = ?",
            [&rule_id],
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "promotion_rules" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "rule not found".to_string(),
            details: None,
        });
    }
    Ok(json!({ "ok": true }))
}

fn handle_rules_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match rules_save(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

/// The effective rule for a scope, fallback included, as the evaluator
/// would apply it.
fn handle_rules_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };
    let class_level_id = req
        .params
        .get("classLevelId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    match promotion::resolve_rule(conn, &session_id, class_level_id.as_deref()) {
        Ok(rule) => match serde_json::to_value(&rule) {
            Ok(v) => ok(&req.id, json!({ "rule": v })),
            Err(e) => err(&req.id, "bad_json", e.to_string(), None),
        },
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_rules_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match rules_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_rules_deactivate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match rules_deactivate(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "promotionRules.save" => Some(handle_rules_save(state, req)),
        "promotionRules.get" => Some(handle_rules_get(state, req)),
        "promotionRules.list" => Some(handle_rules_list(state, req)),
        "promotionRules.deactivate" => Some(handle_rules_deactivate(state, req)),
        _ => None,
    }
}
