use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::promotion::{grade_for_score, round_off_2_decimals};
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

fn get_required_num(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing or non-numeric {}", key),
            details: None,
        })
}

fn row_exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })
}

fn results_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let session_id = get_required_str(params, "sessionId")?;
    let term_id = get_required_str(params, "termId")?;
    let ca_score = get_required_num(params, "caScore")?;
    let theory_score = get_required_num(params, "theoryScore")?;
    let exam_score = get_required_num(params, "examScore")?;
    if ca_score < 0.0 || theory_score < 0.0 || exam_score < 0.0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "scores must not be negative".to_string(),
            details: None,
        });
    }
    let cumulative_score = match params.get("cumulativeScore") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(v.as_f64().ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "cumulativeScore must be a number or null".to_string(),
            details: None,
        })?),
    };

    if !row_exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }
    if !row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: None,
        });
    }
    let term_session: Option<String> = conn
        .query_row("SELECT session_id FROM terms WHERE id = ?", [&term_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(term_session) = term_session else {
        return Err(HandlerErr {
            code: "not_found",
            message: "term not found".to_string(),
            details: None,
        });
    };
    if term_session != session_id {
        return Err(HandlerErr {
            code: "bad_params",
            message: "term does not belong to session".to_string(),
            details: None,
        });
    }

    let total = ca_score + theory_score + exam_score;
    let (grade, remark) = grade_for_score(total);
    let cumulative_grade = cumulative_score.map(|c| grade_for_score(c).0);

    let result_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exam_results(
            id, student_id, subject_id, session_id, term_id,
            ca_score, theory_score, exam_score, total_score, grade, remark,
            cumulative_score, cumulative_grade, uploaded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
         ON CONFLICT(student_id, subject_id, session_id, term_id) DO UPDATE SET
           ca_score = excluded.ca_score,
           theory_score = excluded.theory_score,
           exam_score = excluded.exam_score,
           total_score = excluded.total_score,
           grade = excluded.grade,
           remark = excluded.remark,
           cumulative_score = excluded.cumulative_score,
           cumulative_grade = excluded.cumulative_grade,
           uploaded_at = excluded.uploaded_at",
        rusqlite::params![
            result_id,
            student_id,
            subject_id,
            session_id,
            term_id,
            ca_score,
            theory_score,
            exam_score,
            total,
            grade,
            remark,
            cumulative_score,
            cumulative_grade,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "exam_results" })),
    })?;

    // On conflict the original row id survives; read it back.
    let stored_id: String = conn
        .query_row(
            "SELECT id FROM exam_results
             WHERE student_id = ? AND subject_id = ? AND session_id = ? AND term_id = ?",
            rusqlite::params![student_id, subject_id, session_id, term_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({
        "resultId": stored_id,
        "totalScore": total,
        "grade": grade,
        "remark": remark,
        "cumulativeGrade": cumulative_grade,
    }))
}

fn results_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let student_id = params.get("studentId").and_then(|v| v.as_str());
    let term_id = params.get("termId").and_then(|v| v.as_str());
    let class_level_id = params.get("classLevelId").and_then(|v| v.as_str());

    let mut sql = String::from(
        "SELECT r.id, r.student_id, sub.id, sub.name, sub.code, r.term_id, t.name,
                r.ca_score, r.theory_score, r.exam_score, r.total_score,
                r.grade, r.remark, r.cumulative_score, r.cumulative_grade,
                r.position, r.class_average, r.total_students,
                r.highest_score, r.lowest_score, r.uploaded_at
         FROM exam_results r
         JOIN subjects sub ON sub.id = r.subject_id
         JOIN terms t ON t.id = r.term_id
         WHERE r.session_id = ?",
    );
    let mut binds: Vec<SqlValue> = vec![SqlValue::Text(session_id)];
    if let Some(v) = student_id {
        sql.push_str(" AND r.student_id = ?");
        binds.push(SqlValue::Text(v.to_string()));
    }
    if let Some(v) = term_id {
        sql.push_str(" AND r.term_id = ?");
        binds.push(SqlValue::Text(v.to_string()));
    }
    if let Some(v) = class_level_id {
        sql.push_str(
            " AND r.student_id IN (SELECT id FROM students WHERE class_level_id = ?)",
        );
        binds.push(SqlValue::Text(v.to_string()));
    }
    sql.push_str(" ORDER BY t.sort_order, sub.name");

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let results = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "subjectId": r.get::<_, String>(2)?,
                "subjectName": r.get::<_, String>(3)?,
                "subjectCode": r.get::<_, String>(4)?,
                "termId": r.get::<_, String>(5)?,
                "termName": r.get::<_, String>(6)?,
                "caScore": r.get::<_, f64>(7)?,
                "theoryScore": r.get::<_, f64>(8)?,
                "examScore": r.get::<_, f64>(9)?,
                "totalScore": r.get::<_, f64>(10)?,
                "grade": r.get::<_, String>(11)?,
                "remark": r.get::<_, String>(12)?,
                "cumulativeScore": r.get::<_, Option<f64>>(13)?,
                "cumulativeGrade": r.get::<_, Option<String>>(14)?,
                "position": r.get::<_, Option<i64>>(15)?,
                "classAverage": r.get::<_, Option<f64>>(16)?,
                "totalStudents": r.get::<_, Option<i64>>(17)?,
                "highestScore": r.get::<_, Option<f64>>(18)?,
                "lowestScore": r.get::<_, Option<f64>>(19)?,
                "uploadedAt": r.get::<_, Option<String>>(20)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "results": results }))
}

/// Rank every (class level, subject) group of a session+term and stamp
/// position plus the class statistics onto each row. Ties share a position
/// and the next rank skips past them. classLevelId narrows the run to one
/// class; without it every class with results in the term is reworked.
fn results_recalculate_positions(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let term_id = get_required_str(params, "termId")?;
    let class_level_id = params
        .get("classLevelId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(id) = &class_level_id {
        if !row_exists(conn, "SELECT 1 FROM class_levels WHERE id = ?", id)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "class level not found".to_string(),
                details: None,
            });
        }
    }
    if !row_exists(conn, "SELECT 1 FROM sessions WHERE id = ?", &session_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "session not found".to_string(),
            details: None,
        });
    }
    if !row_exists(conn, "SELECT 1 FROM terms WHERE id = ?", &term_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "term not found".to_string(),
            details: None,
        });
    }

    let mut sql = String::from(
        "SELECT r.id, s.class_level_id, r.subject_id, r.total_score
         FROM exam_results r
         JOIN students s ON s.id = r.student_id
         WHERE s.active = 1 AND s.class_level_id IS NOT NULL
           AND r.session_id = ? AND r.term_id = ?",
    );
    let mut binds: Vec<SqlValue> = vec![SqlValue::Text(session_id), SqlValue::Text(term_id)];
    if let Some(id) = class_level_id {
        sql.push_str(" AND s.class_level_id = ?");
        binds.push(SqlValue::Text(id));
    }
    sql.push_str(" ORDER BY s.class_level_id, r.subject_id, r.total_score DESC");

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let rows: Vec<(String, String, String, f64)> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut subjects_processed = 0_i64;
    let mut results_updated = 0_i64;
    let mut i = 0;
    while i < rows.len() {
        let class_id = rows[i].1.clone();
        let subject_id = rows[i].2.clone();
        let mut j = i;
        while j < rows.len() && rows[j].1 == class_id && rows[j].2 == subject_id {
            j += 1;
        }
        let group = &rows[i..j];
        let count = group.len() as i64;
        let sum: f64 = group.iter().map(|(_, _, _, s)| s).sum();
        let class_average = round_off_2_decimals(sum / count as f64);
        let highest = group[0].3;
        let lowest = group[group.len() - 1].3;

        let mut position = 0_i64;
        let mut prev_score = f64::NAN;
        for (rank, (result_id, _, _, score)) in group.iter().enumerate() {
            if *score != prev_score {
                position = rank as i64 + 1;
                prev_score = *score;
            }
            if let Err(e) = tx.execute(
                "UPDATE exam_results
                 SET position = ?, class_average = ?, total_students = ?,
                     highest_score = ?, lowest_score = ?
                 WHERE id = ?",
                rusqlite::params![position, class_average, count, highest, lowest, result_id],
            ) {
                let _ = tx.rollback();
                return Err(HandlerErr {
                    code: "db_update_failed",
                    message: e.to_string(),
                    details: Some(json!({ "table": "exam_results" })),
                });
            }
            results_updated += 1;
        }
        subjects_processed += 1;
        i = j;
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "subjectsProcessed": subjects_processed,
        "resultsUpdated": results_updated,
    }))
}

fn handle_results_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match results_upsert(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match results_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_results_recalculate_positions(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match results_recalculate_positions(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.upsert" => Some(handle_results_upsert(state, req)),
        "results.list" => Some(handle_results_list(state, req)),
        "results.recalculatePositions" => Some(handle_results_recalculate_positions(state, req)),
        _ => None,
    }
}
