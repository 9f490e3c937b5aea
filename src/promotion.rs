use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Fixed class progression used by the committer. Promotions may only move a
/// student one step along this chain; SS3 leaves the school entirely.
const CLASS_PROGRESSION: [(&str, &str); 6] = [
    ("JSS1", "JSS2"),
    ("JSS2", "JSS3"),
    ("JSS3", "SS1"),
    ("SS1", "SS2"),
    ("SS2", "SS3"),
    ("SS3", "GRADUATED"),
];

pub const GRADUATED: &str = "GRADUATED";

pub fn next_class_level(current: &str) -> Option<&'static str> {
    CLASS_PROGRESSION
        .iter()
        .find(|(from, _)| *from == current)
        .map(|(_, to)| *to)
}

/// 2-decimal half-up rounding used for cumulative averages:
/// `Int(100*x + 0.5) / 100`
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Secondary-school grading scale (out of 100).
pub fn grade_for_score(score: f64) -> (&'static str, &'static str) {
    if score >= 75.0 {
        ("A", "Excellent")
    } else if score >= 70.0 {
        ("B", "Very Good")
    } else if score >= 60.0 {
        ("C", "Good")
    } else if score >= 50.0 {
        ("D", "Pass")
    } else if score >= 45.0 {
        ("E", "Fair")
    } else {
        ("F", "Fail")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PromotionError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl PromotionError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

pub const STATUS_PROMOTED: &str = "Promoted";
pub const STATUS_CARRYOVER: &str = "Promoted with Carryover";
pub const STATUS_NOT_PROMOTED: &str = "Not Promoted";
pub const STATUS_NO_DATA: &str = "No Data";

/// The rule set in effect for one (session, class level) evaluation,
/// after scope resolution. `source` records which scope supplied it so
/// reports can show what was applied.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveRule {
    pub rule_id: Option<String>,
    /// "class" | "session" | "default"
    pub source: String,
    pub pass_mark: f64,
    pub compulsory_subject_ids: Vec<String>,
    pub min_additional_subjects: i64,
    /// "auto" | "recommend" | "manual"
    pub promotion_mode: String,
    pub allow_carryover: bool,
    pub max_carryover_subjects: i64,
    /// Keys lowercased at load time; lookups are case-insensitive.
    pub category_pass_marks: HashMap<String, f64>,
}

impl EffectiveRule {
    pub fn requires_review(&self) -> bool {
        matches!(self.promotion_mode.as_str(), "recommend" | "manual")
    }

    fn is_compulsory(&self, subject_id: &str) -> bool {
        self.compulsory_subject_ids.iter().any(|id| id == subject_id)
    }

    fn pass_mark_for(&self, category: Option<&str>) -> f64 {
        category
            .and_then(|c| self.category_pass_marks.get(&c.to_ascii_lowercase()))
            .copied()
            .unwrap_or(self.pass_mark)
    }
}

/// Resolve the effective rule: class-scoped rule, else session-global rule,
/// else the hardcoded default. Fails only when the session does not exist.
pub fn resolve_rule(
    conn: &Connection,
    session_id: &str,
    class_level_id: Option<&str>,
) -> Result<EffectiveRule, PromotionError> {
    let session_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?", [session_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| PromotionError::new("db_query_failed", e.to_string()))?;
    if session_exists.is_none() {
        return Err(PromotionError::new("not_found", "session not found"));
    }

    if let Some(class_level_id) = class_level_id {
        if let Some(rule) = load_rule_row(
            conn,
            "SELECT id, pass_mark, compulsory_subject_ids, min_additional_subjects,
                    promotion_mode, allow_carryover, max_carryover_subjects, category_pass_marks
             FROM promotion_rules
             WHERE session_id = ? AND class_level_id = ? AND active = 1
             ORDER BY updated_at DESC
             LIMIT 1",
            rusqlite::params![session_id, class_level_id],
            "class",
        )? {
            return Ok(rule);
        }
    }

    if let Some(rule) = load_rule_row(
        conn,
        "SELECT id, pass_mark, compulsory_subject_ids, min_additional_subjects,
                promotion_mode, allow_carryover, max_carryover_subjects, category_pass_marks
         FROM promotion_rules
         WHERE session_id = ? AND class_level_id IS NULL AND active = 1
         ORDER BY updated_at DESC
         LIMIT 1",
        rusqlite::params![session_id],
        "session",
    )? {
        return Ok(rule);
    }

    default_rule(conn)
}

fn load_rule_row(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    source: &str,
) -> Result<Option<EffectiveRule>, PromotionError> {
    let row: Option<(String, f64, String, i64, String, i64, i64, String)> = conn
        .query_row(sql, params, |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
            ))
        })
        .optional()
        .map_err(|e| PromotionError::new("db_query_failed", e.to_string()))?;

    let Some((id, pass_mark, compulsory_raw, min_additional, mode, carryover, max_carryover, cats_raw)) =
        row
    else {
        return Ok(None);
    };

    let compulsory_subject_ids: Vec<String> = serde_json::from_str(&compulsory_raw)
        .map_err(|e| PromotionError::new("bad_rule", format!("compulsory_subject_ids: {}", e)))?;
    let cats: HashMap<String, f64> = serde_json::from_str(&cats_raw)
        .map_err(|e| PromotionError::new("bad_rule", format!("category_pass_marks: {}", e)))?;
    let category_pass_marks = cats
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect();

    Ok(Some(EffectiveRule {
        rule_id: Some(id),
        source: source.to_string(),
        pass_mark,
        compulsory_subject_ids,
        min_additional_subjects: min_additional,
        promotion_mode: mode,
        allow_carryover: carryover != 0,
        max_carryover_subjects: max_carryover,
        category_pass_marks,
    }))
}

/// Hardcoded fallback when no stored rule covers the scope. The compulsory
/// set is a best-effort lookup of a mathematics and an english subject by
/// name substring; each slot picks its first match by name for determinism.
fn default_rule(conn: &Connection) -> Result<EffectiveRule, PromotionError> {
    let mut compulsory = Vec::new();
    for needle in ["%math%", "%english%"] {
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM subjects
                 WHERE active = 1 AND lower(name) LIKE ?
                 ORDER BY name
                 LIMIT 1",
                [needle],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| PromotionError::new("db_query_failed", e.to_string()))?;
        if let Some(id) = id {
            if !compulsory.contains(&id) {
                compulsory.push(id);
            }
        }
    }

    Ok(EffectiveRule {
        rule_id: None,
        source: "default".to_string(),
        pass_mark: 50.0,
        compulsory_subject_ids: compulsory,
        min_additional_subjects: 5,
        promotion_mode: "recommend".to_string(),
        allow_carryover: false,
        max_carryover_subjects: 2,
        category_pass_marks: HashMap::new(),
    })
}

/// One stored exam result, reduced to what the evaluator reads.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub subject_id: String,
    pub subject_name: String,
    pub category: Option<String>,
    pub total_score: Option<f64>,
    pub cumulative_score: Option<f64>,
    pub grade: String,
    pub cumulative_grade: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectOutcome {
    pub subject_id: String,
    pub subject_name: String,
    pub score: f64,
    pub pass_mark: f64,
    pub grade: String,
    pub passed: bool,
    pub is_compulsory: bool,
}

/// Score one subject against the rule. The cumulative override wins over the
/// raw term total when present; the pass boundary is inclusive.
pub fn evaluate_subject(row: &ResultRow, rule: &EffectiveRule) -> SubjectOutcome {
    let (score, stored_grade) = match row.cumulative_score {
        Some(c) => (c, row.cumulative_grade.clone().unwrap_or_default()),
        None => (row.total_score.unwrap_or(0.0), row.grade.clone()),
    };
    let pass_mark = rule.pass_mark_for(row.category.as_deref());
    let grade = if stored_grade.is_empty() {
        grade_for_score(score).0.to_string()
    } else {
        stored_grade
    };

    SubjectOutcome {
        subject_id: row.subject_id.clone(),
        subject_name: row.subject_name.clone(),
        score,
        pass_mark,
        grade,
        passed: score >= pass_mark,
        is_compulsory: rule.is_compulsory(&row.subject_id),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedElective {
    pub subject_name: String,
    pub score: f64,
    pub pass_mark: f64,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub status: &'static str,
    pub remark: String,
    pub failed_compulsory: Vec<String>,
    pub failed_electives: Vec<FailedElective>,
    pub carryover_eligible: bool,
    pub carryover_subjects: Vec<String>,
}

/// The promotion ladder, first match wins:
/// 1. any failed compulsory sinks the verdict;
/// 2. an elective shortfall promotes with carryover when the rule allows it
///    and the deficit fits, else sinks it;
/// 3. a total-count guard kept for inconsistent configurations;
/// 4. promoted.
pub fn decide(outcomes: &[SubjectOutcome], rule: &EffectiveRule) -> Decision {
    let failed_compulsory: Vec<String> = outcomes
        .iter()
        .filter(|o| o.is_compulsory && !o.passed)
        .map(|o| o.subject_name.clone())
        .collect();
    let failed_electives: Vec<FailedElective> = outcomes
        .iter()
        .filter(|o| !o.is_compulsory && !o.passed)
        .map(|o| FailedElective {
            subject_name: o.subject_name.clone(),
            score: o.score,
            pass_mark: o.pass_mark,
        })
        .collect();

    let comp_passed = outcomes.iter().filter(|o| o.is_compulsory && o.passed).count() as i64;
    let comp_failed = failed_compulsory.len() as i64;
    let other_passed = outcomes
        .iter()
        .filter(|o| !o.is_compulsory && o.passed)
        .count() as i64;
    let compulsory_count = comp_passed + comp_failed;
    let total_min = compulsory_count + rule.min_additional_subjects;

    if comp_failed > 0 {
        return Decision {
            status: STATUS_NOT_PROMOTED,
            remark: format!(
                "Failed compulsory subject(s): {}",
                failed_compulsory.join(", ")
            ),
            failed_compulsory,
            failed_electives,
            carryover_eligible: false,
            carryover_subjects: Vec::new(),
        };
    }

    if other_passed < rule.min_additional_subjects {
        let deficit = rule.min_additional_subjects - other_passed;
        let carryover_eligible = rule.allow_carryover && deficit <= rule.max_carryover_subjects;
        if carryover_eligible {
            // The deficit highest-scoring failed electives, descending by
            // score; ties keep evaluation order (stable sort).
            let mut ranked = failed_electives.clone();
            ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
            let carryover_subjects: Vec<String> = ranked
                .into_iter()
                .take(deficit as usize)
                .map(|f| f.subject_name)
                .collect();
            return Decision {
                status: STATUS_CARRYOVER,
                remark: format!("Promoted with carryover in: {}", carryover_subjects.join(", ")),
                failed_compulsory,
                failed_electives,
                carryover_eligible: true,
                carryover_subjects,
            };
        }
        return Decision {
            status: STATUS_NOT_PROMOTED,
            remark: format!(
                "Passed {} additional, needs {}",
                other_passed, rule.min_additional_subjects
            ),
            failed_compulsory,
            failed_electives,
            carryover_eligible: false,
            carryover_subjects: Vec::new(),
        };
    }

    // Unreachable when branches 1-2 hold, but kept as a guard against
    // inconsistent rule configurations.
    if comp_passed + other_passed < total_min {
        return Decision {
            status: STATUS_NOT_PROMOTED,
            remark: format!(
                "Passed {} of {} required subjects",
                comp_passed + other_passed,
                total_min
            ),
            failed_compulsory,
            failed_electives,
            carryover_eligible: false,
            carryover_subjects: Vec::new(),
        };
    }

    Decision {
        status: STATUS_PROMOTED,
        remark: format!(
            "Passed {} subjects including all compulsory",
            comp_passed + other_passed
        ),
        failed_compulsory,
        failed_electives,
        carryover_eligible: false,
        carryover_subjects: Vec::new(),
    }
}

/// A student row as the evaluator needs it.
#[derive(Debug, Clone)]
pub struct StudentRef {
    pub id: String,
    pub admission_no: String,
    pub last_name: String,
    pub first_name: String,
    pub middle_name: Option<String>,
}

impl StudentRef {
    pub fn full_name(&self) -> String {
        match &self.middle_name {
            Some(m) if !m.is_empty() => {
                format!("{} {} {}", self.first_name, m, self.last_name)
            }
            _ => format!("{} {}", self.first_name, self.last_name),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionVerdict {
    pub student_id: String,
    pub admission_no: String,
    pub full_name: String,
    /// Underlying status, the one statistics count.
    pub promotion_status: String,
    /// Status as shown to humans; carries a pending-review marker when the
    /// rule requires sign-off.
    pub display_status: String,
    pub remark: String,
    pub term_used: Option<String>,
    pub cumulative_average: f64,
    pub compulsory_passed: i64,
    pub compulsory_failed: i64,
    pub additional_passed: i64,
    pub additional_failed: i64,
    pub subjects_count: i64,
    pub subjects: Vec<SubjectOutcome>,
    pub failed_compulsory: Vec<String>,
    pub failed_electives: Vec<FailedElective>,
    pub carryover_eligible: bool,
    pub carryover_subjects: Vec<String>,
}

/// Evaluate one student for the session under the given rule.
///
/// Term selection: terms are ordered newest-first by their per-session
/// `sort_order`; the first term holding at least one result for the student
/// is evaluated and the rest are ignored. A student with no results in any
/// term gets the "No Data" verdict, which is a valid outcome, not an error.
pub fn evaluate_student(
    conn: &Connection,
    student: &StudentRef,
    session_id: &str,
    rule: &EffectiveRule,
) -> Result<PromotionVerdict, PromotionError> {
    let mut stmt = conn
        .prepare(
            "SELECT t.sort_order, t.name,
                    sub.id, sub.name, sub.category,
                    r.total_score, r.cumulative_score, r.grade, r.cumulative_grade
             FROM exam_results r
             JOIN terms t ON t.id = r.term_id
             JOIN subjects sub ON sub.id = r.subject_id
             WHERE r.student_id = ? AND r.session_id = ?
             ORDER BY t.sort_order DESC, sub.name",
        )
        .map_err(|e| PromotionError::new("db_query_failed", e.to_string()))?;

    let rows: Vec<(i64, String, ResultRow)> = stmt
        .query_map(rusqlite::params![student.id, session_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                ResultRow {
                    subject_id: r.get(2)?,
                    subject_name: r.get(3)?,
                    category: r.get(4)?,
                    total_score: r.get(5)?,
                    cumulative_score: r.get(6)?,
                    grade: r.get::<_, Option<String>>(7)?.unwrap_or_default(),
                    cumulative_grade: r.get(8)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| PromotionError::new("db_query_failed", e.to_string()))?;

    let Some((latest_sort, term_name, _)) = rows.first().cloned() else {
        return Ok(PromotionVerdict {
            student_id: student.id.clone(),
            admission_no: student.admission_no.clone(),
            full_name: student.full_name(),
            promotion_status: STATUS_NO_DATA.to_string(),
            display_status: STATUS_NO_DATA.to_string(),
            remark: "No exam results recorded for this session".to_string(),
            term_used: None,
            cumulative_average: 0.0,
            compulsory_passed: 0,
            compulsory_failed: 0,
            additional_passed: 0,
            additional_failed: 0,
            subjects_count: 0,
            subjects: Vec::new(),
            failed_compulsory: Vec::new(),
            failed_electives: Vec::new(),
            carryover_eligible: false,
            carryover_subjects: Vec::new(),
        });
    };

    let outcomes: Vec<SubjectOutcome> = rows
        .iter()
        .filter(|(sort, _, _)| *sort == latest_sort)
        .map(|(_, _, row)| evaluate_subject(row, rule))
        .collect();

    let decision = decide(&outcomes, rule);

    let comp_passed = outcomes.iter().filter(|o| o.is_compulsory && o.passed).count() as i64;
    let comp_failed = outcomes.iter().filter(|o| o.is_compulsory && !o.passed).count() as i64;
    let other_passed = outcomes
        .iter()
        .filter(|o| !o.is_compulsory && o.passed)
        .count() as i64;
    let other_failed = outcomes
        .iter()
        .filter(|o| !o.is_compulsory && !o.passed)
        .count() as i64;

    let sum: f64 = outcomes.iter().map(|o| o.score).sum();
    let cumulative_average = if outcomes.is_empty() {
        0.0
    } else {
        round_off_2_decimals(sum / outcomes.len() as f64)
    };

    let display_status = if rule.requires_review() {
        format!("{} (Pending Review)", decision.status)
    } else {
        decision.status.to_string()
    };

    Ok(PromotionVerdict {
        student_id: student.id.clone(),
        admission_no: student.admission_no.clone(),
        full_name: student.full_name(),
        promotion_status: decision.status.to_string(),
        display_status,
        remark: decision.remark,
        term_used: Some(term_name),
        cumulative_average,
        compulsory_passed: comp_passed,
        compulsory_failed: comp_failed,
        additional_passed: other_passed,
        additional_failed: other_failed,
        subjects_count: outcomes.len() as i64,
        subjects: outcomes,
        failed_compulsory: decision.failed_compulsory,
        failed_electives: decision.failed_electives,
        carryover_eligible: decision.carryover_eligible,
        carryover_subjects: decision.carryover_subjects,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassReport {
    pub class_level: String,
    pub next_class: Option<String>,
    pub session: String,
    pub total_students: i64,
    pub promoted_count: i64,
    pub carryover_count: i64,
    pub not_promoted_count: i64,
    pub no_data_count: i64,
    pub applied_rule: EffectiveRule,
    pub students: Vec<PromotionVerdict>,
}

/// Evaluate every active student of the class level for the session.
///
/// Students are evaluated in (last_name, first_name) order, then re-sorted by
/// cumulative average descending; the sort is stable so equal averages keep
/// name order. Counts tally the underlying status, never the display string.
pub fn build_class_report(
    conn: &Connection,
    class_level_name: &str,
    session_id: &str,
) -> Result<ClassReport, PromotionError> {
    let class_level_id: Option<String> = conn
        .query_row(
            "SELECT id FROM class_levels WHERE name = ?",
            [class_level_name],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| PromotionError::new("db_query_failed", e.to_string()))?;
    let Some(class_level_id) = class_level_id else {
        return Err(PromotionError::new("not_found", "class level not found"));
    };

    let session_name: Option<String> = conn
        .query_row("SELECT name FROM sessions WHERE id = ?", [session_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| PromotionError::new("db_query_failed", e.to_string()))?;
    let Some(session_name) = session_name else {
        return Err(PromotionError::new("not_found", "session not found"));
    };

    let rule = resolve_rule(conn, session_id, Some(&class_level_id))?;

    let mut stmt = conn
        .prepare(
            "SELECT id, admission_no, last_name, first_name, middle_name
             FROM students
             WHERE class_level_id = ? AND active = 1
             ORDER BY last_name, first_name",
        )
        .map_err(|e| PromotionError::new("db_query_failed", e.to_string()))?;
    let students: Vec<StudentRef> = stmt
        .query_map([&class_level_id], |r| {
            Ok(StudentRef {
                id: r.get(0)?,
                admission_no: r.get(1)?,
                last_name: r.get(2)?,
                first_name: r.get(3)?,
                middle_name: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| PromotionError::new("db_query_failed", e.to_string()))?;

    let mut verdicts = Vec::with_capacity(students.len());
    for student in &students {
        verdicts.push(evaluate_student(conn, student, session_id, &rule)?);
    }
    verdicts.sort_by(|a, b| {
        b.cumulative_average
            .partial_cmp(&a.cumulative_average)
            .unwrap_or(Ordering::Equal)
    });

    let mut promoted = 0_i64;
    let mut carryover = 0_i64;
    let mut not_promoted = 0_i64;
    let mut no_data = 0_i64;
    for v in &verdicts {
        match v.promotion_status.as_str() {
            STATUS_PROMOTED => promoted += 1,
            STATUS_CARRYOVER => carryover += 1,
            STATUS_NOT_PROMOTED => not_promoted += 1,
            _ => no_data += 1,
        }
    }

    Ok(ClassReport {
        class_level: class_level_name.to_string(),
        next_class: next_class_level(class_level_name).map(|s| s.to_string()),
        session: session_name,
        total_students: verdicts.len() as i64,
        promoted_count: promoted,
        carryover_count: carryover,
        not_promoted_count: not_promoted,
        no_data_count: no_data,
        applied_rule: rule,
        students: verdicts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use uuid::Uuid;

    fn plain_rule(min_additional: i64) -> EffectiveRule {
        EffectiveRule {
            rule_id: None,
            source: "class".to_string(),
            pass_mark: 50.0,
            compulsory_subject_ids: vec!["math".to_string(), "english".to_string()],
            min_additional_subjects: min_additional,
            promotion_mode: "auto".to_string(),
            allow_carryover: false,
            max_carryover_subjects: 2,
            category_pass_marks: HashMap::new(),
        }
    }

    fn row(id: &str, name: &str, total: f64) -> ResultRow {
        ResultRow {
            subject_id: id.to_string(),
            subject_name: name.to_string(),
            category: None,
            total_score: Some(total),
            cumulative_score: None,
            grade: String::new(),
            cumulative_grade: None,
        }
    }

    fn outcomes_for(scores: &[(&str, &str, f64)], rule: &EffectiveRule) -> Vec<SubjectOutcome> {
        scores
            .iter()
            .map(|(id, name, total)| evaluate_subject(&row(id, name, *total), rule))
            .collect()
    }

    #[test]
    fn round_off_half_up_at_two_decimals() {
        assert_eq!(round_off_2_decimals(0.0), 0.0);
        assert_eq!(round_off_2_decimals(60.714285), 60.71);
        assert_eq!(round_off_2_decimals(60.715), 60.72);
        assert_eq!(round_off_2_decimals(49.995), 50.0);
    }

    #[test]
    fn grade_scale_boundaries() {
        assert_eq!(grade_for_score(75.0), ("A", "Excellent"));
        assert_eq!(grade_for_score(74.9), ("B", "Very Good"));
        assert_eq!(grade_for_score(70.0), ("B", "Very Good"));
        assert_eq!(grade_for_score(60.0), ("C", "Good"));
        assert_eq!(grade_for_score(50.0), ("D", "Pass"));
        assert_eq!(grade_for_score(45.0), ("E", "Fair"));
        assert_eq!(grade_for_score(44.9), ("F", "Fail"));
    }

    #[test]
    fn progression_table_is_fixed() {
        assert_eq!(next_class_level("JSS1"), Some("JSS2"));
        assert_eq!(next_class_level("JSS3"), Some("SS1"));
        assert_eq!(next_class_level("SS3"), Some("GRADUATED"));
        assert_eq!(next_class_level("GRADUATED"), None);
        assert_eq!(next_class_level("PRIMARY6"), None);
    }

    #[test]
    fn subject_score_prefers_cumulative_override() {
        let rule = plain_rule(5);
        let mut r = row("math", "Mathematics", 40.0);
        r.cumulative_score = Some(55.0);
        r.cumulative_grade = Some("D".to_string());
        let o = evaluate_subject(&r, &rule);
        assert_eq!(o.score, 55.0);
        assert_eq!(o.grade, "D");
        assert!(o.passed);
        assert!(o.is_compulsory);
    }

    #[test]
    fn pass_boundary_is_inclusive() {
        let rule = plain_rule(5);
        let o = evaluate_subject(&row("bio", "Biology", 50.0), &rule);
        assert!(o.passed);
        let o = evaluate_subject(&row("bio", "Biology", 49.99), &rule);
        assert!(!o.passed);
    }

    #[test]
    fn category_pass_mark_override_is_case_insensitive() {
        let mut rule = plain_rule(5);
        rule.category_pass_marks.insert("vocational".to_string(), 40.0);
        let mut r = row("craft", "Basic Craft", 42.0);
        r.category = Some("Vocational".to_string());
        let o = evaluate_subject(&r, &rule);
        assert_eq!(o.pass_mark, 40.0);
        assert!(o.passed);
    }

    #[test]
    fn missing_total_counts_as_zero() {
        let rule = plain_rule(5);
        let mut r = row("bio", "Biology", 0.0);
        r.total_score = None;
        let o = evaluate_subject(&r, &rule);
        assert_eq!(o.score, 0.0);
        assert!(!o.passed);
    }

    // Math=60 English=55 Sci=70 Bio=40 Chem=80 Geo=90 Lit=30: both compulsory
    // pass, three of five electives pass.
    fn seven_subject_scores() -> Vec<(&'static str, &'static str, f64)> {
        vec![
            ("math", "Mathematics", 60.0),
            ("english", "English Language", 55.0),
            ("sci", "Basic Science", 70.0),
            ("bio", "Biology", 40.0),
            ("chem", "Chemistry", 80.0),
            ("geo", "Geography", 90.0),
            ("lit", "Literature", 30.0),
        ]
    }

    #[test]
    fn elective_deficit_without_carryover_is_not_promoted() {
        let rule = plain_rule(5);
        let outcomes = outcomes_for(&seven_subject_scores(), &rule);
        let d = decide(&outcomes, &rule);
        assert_eq!(d.status, STATUS_NOT_PROMOTED);
        assert_eq!(d.remark, "Passed 3 additional, needs 5");
        assert!(d.carryover_subjects.is_empty());
    }

    #[test]
    fn carryover_picks_highest_scoring_failed_electives_in_order() {
        let mut rule = plain_rule(5);
        rule.allow_carryover = true;
        rule.max_carryover_subjects = 2;
        let outcomes = outcomes_for(&seven_subject_scores(), &rule);
        let d = decide(&outcomes, &rule);
        assert_eq!(d.status, STATUS_CARRYOVER);
        assert_eq!(d.carryover_subjects, vec!["Biology", "Literature"]);
        assert!(d.carryover_eligible);
    }

    #[test]
    fn deficit_beyond_max_carryover_is_not_promoted() {
        let mut rule = plain_rule(5);
        rule.allow_carryover = true;
        rule.max_carryover_subjects = 1;
        let outcomes = outcomes_for(&seven_subject_scores(), &rule);
        let d = decide(&outcomes, &rule);
        assert_eq!(d.status, STATUS_NOT_PROMOTED);
        assert!(!d.carryover_eligible);
    }

    #[test]
    fn any_failed_compulsory_sinks_the_verdict() {
        let rule = plain_rule(2);
        let outcomes = outcomes_for(
            &[
                ("math", "Mathematics", 45.0),
                ("english", "English Language", 90.0),
                ("sci", "Basic Science", 95.0),
                ("geo", "Geography", 99.0),
                ("chem", "Chemistry", 88.0),
            ],
            &rule,
        );
        let d = decide(&outcomes, &rule);
        assert_eq!(d.status, STATUS_NOT_PROMOTED);
        assert_eq!(d.failed_compulsory, vec!["Mathematics"]);
        assert!(d.remark.contains("Mathematics"));
    }

    #[test]
    fn all_requirements_met_is_promoted() {
        let rule = plain_rule(3);
        let outcomes = outcomes_for(
            &[
                ("math", "Mathematics", 60.0),
                ("english", "English Language", 55.0),
                ("sci", "Basic Science", 70.0),
                ("chem", "Chemistry", 80.0),
                ("geo", "Geography", 90.0),
            ],
            &rule,
        );
        let d = decide(&outcomes, &rule);
        assert_eq!(d.status, STATUS_PROMOTED);
        assert_eq!(d.remark, "Passed 5 subjects including all compulsory");
    }

    #[test]
    fn carryover_tie_keeps_evaluation_order() {
        let mut rule = plain_rule(3);
        rule.allow_carryover = true;
        rule.max_carryover_subjects = 2;
        let outcomes = outcomes_for(
            &[
                ("math", "Mathematics", 60.0),
                ("english", "English Language", 55.0),
                ("agr", "Agriculture", 40.0),
                ("art", "Fine Art", 40.0),
                ("sci", "Basic Science", 70.0),
            ],
            &rule,
        );
        let d = decide(&outcomes, &rule);
        assert_eq!(d.status, STATUS_CARRYOVER);
        assert_eq!(d.carryover_subjects, vec!["Agriculture", "Fine Art"]);
    }

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    fn insert_session(conn: &Connection, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO sessions(id, name, start_date, end_date, is_current)
             VALUES(?, ?, '2025-09-01', '2026-07-31', 1)",
            (&id, name),
        )
        .expect("insert session");
        id
    }

    fn insert_term(conn: &Connection, session_id: &str, name: &str, sort_order: i64) -> String {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO terms(id, session_id, name, sort_order) VALUES(?, ?, ?, ?)",
            (&id, session_id, name, sort_order),
        )
        .expect("insert term");
        id
    }

    fn insert_subject(conn: &Connection, name: &str, code: &str) -> String {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO subjects(id, name, code, active) VALUES(?, ?, ?, 1)",
            (&id, name, code),
        )
        .expect("insert subject");
        id
    }

    fn insert_student(conn: &Connection, last: &str, first: &str) -> StudentRef {
        let id = Uuid::new_v4().to_string();
        let admission = format!("STU/2025/{}", &id[..4]);
        conn.execute(
            "INSERT INTO students(id, admission_no, last_name, first_name, active)
             VALUES(?, ?, ?, ?, 1)",
            (&id, &admission, last, first),
        )
        .expect("insert student");
        StudentRef {
            id,
            admission_no: admission,
            last_name: last.to_string(),
            first_name: first.to_string(),
            middle_name: None,
        }
    }

    fn insert_result(
        conn: &Connection,
        student_id: &str,
        subject_id: &str,
        session_id: &str,
        term_id: &str,
        total: f64,
    ) {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO exam_results(id, student_id, subject_id, session_id, term_id, total_score, grade)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (&id, student_id, subject_id, session_id, term_id, total, grade_for_score(total).0),
        )
        .expect("insert result");
    }

    #[test]
    fn default_rule_finds_math_and_english_by_substring() {
        let conn = mem_conn();
        let session = insert_session(&conn, "2025/2026");
        let math = insert_subject(&conn, "Further Mathematics", "FMT");
        let eng = insert_subject(&conn, "English Language", "ENG");
        insert_subject(&conn, "Biology", "BIO");

        let rule = resolve_rule(&conn, &session, None).expect("resolve");
        assert_eq!(rule.source, "default");
        assert_eq!(rule.rule_id, None);
        assert_eq!(rule.pass_mark, 50.0);
        assert_eq!(rule.min_additional_subjects, 5);
        assert_eq!(rule.promotion_mode, "recommend");
        assert!(!rule.allow_carryover);
        assert_eq!(rule.compulsory_subject_ids, vec![math, eng]);
    }

    #[test]
    fn resolve_rule_unknown_session_is_an_error() {
        let conn = mem_conn();
        let err = resolve_rule(&conn, "missing", None).unwrap_err();
        assert_eq!(err.code, "not_found");
    }

    #[test]
    fn class_rule_shadows_session_global_rule() {
        let conn = mem_conn();
        let session = insert_session(&conn, "2025/2026");
        conn.execute(
            "INSERT INTO class_levels(id, name, sort_order) VALUES('cl1', 'JSS1', 1)",
            [],
        )
        .expect("insert class level");

        conn.execute(
            "INSERT INTO promotion_rules(id, session_id, class_level_id, pass_mark,
                compulsory_subject_ids, min_additional_subjects, promotion_mode,
                allow_carryover, max_carryover_subjects, category_pass_marks, active, updated_at)
             VALUES('r-global', ?, NULL, 45, '[]', 4, 'auto', 0, 0, '{}', 1, '2026-01-01T00:00:00Z')",
            [&session],
        )
        .expect("insert global rule");
        conn.execute(
            "INSERT INTO promotion_rules(id, session_id, class_level_id, pass_mark,
                compulsory_subject_ids, min_additional_subjects, promotion_mode,
                allow_carryover, max_carryover_subjects, category_pass_marks, active, updated_at)
             VALUES('r-class', ?, 'cl1', 55, '[]', 6, 'manual', 1, 3, '{\"CORE\": 60}', 1, '2026-01-02T00:00:00Z')",
            [&session],
        )
        .expect("insert class rule");

        let rule = resolve_rule(&conn, &session, Some("cl1")).expect("resolve class");
        assert_eq!(rule.source, "class");
        assert_eq!(rule.rule_id.as_deref(), Some("r-class"));
        assert_eq!(rule.pass_mark, 55.0);
        assert_eq!(rule.category_pass_marks.get("core"), Some(&60.0));

        let rule = resolve_rule(&conn, &session, None).expect("resolve global");
        assert_eq!(rule.source, "session");
        assert_eq!(rule.rule_id.as_deref(), Some("r-global"));

        // Deactivated class rule falls through to the session-global one.
        conn.execute("UPDATE promotion_rules SET active = 0 WHERE id = 'r-class'", [])
            .expect("deactivate");
        let rule = resolve_rule(&conn, &session, Some("cl1")).expect("resolve after deactivate");
        assert_eq!(rule.source, "session");
    }

    #[test]
    fn newest_term_with_results_wins() {
        let conn = mem_conn();
        let session = insert_session(&conn, "2025/2026");
        let t1 = insert_term(&conn, &session, "First Term", 0);
        let t2 = insert_term(&conn, &session, "Second Term", 1);
        let math = insert_subject(&conn, "Mathematics", "MTH");
        let student = insert_student(&conn, "Adeyemi", "Kemi");

        insert_result(&conn, &student.id, &math, &session, &t1, 90.0);
        insert_result(&conn, &student.id, &math, &session, &t2, 40.0);

        let mut rule = plain_rule(0);
        rule.compulsory_subject_ids = vec![math.clone()];
        let verdict = evaluate_student(&conn, &student, &session, &rule).expect("evaluate");
        assert_eq!(verdict.term_used.as_deref(), Some("Second Term"));
        assert_eq!(verdict.subjects_count, 1);
        // The first-term 90 must not leak in; the newest term's 40 fails.
        assert_eq!(verdict.promotion_status, STATUS_NOT_PROMOTED);
        assert_eq!(verdict.cumulative_average, 40.0);
    }

    #[test]
    fn no_results_in_any_term_is_no_data() {
        let conn = mem_conn();
        let session = insert_session(&conn, "2025/2026");
        insert_term(&conn, &session, "First Term", 0);
        let student = insert_student(&conn, "Balogun", "Tunde");

        let rule = plain_rule(5);
        let verdict = evaluate_student(&conn, &student, &session, &rule).expect("evaluate");
        assert_eq!(verdict.promotion_status, STATUS_NO_DATA);
        assert_eq!(verdict.display_status, STATUS_NO_DATA);
        assert_eq!(verdict.cumulative_average, 0.0);
        assert_eq!(verdict.subjects_count, 0);
        assert!(verdict.subjects.is_empty());
        assert_eq!(verdict.term_used, None);
    }

    #[test]
    fn pending_review_decorates_display_only() {
        let conn = mem_conn();
        let session = insert_session(&conn, "2025/2026");
        let t1 = insert_term(&conn, &session, "First Term", 0);
        let math = insert_subject(&conn, "Mathematics", "MTH");
        let student = insert_student(&conn, "Chukwu", "Ada");
        insert_result(&conn, &student.id, &math, &session, &t1, 80.0);

        let mut rule = plain_rule(0);
        rule.compulsory_subject_ids = vec![math];
        rule.promotion_mode = "recommend".to_string();
        let verdict = evaluate_student(&conn, &student, &session, &rule).expect("evaluate");
        assert_eq!(verdict.promotion_status, STATUS_PROMOTED);
        assert_eq!(verdict.display_status, "Promoted (Pending Review)");
    }

    #[test]
    fn class_report_sorts_by_average_and_counts_underlying_status() {
        let conn = mem_conn();
        let session = insert_session(&conn, "2025/2026");
        let t1 = insert_term(&conn, &session, "First Term", 0);
        conn.execute(
            "INSERT INTO class_levels(id, name, sort_order) VALUES('cl1', 'JSS1', 1)",
            [],
        )
        .expect("insert class level");
        let math = insert_subject(&conn, "Mathematics", "MTH");
        conn.execute(
            "INSERT INTO promotion_rules(id, session_id, class_level_id, pass_mark,
                compulsory_subject_ids, min_additional_subjects, promotion_mode,
                allow_carryover, max_carryover_subjects, category_pass_marks, active, updated_at)
             VALUES('r1', ?, 'cl1', 50, ?, 0, 'recommend', 0, 0, '{}', 1, '2026-01-01T00:00:00Z')",
            (&session, format!("[\"{}\"]", math)),
        )
        .expect("insert rule");

        let a = insert_student(&conn, "Abiodun", "Sade");
        let b = insert_student(&conn, "Bello", "Musa");
        let c = insert_student(&conn, "Danladi", "Amina");
        for s in [&a, &b, &c] {
            conn.execute(
                "UPDATE students SET class_level_id = 'cl1' WHERE id = ?",
                [&s.id],
            )
            .expect("assign class");
        }
        insert_result(&conn, &a.id, &math, &session, &t1, 40.0);
        insert_result(&conn, &b.id, &math, &session, &t1, 85.0);
        // c has no results at all.

        let report = build_class_report(&conn, "JSS1", &session).expect("report");
        assert_eq!(report.total_students, 3);
        assert_eq!(report.next_class.as_deref(), Some("JSS2"));
        assert_eq!(report.promoted_count, 1);
        assert_eq!(report.not_promoted_count, 1);
        assert_eq!(report.no_data_count, 1);
        assert_eq!(report.applied_rule.source, "class");

        // 85 first, then 40, then the no-data student at 0.
        let order: Vec<&str> = report
            .students
            .iter()
            .map(|v| v.admission_no.as_str())
            .collect();
        assert_eq!(order[0], b.admission_no);
        assert_eq!(order[1], a.admission_no);
        assert_eq!(order[2], c.admission_no);
        // Display is decorated, the counted status is not.
        assert_eq!(report.students[0].display_status, "Promoted (Pending Review)");
        assert_eq!(report.students[0].promotion_status, STATUS_PROMOTED);
    }

    #[test]
    fn report_unknown_class_or_session_is_an_error() {
        let conn = mem_conn();
        let session = insert_session(&conn, "2025/2026");
        assert_eq!(
            build_class_report(&conn, "JSS9", &session).unwrap_err().code,
            "not_found"
        );
        conn.execute(
            "INSERT INTO class_levels(id, name, sort_order) VALUES('cl1', 'JSS1', 1)",
            [],
        )
        .expect("insert class level");
        assert_eq!(
            build_class_report(&conn, "JSS1", "missing").unwrap_err().code,
            "not_found"
        );
    }
}
