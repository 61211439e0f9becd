use crate::ipc::error::{err, err_scoring, ok};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, RankEntry, Status, SubjectScore, Term};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn subjects_for_result(
    conn: &Connection,
    result_id: &str,
) -> Result<Vec<serde_json::Value>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT name, ca1, ca2, exam, total, grade, remark
         FROM result_subjects
         WHERE result_id = ?
         ORDER BY idx",
    )?;
    stmt.query_map([result_id], |row| {
        Ok(json!({
            "name": row.get::<_, String>(0)?,
            "ca1": row.get::<_, i64>(1)?,
            "ca2": row.get::<_, i64>(2)?,
            "exam": row.get::<_, i64>(3)?,
            "total": row.get::<_, i64>(4)?,
            "grade": row.get::<_, String>(5)?,
            "remark": row.get::<_, Option<String>>(6)?
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

fn approved_scope(
    conn: &Connection,
    class_id: &str,
    term: &str,
    session: &str,
) -> Result<Vec<RankEntry>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, total_score
         FROM results
         WHERE class_id = ? AND term = ? AND session = ? AND status = 'APPROVED'",
    )?;
    stmt.query_map((class_id, term, session), |row| {
        Ok(RankEntry {
            result_id: row.get(0)?,
            student_id: row.get(1)?,
            total_score: row.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

fn handle_results_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let term = match req.params.get("term").and_then(|v| v.as_str()) {
        Some(v) => match Term::parse(v) {
            Some(t) => t,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "term must be first, second or third",
                    None,
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing term", None),
    };
    let session = match req.params.get("session").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing session", None),
    };
    if !scoring::session_name_is_valid(&session) {
        return err(
            &req.id,
            "bad_params",
            "session must be consecutive years in YYYY/YYYY form",
            Some(json!({ "session": session })),
        );
    }
    let submitted_by = match req.params.get("submittedBy").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing submittedBy", None),
    };
    let Some(raw_subjects) = req.params.get("subjects").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing subjects array", None);
    };

    // Denormalized placement is taken from the student row at submission time.
    let placement: Option<(String, String)> = match conn
        .query_row(
            "SELECT class_id, arm FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((class_id, arm)) = placement else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let teacher_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&submitted_by], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if teacher_exists.is_none() {
        return err(&req.id, "not_found", "submitting teacher not found", None);
    }

    let mut scored: Vec<SubjectScore> = Vec::with_capacity(raw_subjects.len());
    for (i, raw) in raw_subjects.iter().enumerate() {
        let Some(obj) = raw.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("subjects[{}] must be an object", i),
                None,
            );
        };
        let name = match obj.get("name").and_then(|v| v.as_str()) {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("subjects[{}] missing name", i),
                    None,
                )
            }
        };
        if scored.iter().any(|s| s.name.eq_ignore_ascii_case(&name)) {
            return err(
                &req.id,
                "bad_params",
                format!("subject '{}' listed more than once", name),
                None,
            );
        }
        let mark = |field: &str| -> Option<i64> { obj.get(field).and_then(|v| v.as_i64()) };
        let (Some(ca1), Some(ca2), Some(exam)) = (mark("ca1"), mark("ca2"), mark("exam")) else {
            return err(
                &req.id,
                "bad_params",
                format!("subjects[{}] needs integer ca1, ca2 and exam", i),
                None,
            );
        };
        match scoring::score_subject(&name, ca1, ca2, exam) {
            Ok(s) => scored.push(s),
            Err(e) => return err_scoring(&req.id, e),
        }
    }

    let (total_score, average_score) = match scoring::result_totals(&scored) {
        Ok(v) => v,
        Err(e) => return err_scoring(&req.id, e),
    };

    // No overwrite: a live (PENDING or APPROVED) result for the same
    // (student, term, session) blocks submission. A REJECTED one does not.
    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM results
             WHERE student_id = ? AND term = ? AND session = ?
               AND status IN ('PENDING', 'APPROVED')",
            (&student_id, term.as_str(), &session),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(existing_id) = existing {
        return err(
            &req.id,
            "conflict",
            "result already exists for this student, term and session",
            Some(json!({ "resultId": existing_id })),
        );
    }

    let result_id = Uuid::new_v4().to_string();
    let submitted_at = Utc::now().to_rfc3339();

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO results(id, student_id, class_id, arm, term, session,
                             total_score, average_score, status,
                             submitted_by, submitted_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', ?, ?)",
        (
            &result_id,
            &student_id,
            &class_id,
            &arm,
            term.as_str(),
            &session,
            total_score,
            average_score,
            &submitted_by,
            &submitted_at,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "results" })),
        );
    }
    for (idx, s) in scored.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO result_subjects(id, result_id, idx, name, ca1, ca2, exam, total, grade, remark)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &result_id,
                idx as i64,
                &s.name,
                s.ca1,
                s.ca2,
                s.exam,
                s.total,
                &s.grade,
                &s.remark,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "result_subjects" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "resultId": result_id,
            "status": Status::Pending.as_str(),
            "totalScore": total_score,
            "averageScore": average_score
        }),
    )
}

fn handle_results_review(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let result_id = match req.params.get("resultId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing resultId", None),
    };
    let requested = match req.params.get("status").and_then(|v| v.as_str()) {
        Some(v) => match Status::parse(v) {
            Some(Status::Approved) => Status::Approved,
            Some(Status::Rejected) => Status::Rejected,
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "status must be APPROVED or REJECTED",
                    None,
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing status", None),
    };
    let reviewed_by = match req.params.get("reviewedBy").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing reviewedBy", None),
    };
    let remark_param = |key: &str| -> Option<String> {
        req.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let row: Option<(String, String, String, String, f64)> = match conn
        .query_row(
            "SELECT class_id, term, session, status, average_score
             FROM results WHERE id = ?",
            [&result_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((class_id, term, session, status_raw, average_score)) = row else {
        return err(&req.id, "not_found", "result not found", None);
    };
    if Status::parse(&status_raw) != Some(Status::Pending) {
        return err(
            &req.id,
            "invalid_state",
            format!("result is already {}; transitions are one-shot", status_raw),
            None,
        );
    }

    let reviewed_at = Utc::now().to_rfc3339();

    // The status flip, the scope read and the rank write share one
    // transaction so two concurrent approvals in the same scope cannot
    // compute from a snapshot missing each other.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    match requested {
        Status::Rejected => {
            if let Err(e) = tx.execute(
                "UPDATE results
                 SET status = 'REJECTED',
                     class_teacher_remark = ?,
                     principal_remark = ?,
                     recommendation = ?,
                     approved_by = ?,
                     approved_at = ?
                 WHERE id = ?",
                (
                    remark_param("classTeacherRemark"),
                    remark_param("principalRemark"),
                    remark_param("recommendation"),
                    &reviewed_by,
                    &reviewed_at,
                    &result_id,
                ),
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            if let Err(e) = tx.commit() {
                return err(&req.id, "db_commit_failed", e.to_string(), None);
            }
            ok(
                &req.id,
                json!({
                    "resultId": result_id,
                    "status": Status::Rejected.as_str(),
                    "position": serde_json::Value::Null,
                    "totalStudents": serde_json::Value::Null
                }),
            )
        }
        Status::Approved | Status::Pending => {
            if let Err(e) = tx.execute(
                "UPDATE results SET status = 'APPROVED' WHERE id = ?",
                [&result_id],
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }

            // Re-read the scope under the transaction; it now includes the
            // candidate. Earlier approvals keep their stored positions even
            // though this approval may have shifted them.
            let scope = match approved_scope(&tx, &class_id, &term, &session) {
                Ok(v) => v,
                Err(e) => {
                    let _ = tx.rollback();
                    return err(&req.id, "db_query_failed", e.to_string(), None);
                }
            };
            let (position, total_students) = match scoring::class_rank(&result_id, &scope) {
                Ok(v) => v,
                Err(e) => {
                    let _ = tx.rollback();
                    return err_scoring(&req.id, e);
                }
            };

            let class_teacher_remark = remark_param("classTeacherRemark").unwrap_or_else(|| {
                scoring::default_class_teacher_remark(average_score, position).to_string()
            });
            let principal_remark = remark_param("principalRemark").unwrap_or_else(|| {
                scoring::default_principal_remark(average_score, position).to_string()
            });
            let recommendation = remark_param("recommendation").unwrap_or_else(|| {
                scoring::default_recommendation(average_score, position).to_string()
            });

            if let Err(e) = tx.execute(
                "UPDATE results
                 SET position = ?,
                     total_students = ?,
                     class_teacher_remark = ?,
                     principal_remark = ?,
                     recommendation = ?,
                     approved_by = ?,
                     approved_at = ?
                 WHERE id = ?",
                (
                    position,
                    total_students,
                    &class_teacher_remark,
                    &principal_remark,
                    &recommendation,
                    &reviewed_by,
                    &reviewed_at,
                    &result_id,
                ),
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            if let Err(e) = tx.commit() {
                return err(&req.id, "db_commit_failed", e.to_string(), None);
            }

            ok(
                &req.id,
                json!({
                    "resultId": result_id,
                    "status": Status::Approved.as_str(),
                    "position": position,
                    "totalStudents": total_students,
                    "classTeacherRemark": class_teacher_remark,
                    "principalRemark": principal_remark,
                    "recommendation": recommendation
                }),
            )
        }
    }
}

fn result_row_json(row: &rusqlite::Row<'_>) -> Result<serde_json::Value, rusqlite::Error> {
    let last: String = row.get(16)?;
    let first: String = row.get(17)?;
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "studentId": row.get::<_, String>(1)?,
        "classId": row.get::<_, String>(2)?,
        "arm": row.get::<_, String>(3)?,
        "term": row.get::<_, String>(4)?,
        "session": row.get::<_, String>(5)?,
        "totalScore": row.get::<_, i64>(6)?,
        "averageScore": row.get::<_, f64>(7)?,
        "status": row.get::<_, String>(8)?,
        "position": row.get::<_, Option<i64>>(9)?,
        "totalStudents": row.get::<_, Option<i64>>(10)?,
        "classTeacherRemark": row.get::<_, Option<String>>(11)?,
        "principalRemark": row.get::<_, Option<String>>(12)?,
        "recommendation": row.get::<_, Option<String>>(13)?,
        "submittedBy": row.get::<_, String>(14)?,
        "submittedAt": row.get::<_, String>(15)?,
        "studentName": format!("{}, {}", last, first),
        "admissionNo": row.get::<_, String>(18)?,
        "className": row.get::<_, String>(19)?,
        "approvedBy": row.get::<_, Option<String>>(20)?,
        "approvedAt": row.get::<_, Option<String>>(21)?
    }))
}

const RESULT_SELECT: &str = "SELECT
    r.id, r.student_id, r.class_id, r.arm, r.term, r.session,
    r.total_score, r.average_score, r.status, r.position, r.total_students,
    r.class_teacher_remark, r.principal_remark, r.recommendation,
    r.submitted_by, r.submitted_at,
    s.last_name, s.first_name, s.admission_no,
    c.name,
    r.approved_by, r.approved_at
 FROM results r
 JOIN students s ON s.id = r.student_id
 JOIN classes c ON c.id = r.class_id";

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "results": [] }));
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    let push_eq = |clauses: &mut Vec<&str>, binds: &mut Vec<Value>, clause: &'static str, key: &str| {
        if let Some(v) = req.params.get(key).and_then(|v| v.as_str()) {
            clauses.push(clause);
            binds.push(Value::Text(v.to_string()));
        }
    };
    push_eq(&mut clauses, &mut binds, "r.class_id = ?", "classId");
    push_eq(&mut clauses, &mut binds, "r.arm = ?", "arm");
    push_eq(&mut clauses, &mut binds, "r.status = ?", "status");
    push_eq(&mut clauses, &mut binds, "r.session = ?", "session");
    push_eq(&mut clauses, &mut binds, "r.term = ?", "term");
    if let Some(v) = req.params.get("search").and_then(|v| v.as_str()) {
        let needle = format!("%{}%", v.trim());
        clauses.push("(s.last_name LIKE ? OR s.first_name LIKE ? OR s.admission_no LIKE ?)");
        binds.push(Value::Text(needle.clone()));
        binds.push(Value::Text(needle.clone()));
        binds.push(Value::Text(needle));
    }

    let mut sql = RESULT_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY r.session DESC, r.term ASC, s.last_name, s.first_name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), result_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(results) => ok(&req.id, json!({ "results": results })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_results_list_submitted(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "results": [] }));
    };
    let submitted_by = match req.params.get("submittedBy").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing submittedBy", None),
    };

    let mut sql = format!("{} WHERE r.submitted_by = ?", RESULT_SELECT);
    let mut binds: Vec<Value> = vec![Value::Text(submitted_by)];
    if let Some(v) = req.params.get("status").and_then(|v| v.as_str()) {
        sql.push_str(" AND r.status = ?");
        binds.push(Value::Text(v.to_ascii_uppercase()));
    }
    sql.push_str(" ORDER BY r.submitted_at DESC");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), result_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(results) => ok(&req.id, json!({ "results": results })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_results_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "results": [] }));
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    // Students only ever see approved report cards.
    let mut sql = format!(
        "{} WHERE r.student_id = ? AND r.status = 'APPROVED'",
        RESULT_SELECT
    );
    let mut binds: Vec<Value> = vec![Value::Text(student_id)];
    if let Some(v) = req.params.get("session").and_then(|v| v.as_str()) {
        sql.push_str(" AND r.session = ?");
        binds.push(Value::Text(v.to_string()));
    }
    if let Some(v) = req.params.get("term").and_then(|v| v.as_str()) {
        sql.push_str(" AND r.term = ?");
        binds.push(Value::Text(v.to_ascii_lowercase()));
    }
    sql.push_str(" ORDER BY r.session DESC, r.term ASC");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), result_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    let mut results = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    for result in &mut results {
        let rid = result
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        match subjects_for_result(conn, &rid) {
            Ok(subjects) => result["subjects"] = json!(subjects),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    ok(&req.id, json!({ "results": results }))
}

fn handle_results_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result_id = match req.params.get("resultId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing resultId", None),
    };

    let sql = format!("{} WHERE r.id = ?", RESULT_SELECT);
    let row = match conn
        .query_row(&sql, [&result_id], result_row_json)
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(mut result) = row else {
        return err(&req.id, "not_found", "result not found", None);
    };

    let subjects = match subjects_for_result(conn, &result_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    result["subjects"] = json!(subjects);

    // Live standings over the current APPROVED scope. Stored position stays
    // as written at approval time; this view shows where things stand now.
    let class_id = result["classId"].as_str().unwrap_or_default().to_string();
    let term = result["term"].as_str().unwrap_or_default().to_string();
    let session = result["session"].as_str().unwrap_or_default().to_string();
    let scope = match approved_scope(conn, &class_id, &term, &session) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let ordered = scoring::rank_order(&scope);
    let standings: Vec<serde_json::Value> = ordered
        .iter()
        .enumerate()
        .map(|(i, e)| {
            json!({
                "resultId": e.result_id,
                "studentId": e.student_id,
                "totalScore": e.total_score,
                "position": i as i64 + 1
            })
        })
        .collect();
    if let Some(live) = ordered.iter().position(|e| e.result_id == result_id) {
        result["livePosition"] = json!(live as i64 + 1);
        result["liveTotalStudents"] = json!(ordered.len() as i64);
    }
    result["standings"] = json!(standings);

    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.submit" => Some(handle_results_submit(state, req)),
        "results.review" => Some(handle_results_review(state, req)),
        "results.list" => Some(handle_results_list(state, req)),
        "results.listSubmitted" => Some(handle_results_list_submitted(state, req)),
        "results.forStudent" => Some(handle_results_for_student(state, req)),
        "results.get" => Some(handle_results_get(state, req)),
        _ => None,
    }
}
