use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "teachers": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           t.id,
           t.name,
           t.email,
           (SELECT COUNT(*) FROM teacher_assignments ta WHERE ta.teacher_id = t.id) AS assignment_count
         FROM teachers t
         ORDER BY t.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "email": row.get::<_, String>(2)?,
                "assignmentCount": row.get::<_, i64>(3)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    let email = match req.params.get("email").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_ascii_lowercase(),
        None => return err(&req.id, "bad_params", "missing email", None),
    };
    if name.is_empty() || email.is_empty() {
        return err(&req.id, "bad_params", "name and email must not be empty", None);
    }

    let duplicate: Option<i64> = match conn
        .query_row("SELECT 1 FROM teachers WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate.is_some() {
        return err(
            &req.id,
            "conflict",
            format!("teacher with email '{}' already exists", email),
            None,
        );
    }

    let teacher_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, name, email) VALUES(?, ?, ?)",
        (&teacher_id, &name, &email),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }

    ok(&req.id, json!({ "teacherId": teacher_id, "email": email }))
}

fn handle_teachers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match req.params.get("teacherId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing teacherId", None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM teacher_assignments WHERE teacher_id = ?",
        [&teacher_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    let deleted = match tx.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
    };
    if deleted == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "teacher not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_teachers_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let teacher_id = match req.params.get("teacherId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing teacherId", None),
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let arm = match req.params.get("arm").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing arm", None),
    };
    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    for (sql, id, what) in [
        ("SELECT 1 FROM teachers WHERE id = ?", &teacher_id, "teacher"),
        ("SELECT 1 FROM classes WHERE id = ?", &class_id, "class"),
        ("SELECT 1 FROM subjects WHERE id = ?", &subject_id, "subject"),
    ] {
        let found: Option<i64> = match conn.query_row(sql, [id], |r| r.get(0)).optional() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if found.is_none() {
            return err(&req.id, "not_found", format!("{} not found", what), None);
        }
    }

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT OR IGNORE INTO teacher_assignments(id, teacher_id, class_id, arm, subject_id)
         VALUES(?, ?, ?, ?, ?)",
        (&assignment_id, &teacher_id, &class_id, &arm, &subject_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teacher_assignments" })),
        );
    }

    ok(&req.id, json!({ "teacherId": teacher_id, "classId": class_id }))
}

fn handle_teachers_assignments(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "assignments": [] }));
    };
    let teacher_id = match req.params.get("teacherId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing teacherId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT ta.id, ta.class_id, c.name, ta.arm, ta.subject_id, sub.name
         FROM teacher_assignments ta
         JOIN classes c ON c.id = ta.class_id
         JOIN subjects sub ON sub.id = ta.subject_id
         WHERE ta.teacher_id = ?
         ORDER BY c.name, ta.arm, sub.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&teacher_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "classId": row.get::<_, String>(1)?,
                "className": row.get::<_, String>(2)?,
                "arm": row.get::<_, String>(3)?,
                "subjectId": row.get::<_, String>(4)?,
                "subjectName": row.get::<_, String>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.delete" => Some(handle_teachers_delete(state, req)),
        "teachers.assign" => Some(handle_teachers_assign(state, req)),
        "teachers.assignments" => Some(handle_teachers_assignments(state, req)),
        _ => None,
    }
}
