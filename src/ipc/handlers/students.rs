use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn class_arms(
    conn: &rusqlite::Connection,
    class_id: &str,
) -> Result<Option<Vec<String>>, rusqlite::Error> {
    let raw: Option<String> = conn
        .query_row("SELECT arms FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(raw.map(|s| serde_json::from_str(&s).unwrap_or_default()))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, arm, admission_no, last_name, first_name, active, sort_order
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&class_id], |row| {
            let last: String = row.get(3)?;
            let first: String = row.get(4)?;
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "arm": row.get::<_, String>(1)?,
                "admissionNo": row.get::<_, String>(2)?,
                "lastName": last.clone(),
                "firstName": first.clone(),
                "displayName": format!("{}, {}", last, first),
                "active": row.get::<_, i64>(5)? != 0,
                "sortOrder": row.get::<_, i64>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let arm = match req.params.get("arm").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing arm", None),
    };
    let admission_no = match req.params.get("admissionNo").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing admissionNo", None),
    };
    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing lastName", None),
    };
    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing firstName", None),
    };
    if admission_no.is_empty() || last_name.is_empty() || first_name.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "admissionNo, lastName and firstName must not be empty",
            None,
        );
    }
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let arms = match class_arms(conn, &class_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !arms.iter().any(|a| a == &arm) {
        return err(
            &req.id,
            "bad_params",
            format!("arm '{}' is not defined for this class", arm),
            Some(json!({ "arms": arms })),
        );
    }

    let duplicate: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE admission_no = ?",
            [&admission_no],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate.is_some() {
        return err(
            &req.id,
            "conflict",
            format!("admission number '{}' already in use", admission_no),
            None,
        );
    }

    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, arm, admission_no, last_name, first_name, active, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &class_id,
            &arm,
            &admission_no,
            &last_name,
            &first_name,
            active as i64,
            next_sort,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "admissionNo": admission_no }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    for (key, column) in [
        ("lastName", "last_name"),
        ("firstName", "first_name"),
        ("arm", "arm"),
    ] {
        if let Some(v) = patch.get(key).and_then(|v| v.as_str()) {
            let v = v.trim();
            if v.is_empty() {
                return err(
                    &req.id,
                    "bad_params",
                    format!("{} must not be empty", key),
                    None,
                );
            }
            let sql = format!("UPDATE students SET {} = ? WHERE id = ?", column);
            if let Err(e) = conn.execute(&sql, (v, &student_id)) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }
    if let Some(v) = patch.get("active").and_then(|v| v.as_bool()) {
        if let Err(e) = conn.execute(
            "UPDATE students SET active = ? WHERE id = ?",
            (v as i64, &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let has_results: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM results WHERE student_id = ? LIMIT 1",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if has_results.is_some() {
        return err(
            &req.id,
            "conflict",
            "student has submitted results; deactivate instead of deleting",
            None,
        );
    }

    let deleted = match conn.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
