use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn parse_arms(params: &serde_json::Value) -> Result<Vec<String>, String> {
    let Some(raw) = params.get("arms") else {
        // Single-arm classes are common enough to deserve a default.
        return Ok(vec!["A".to_string()]);
    };
    let Some(arr) = raw.as_array() else {
        return Err("arms must be an array of strings".to_string());
    };
    let mut arms = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err("arms must be an array of strings".to_string());
        };
        let s = s.trim();
        if s.is_empty() {
            return Err("arm names must not be empty".to_string());
        }
        if !arms.iter().any(|a: &String| a == s) {
            arms.push(s.to_string());
        }
    }
    if arms.is_empty() {
        return Err("a class needs at least one arm".to_string());
    }
    Ok(arms)
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Counts via correlated subqueries so the admin dashboard gets them in
    // one round trip without join double-counting.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.arms,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM results r WHERE r.class_id = c.id) AS result_count
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let arms_raw: String = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            let result_count: i64 = row.get(4)?;
            let arms: serde_json::Value =
                serde_json::from_str(&arms_raw).unwrap_or_else(|_| json!([]));
            Ok(json!({
                "id": id,
                "name": name,
                "arms": arms,
                "studentCount": student_count,
                "resultCount": result_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let arms = match parse_arms(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE name = ?", [&name], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_some() {
        return err(
            &req.id,
            "conflict",
            format!("class '{}' already exists", name),
            None,
        );
    }

    let class_id = Uuid::new_v4().to_string();
    let arms_json = serde_json::to_string(&arms).unwrap_or_else(|_| "[]".to_string());
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, arms) VALUES(?, ?, ?)",
        (&class_id, &name, &arms_json),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(
        &req.id,
        json!({ "classId": class_id, "name": name, "arms": arms }),
    )
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicit dependency-order deletes (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM result_subjects
         WHERE result_id IN (SELECT id FROM results WHERE class_id = ?)",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "result_subjects" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM results WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "results" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM teacher_assignments WHERE class_id = ?",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "teacher_assignments" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM students WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
