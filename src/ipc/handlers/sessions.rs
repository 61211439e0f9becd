use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_sessions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "sessions": [] }));
    };

    let mut stmt = match conn.prepare("SELECT id, name, is_current FROM sessions ORDER BY name DESC")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "isCurrent": row.get::<_, i64>(2)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(sessions) => ok(&req.id, json!({ "sessions": sessions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_sessions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if !scoring::session_name_is_valid(&name) {
        return err(
            &req.id,
            "bad_params",
            "session name must be consecutive years in YYYY/YYYY form",
            Some(json!({ "name": name })),
        );
    }

    let duplicate: Option<i64> = match conn
        .query_row("SELECT 1 FROM sessions WHERE name = ?", [&name], |r| {
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
            format!("session '{}' already exists", name),
            None,
        );
    }

    let session_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO sessions(id, name, is_current) VALUES(?, ?, 0)",
        (&session_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "sessions" })),
        );
    }

    ok(&req.id, json!({ "sessionId": session_id, "name": name }))
}

fn handle_sessions_set_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?", [&session_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "session not found", None);
    }

    // Exactly one current session at a time.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("UPDATE sessions SET is_current = 0", []) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE sessions SET is_current = 1 WHERE id = ?",
        [&session_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "sessionId": session_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.list" => Some(handle_sessions_list(state, req)),
        "sessions.create" => Some(handle_sessions_create(state, req)),
        "sessions.setCurrent" => Some(handle_sessions_set_current(state, req)),
        _ => None,
    }
}
