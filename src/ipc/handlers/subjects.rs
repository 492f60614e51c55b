use crate::ipc::error::ok;
use crate::ipc::helpers::{
    begin_tx, commit_tx, exec_delete, get_opt_str, get_required_str, not_found, query_failed,
    require_db, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, HandlerErr> {
    row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", subject_id)
}

fn subjects_list(state: &AppState, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    // Include the classroom count so the UI list can double as a dashboard.
    let mut stmt = conn
        .prepare(
            "SELECT
               s.id,
               s.name,
               s.description,
               (SELECT COUNT(*) FROM classrooms c WHERE c.subject_id = s.id) AS classroom_count
             FROM subjects s
             ORDER BY s.name",
        )
        .map_err(query_failed)?;

    let subjects = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let description: Option<String> = row.get(2)?;
            let classroom_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "description": description,
                "classroomCount": classroom_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }
    let description = get_opt_str(params, "description");

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, description) VALUES(?, ?, ?)",
        (&subject_id, &name, &description),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "subjects" }))
    })?;

    Ok(json!({ "subjectId": subject_id, "name": name }))
}

fn subjects_update(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let subject_id = get_required_str(params, "subjectId")?;
    if !subject_exists(conn, &subject_id)? {
        return Err(not_found("subject"));
    }

    let patch = params.get("patch").cloned().unwrap_or(json!({}));
    let mut touched = 0usize;

    if let Some(name) = patch.get("name").and_then(|v| v.as_str()) {
        let name = name.trim();
        if name.is_empty() {
            return Err(HandlerErr::new("bad_params", "name must not be empty"));
        }
        conn.execute(
            "UPDATE subjects SET name = ? WHERE id = ?",
            (name, &subject_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        touched += 1;
    }
    if let Some(v) = patch.get("description") {
        // Explicit null clears the description.
        let description: Option<String> = v
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        conn.execute(
            "UPDATE subjects SET description = ? WHERE id = ?",
            (&description, &subject_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        touched += 1;
    }

    if touched == 0 {
        return Err(HandlerErr::new("bad_params", "patch has no recognized fields"));
    }
    Ok(json!({ "subjectId": subject_id }))
}

fn subjects_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let subject_id = get_required_str(params, "subjectId")?;
    if !subject_exists(conn, &subject_id)? {
        return Err(not_found("subject"));
    }

    let tx = begin_tx(conn)?;

    // Explicit cascade in dependency order (no ON DELETE CASCADE).
    exec_delete(
        &tx,
        "DELETE FROM grades
         WHERE delivery_id IN (
           SELECT d.id
           FROM deliveries d
           JOIN teams t ON t.id = d.team_id
           JOIN projects p ON p.id = t.project_id
           JOIN classrooms c ON c.id = p.classroom_id
           WHERE c.subject_id = ?
         )",
        &subject_id,
        "grades",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM deliveries
         WHERE team_id IN (
           SELECT t.id
           FROM teams t
           JOIN projects p ON p.id = t.project_id
           JOIN classrooms c ON c.id = p.classroom_id
           WHERE c.subject_id = ?
         )",
        &subject_id,
        "deliveries",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM team_memberships
         WHERE team_id IN (
           SELECT t.id
           FROM teams t
           JOIN projects p ON p.id = t.project_id
           JOIN classrooms c ON c.id = p.classroom_id
           WHERE c.subject_id = ?
         )",
        &subject_id,
        "team_memberships",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM teams
         WHERE project_id IN (
           SELECT p.id
           FROM projects p
           JOIN classrooms c ON c.id = p.classroom_id
           WHERE c.subject_id = ?
         )",
        &subject_id,
        "teams",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM projects
         WHERE classroom_id IN (SELECT id FROM classrooms WHERE subject_id = ?)",
        &subject_id,
        "projects",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM teachers
         WHERE classroom_id IN (SELECT id FROM classrooms WHERE subject_id = ?)",
        &subject_id,
        "teachers",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM classroom_memberships
         WHERE classroom_id IN (SELECT id FROM classrooms WHERE subject_id = ?)",
        &subject_id,
        "classroom_memberships",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM classrooms WHERE subject_id = ?",
        &subject_id,
        "classrooms",
    )?;
    exec_delete(&tx, "DELETE FROM subjects WHERE id = ?", &subject_id, "subjects")?;

    commit_tx(tx)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "subjects.list" => subjects_list(state, &req.params),
        "subjects.create" => subjects_create(state, &req.params),
        "subjects.update" => subjects_update(state, &req.params),
        "subjects.delete" => subjects_delete(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
