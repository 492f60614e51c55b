use crate::ipc::error::ok;
use crate::ipc::helpers::{
    begin_tx, commit_tx, exec_delete, get_required_str, not_found, query_failed, require_db,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

use super::classrooms::student_exists;

fn students_list(state: &AppState, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let mut stmt = conn
        .prepare(
            "SELECT
               s.id,
               s.name,
               (SELECT COUNT(*) FROM classroom_memberships m WHERE m.student_id = s.id) AS classroom_count,
               (SELECT COUNT(*) FROM team_memberships m WHERE m.student_id = s.id) AS team_count
             FROM students s
             ORDER BY s.name",
        )
        .map_err(query_failed)?;

    let students = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let classroom_count: i64 = row.get(2)?;
            let team_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "classroomCount": classroom_count,
                "teamCount": team_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({ "students": students }))
}

fn students_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, name) VALUES(?, ?)",
        (&student_id, &name),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "students" }))
    })?;

    Ok(json!({ "studentId": student_id, "name": name }))
}

fn students_update(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(not_found("student"));
    }

    let patch = params.get("patch").cloned().unwrap_or(json!({}));
    let Some(name) = patch.get("name").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::new("bad_params", "patch has no recognized fields"));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }

    conn.execute(
        "UPDATE students SET name = ? WHERE id = ?",
        (name, &student_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "studentId": student_id }))
}

fn students_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(not_found("student"));
    }

    // Memberships go with the student; team deliveries and grades stay,
    // since they belong to the team, not any one member.
    let tx = begin_tx(conn)?;
    exec_delete(
        &tx,
        "DELETE FROM team_memberships WHERE student_id = ?",
        &student_id,
        "team_memberships",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM classroom_memberships WHERE student_id = ?",
        &student_id,
        "classroom_memberships",
    )?;
    exec_delete(&tx, "DELETE FROM students WHERE id = ?", &student_id, "students")?;
    commit_tx(tx)?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "students.list" => students_list(state, &req.params),
        "students.create" => students_create(state, &req.params),
        "students.update" => students_update(state, &req.params),
        "students.delete" => students_delete(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
