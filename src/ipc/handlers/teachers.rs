use crate::ipc::error::ok;
use crate::ipc::helpers::{
    begin_tx, commit_tx, exec_delete, get_required_str, not_found, query_failed, require_db,
    row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

use super::classrooms::classroom_exists;

fn teachers_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let classroom_id = get_required_str(params, "classroomId")?;
    if !classroom_exists(conn, &classroom_id)? {
        return Err(not_found("classroom"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, name FROM teachers WHERE classroom_id = ? ORDER BY name",
        )
        .map_err(query_failed)?;

    let teachers = stmt
        .query_map([&classroom_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            Ok(json!({ "id": id, "name": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({ "teachers": teachers }))
}

fn teachers_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let classroom_id = get_required_str(params, "classroomId")?;
    if !classroom_exists(conn, &classroom_id)? {
        return Err(not_found("classroom"));
    }
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }

    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, classroom_id, name) VALUES(?, ?, ?)",
        (&teacher_id, &classroom_id, &name),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "teachers" }))
    })?;

    Ok(json!({ "teacherId": teacher_id, "name": name }))
}

fn teachers_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let teacher_id = get_required_str(params, "teacherId")?;
    if !row_exists(conn, "SELECT 1 FROM teachers WHERE id = ?", &teacher_id)? {
        return Err(not_found("teacher"));
    }

    // A teacher's grades go with them; the deliveries stay.
    let tx = begin_tx(conn)?;
    exec_delete(
        &tx,
        "DELETE FROM grades WHERE teacher_id = ?",
        &teacher_id,
        "grades",
    )?;
    exec_delete(&tx, "DELETE FROM teachers WHERE id = ?", &teacher_id, "teachers")?;
    commit_tx(tx)?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "teachers.list" => teachers_list(state, &req.params),
        "teachers.create" => teachers_create(state, &req.params),
        "teachers.delete" => teachers_delete(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
