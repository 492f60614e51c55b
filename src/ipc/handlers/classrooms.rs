use crate::ipc::error::ok;
use crate::ipc::helpers::{
    begin_tx, commit_tx, exec_delete, get_required_str, not_found, query_failed, require_db,
    row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub(super) fn classroom_exists(conn: &Connection, classroom_id: &str) -> Result<bool, HandlerErr> {
    row_exists(conn, "SELECT 1 FROM classrooms WHERE id = ?", classroom_id)
}

pub(super) fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    row_exists(conn, "SELECT 1 FROM students WHERE id = ?", student_id)
}

fn classrooms_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let subject_id = get_required_str(params, "subjectId")?;
    if !row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(not_found("subject"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               (SELECT COUNT(*) FROM classroom_memberships m WHERE m.classroom_id = c.id) AS member_count,
               (SELECT COUNT(*) FROM projects p WHERE p.classroom_id = c.id) AS project_count
             FROM classrooms c
             WHERE c.subject_id = ?
             ORDER BY c.rowid",
        )
        .map_err(query_failed)?;

    let classrooms = stmt
        .query_map([&subject_id], |row| {
            let id: String = row.get(0)?;
            let member_count: i64 = row.get(1)?;
            let project_count: i64 = row.get(2)?;
            Ok(json!({
                "id": id,
                "memberCount": member_count,
                "projectCount": project_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({ "classrooms": classrooms }))
}

fn classrooms_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let subject_id = get_required_str(params, "subjectId")?;
    if !row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(not_found("subject"));
    }

    let classroom_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classrooms(id, subject_id) VALUES(?, ?)",
        (&classroom_id, &subject_id),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "classrooms" }))
    })?;

    Ok(json!({ "classroomId": classroom_id }))
}

fn classrooms_info(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let classroom_id = get_required_str(params, "classroomId")?;
    let row = conn
        .query_row(
            "SELECT c.subject_id, s.name
             FROM classrooms c
             JOIN subjects s ON s.id = c.subject_id
             WHERE c.id = ?",
            [&classroom_id],
            |r| {
                let subject_id: String = r.get(0)?;
                let subject_name: String = r.get(1)?;
                Ok((subject_id, subject_name))
            },
        )
        .optional()
        .map_err(query_failed)?;

    let Some((subject_id, subject_name)) = row else {
        return Err(not_found("classroom"));
    };

    Ok(json!({
        "classroomId": classroom_id,
        "subjectId": subject_id,
        "subjectName": subject_name
    }))
}

fn classrooms_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let classroom_id = get_required_str(params, "classroomId")?;
    if !classroom_exists(conn, &classroom_id)? {
        return Err(not_found("classroom"));
    }

    let tx = begin_tx(conn)?;

    exec_delete(
        &tx,
        "DELETE FROM grades
         WHERE delivery_id IN (
           SELECT d.id
           FROM deliveries d
           JOIN teams t ON t.id = d.team_id
           JOIN projects p ON p.id = t.project_id
           WHERE p.classroom_id = ?
         )",
        &classroom_id,
        "grades",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM deliveries
         WHERE team_id IN (
           SELECT t.id
           FROM teams t
           JOIN projects p ON p.id = t.project_id
           WHERE p.classroom_id = ?
         )",
        &classroom_id,
        "deliveries",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM team_memberships
         WHERE team_id IN (
           SELECT t.id
           FROM teams t
           JOIN projects p ON p.id = t.project_id
           WHERE p.classroom_id = ?
         )",
        &classroom_id,
        "team_memberships",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM teams
         WHERE project_id IN (SELECT id FROM projects WHERE classroom_id = ?)",
        &classroom_id,
        "teams",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM projects WHERE classroom_id = ?",
        &classroom_id,
        "projects",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM teachers WHERE classroom_id = ?",
        &classroom_id,
        "teachers",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM classroom_memberships WHERE classroom_id = ?",
        &classroom_id,
        "classroom_memberships",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM classrooms WHERE id = ?",
        &classroom_id,
        "classrooms",
    )?;

    commit_tx(tx)?;
    Ok(json!({ "ok": true }))
}

/// Two-column partition of all students, mirroring the manage-students
/// screen: current members on one side, everyone else on the other.
fn classrooms_members(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let classroom_id = get_required_str(params, "classroomId")?;
    if !classroom_exists(conn, &classroom_id)? {
        return Err(not_found("classroom"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT
               s.id,
               s.name,
               EXISTS(
                 SELECT 1 FROM classroom_memberships m
                 WHERE m.student_id = s.id AND m.classroom_id = ?
               ) AS is_member
             FROM students s
             ORDER BY s.name",
        )
        .map_err(query_failed)?;

    let rows = stmt
        .query_map([&classroom_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let is_member: i64 = row.get(2)?;
            Ok((id, name, is_member != 0))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut members = Vec::new();
    let mut available = Vec::new();
    for (id, name, is_member) in rows {
        let entry = json!({ "studentId": id, "name": name });
        if is_member {
            members.push(entry);
        } else {
            available.push(entry);
        }
    }

    Ok(json!({ "members": members, "available": available }))
}

fn classrooms_add_student(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let classroom_id = get_required_str(params, "classroomId")?;
    let student_id = get_required_str(params, "studentId")?;
    if !classroom_exists(conn, &classroom_id)? {
        return Err(not_found("classroom"));
    }
    if !student_exists(conn, &student_id)? {
        return Err(not_found("student"));
    }

    let already: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM classroom_memberships WHERE student_id = ? AND classroom_id = ?",
            (&student_id, &classroom_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    if already.is_some() {
        return Err(HandlerErr::new(
            "already_exists",
            "student is already a member of this classroom",
        ));
    }

    conn.execute(
        "INSERT INTO classroom_memberships(student_id, classroom_id) VALUES(?, ?)",
        (&student_id, &classroom_id),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "classroom_memberships" }),
        )
    })?;

    Ok(json!({ "ok": true }))
}

fn classrooms_remove_student(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let classroom_id = get_required_str(params, "classroomId")?;
    let student_id = get_required_str(params, "studentId")?;
    if !classroom_exists(conn, &classroom_id)? {
        return Err(not_found("classroom"));
    }

    let removed = conn
        .execute(
            "DELETE FROM classroom_memberships WHERE student_id = ? AND classroom_id = ?",
            (&student_id, &classroom_id),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": "classroom_memberships" }),
            )
        })?;
    if removed == 0 {
        return Err(not_found("membership"));
    }

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "classrooms.list" => classrooms_list(state, &req.params),
        "classrooms.create" => classrooms_create(state, &req.params),
        "classrooms.info" => classrooms_info(state, &req.params),
        "classrooms.delete" => classrooms_delete(state, &req.params),
        "classrooms.members" => classrooms_members(state, &req.params),
        "classrooms.addStudent" => classrooms_add_student(state, &req.params),
        "classrooms.removeStudent" => classrooms_remove_student(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
