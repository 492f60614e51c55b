use crate::ipc::error::ok;
use crate::ipc::helpers::{
    begin_tx, commit_tx, exec_delete, get_required_str, not_found, query_failed, require_db,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::classrooms::student_exists;
use super::projects::project_exists;

struct TeamContext {
    project_id: String,
    classroom_id: String,
}

fn team_context(conn: &Connection, team_id: &str) -> Result<TeamContext, HandlerErr> {
    conn.query_row(
        "SELECT t.project_id, p.classroom_id
         FROM teams t
         JOIN projects p ON p.id = t.project_id
         WHERE t.id = ?",
        [team_id],
        |r| {
            Ok(TeamContext {
                project_id: r.get(0)?,
                classroom_id: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(query_failed)?
    .ok_or_else(|| not_found("team"))
}

fn teams_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let project_id = get_required_str(params, "projectId")?;
    if !project_exists(conn, &project_id)? {
        return Err(not_found("project"));
    }

    let team_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teams(id, project_id) VALUES(?, ?)",
        (&team_id, &project_id),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "teams" }))
    })?;

    Ok(json!({ "teamId": team_id }))
}

fn teams_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let team_id = get_required_str(params, "teamId")?;
    team_context(conn, &team_id)?;

    let tx = begin_tx(conn)?;
    exec_delete(
        &tx,
        "DELETE FROM grades
         WHERE delivery_id IN (SELECT id FROM deliveries WHERE team_id = ?)",
        &team_id,
        "grades",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM deliveries WHERE team_id = ?",
        &team_id,
        "deliveries",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM team_memberships WHERE team_id = ?",
        &team_id,
        "team_memberships",
    )?;
    exec_delete(&tx, "DELETE FROM teams WHERE id = ?", &team_id, "teams")?;
    commit_tx(tx)?;

    Ok(json!({ "ok": true }))
}

/// Partition of the classroom's students for the team screen. A student
/// already on another team of the same project is not available; the same
/// student may still join teams in other projects.
fn teams_members(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let team_id = get_required_str(params, "teamId")?;
    let ctx = team_context(conn, &team_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT
               s.id,
               s.name,
               EXISTS(
                 SELECT 1 FROM team_memberships m
                 WHERE m.student_id = s.id AND m.team_id = ?1
               ) AS on_this_team,
               EXISTS(
                 SELECT 1 FROM team_memberships m
                 JOIN teams t ON t.id = m.team_id
                 WHERE m.student_id = s.id AND t.project_id = ?2 AND m.team_id <> ?1
               ) AS on_other_team
             FROM students s
             JOIN classroom_memberships cm ON cm.student_id = s.id
             WHERE cm.classroom_id = ?3
             ORDER BY s.name",
        )
        .map_err(query_failed)?;

    let rows = stmt
        .query_map(
            (&team_id, &ctx.project_id, &ctx.classroom_id),
            |row| {
                let id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let on_this_team: i64 = row.get(2)?;
                let on_other_team: i64 = row.get(3)?;
                Ok((id, name, on_this_team != 0, on_other_team != 0))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut members = Vec::new();
    let mut available = Vec::new();
    for (id, name, on_this_team, on_other_team) in rows {
        let entry = json!({ "studentId": id, "name": name });
        if on_this_team {
            members.push(entry);
        } else if !on_other_team {
            available.push(entry);
        }
    }

    Ok(json!({
        "teamId": team_id,
        "projectId": ctx.project_id,
        "members": members,
        "available": available
    }))
}

fn teams_add_student(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let team_id = get_required_str(params, "teamId")?;
    let student_id = get_required_str(params, "studentId")?;
    let ctx = team_context(conn, &team_id)?;
    if !student_exists(conn, &student_id)? {
        return Err(not_found("student"));
    }

    let in_classroom: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM classroom_memberships WHERE student_id = ? AND classroom_id = ?",
            (&student_id, &ctx.classroom_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    if in_classroom.is_none() {
        return Err(HandlerErr::new(
            "bad_params",
            "student is not a member of the project's classroom",
        ));
    }

    let already: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM team_memberships WHERE student_id = ? AND team_id = ?",
            (&student_id, &team_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    if already.is_some() {
        return Err(HandlerErr::new(
            "already_exists",
            "student is already on this team",
        ));
    }

    let elsewhere: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM team_memberships m
             JOIN teams t ON t.id = m.team_id
             WHERE m.student_id = ? AND t.project_id = ? AND m.team_id <> ?",
            (&student_id, &ctx.project_id, &team_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    if elsewhere.is_some() {
        return Err(HandlerErr::new(
            "already_exists",
            "student is already on another team of this project",
        ));
    }

    conn.execute(
        "INSERT INTO team_memberships(student_id, team_id) VALUES(?, ?)",
        (&student_id, &team_id),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "team_memberships" }),
        )
    })?;

    Ok(json!({ "ok": true }))
}

fn teams_remove_student(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let team_id = get_required_str(params, "teamId")?;
    let student_id = get_required_str(params, "studentId")?;
    team_context(conn, &team_id)?;

    let removed = conn
        .execute(
            "DELETE FROM team_memberships WHERE student_id = ? AND team_id = ?",
            (&student_id, &team_id),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": "team_memberships" }),
            )
        })?;
    if removed == 0 {
        return Err(not_found("membership"));
    }

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "teams.create" => teams_create(state, &req.params),
        "teams.delete" => teams_delete(state, &req.params),
        "teams.members" => teams_members(state, &req.params),
        "teams.addStudent" => teams_add_student(state, &req.params),
        "teams.removeStudent" => teams_remove_student(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
