use crate::ipc::error::ok;
use crate::ipc::helpers::{
    begin_tx, commit_tx, exec_delete, get_opt_str, get_required_str, not_found, query_failed,
    require_db, row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::classrooms::classroom_exists;

pub(super) fn project_exists(conn: &Connection, project_id: &str) -> Result<bool, HandlerErr> {
    row_exists(conn, "SELECT 1 FROM projects WHERE id = ?", project_id)
}

fn projects_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let classroom_id = get_required_str(params, "classroomId")?;
    if !classroom_exists(conn, &classroom_id)? {
        return Err(not_found("classroom"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT
               p.id,
               p.name,
               p.description,
               (SELECT COUNT(*) FROM teams t WHERE t.project_id = p.id) AS team_count
             FROM projects p
             WHERE p.classroom_id = ?
             ORDER BY p.name",
        )
        .map_err(query_failed)?;

    let projects = stmt
        .query_map([&classroom_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let description: Option<String> = row.get(2)?;
            let team_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "description": description,
                "teamCount": team_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({ "projects": projects }))
}

fn projects_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let classroom_id = get_required_str(params, "classroomId")?;
    if !classroom_exists(conn, &classroom_id)? {
        return Err(not_found("classroom"));
    }
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }
    let description = get_opt_str(params, "description");

    let project_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO projects(id, classroom_id, name, description) VALUES(?, ?, ?, ?)",
        (&project_id, &classroom_id, &name, &description),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "projects" }))
    })?;

    Ok(json!({ "projectId": project_id, "name": name }))
}

fn projects_update(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let project_id = get_required_str(params, "projectId")?;
    if !project_exists(conn, &project_id)? {
        return Err(not_found("project"));
    }

    let patch = params.get("patch").cloned().unwrap_or(json!({}));
    let mut touched = 0usize;

    if let Some(name) = patch.get("name").and_then(|v| v.as_str()) {
        let name = name.trim();
        if name.is_empty() {
            return Err(HandlerErr::new("bad_params", "name must not be empty"));
        }
        conn.execute(
            "UPDATE projects SET name = ? WHERE id = ?",
            (name, &project_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        touched += 1;
    }
    if let Some(v) = patch.get("description") {
        let description: Option<String> = v
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        conn.execute(
            "UPDATE projects SET description = ? WHERE id = ?",
            (&description, &project_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        touched += 1;
    }

    if touched == 0 {
        return Err(HandlerErr::new("bad_params", "patch has no recognized fields"));
    }
    Ok(json!({ "projectId": project_id }))
}

fn projects_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let project_id = get_required_str(params, "projectId")?;
    if !project_exists(conn, &project_id)? {
        return Err(not_found("project"));
    }

    let tx = begin_tx(conn)?;
    exec_delete(
        &tx,
        "DELETE FROM grades
         WHERE delivery_id IN (
           SELECT d.id FROM deliveries d
           JOIN teams t ON t.id = d.team_id
           WHERE t.project_id = ?
         )",
        &project_id,
        "grades",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM deliveries
         WHERE team_id IN (SELECT id FROM teams WHERE project_id = ?)",
        &project_id,
        "deliveries",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM team_memberships
         WHERE team_id IN (SELECT id FROM teams WHERE project_id = ?)",
        &project_id,
        "team_memberships",
    )?;
    exec_delete(
        &tx,
        "DELETE FROM teams WHERE project_id = ?",
        &project_id,
        "teams",
    )?;
    exec_delete(&tx, "DELETE FROM projects WHERE id = ?", &project_id, "projects")?;
    commit_tx(tx)?;

    Ok(json!({ "ok": true }))
}

/// One row per team of the project: who is on it, what they submitted, and
/// how the submission was graded so far. This is the deliveries board of
/// the project details screen.
fn projects_board(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let project_id = get_required_str(params, "projectId")?;
    let header = conn
        .query_row(
            "SELECT p.name, p.description, p.classroom_id, s.name
             FROM projects p
             JOIN classrooms c ON c.id = p.classroom_id
             JOIN subjects s ON s.id = c.subject_id
             WHERE p.id = ?",
            [&project_id],
            |r| {
                let name: String = r.get(0)?;
                let description: Option<String> = r.get(1)?;
                let classroom_id: String = r.get(2)?;
                let subject_name: String = r.get(3)?;
                Ok((name, description, classroom_id, subject_name))
            },
        )
        .optional()
        .map_err(query_failed)?;
    let Some((project_name, description, classroom_id, subject_name)) = header else {
        return Err(not_found("project"));
    };

    let mut team_stmt = conn
        .prepare(
            "SELECT
               t.id,
               d.id, d.file_name, d.file_sha256, d.submitted_at,
               (SELECT AVG(g.grade) FROM grades g WHERE g.delivery_id = d.id),
               (SELECT COUNT(*) FROM grades g WHERE g.delivery_id = d.id)
             FROM teams t
             LEFT JOIN deliveries d ON d.team_id = t.id
             WHERE t.project_id = ?
             ORDER BY t.rowid",
        )
        .map_err(query_failed)?;

    struct BoardTeam {
        team_id: String,
        delivery: Option<(String, String, String, String)>,
        average_grade: Option<f64>,
        grade_count: i64,
    }

    let board_teams = team_stmt
        .query_map([&project_id], |row| {
            let team_id: String = row.get(0)?;
            let delivery_id: Option<String> = row.get(1)?;
            let delivery = match delivery_id {
                Some(id) => Some((id, row.get(2)?, row.get(3)?, row.get(4)?)),
                None => None,
            };
            let average_grade: Option<f64> = row.get(5)?;
            let grade_count: Option<i64> = row.get(6)?;
            Ok(BoardTeam {
                team_id,
                delivery,
                average_grade,
                grade_count: grade_count.unwrap_or(0),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut member_stmt = conn
        .prepare(
            "SELECT s.name
             FROM students s
             JOIN team_memberships m ON m.student_id = s.id
             WHERE m.team_id = ?
             ORDER BY s.name",
        )
        .map_err(query_failed)?;

    let mut rows = Vec::with_capacity(board_teams.len());
    for team in board_teams {
        let members = member_stmt
            .query_map([&team.team_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_failed)?;

        let delivery = team.delivery.map(|(id, file_name, file_sha256, submitted_at)| {
            json!({
                "deliveryId": id,
                "fileName": file_name,
                "fileSha256": file_sha256,
                "submittedAt": submitted_at
            })
        });

        rows.push(json!({
            "teamId": team.team_id,
            "members": members,
            "delivery": delivery,
            "averageGrade": team.average_grade,
            "gradeCount": team.grade_count
        }));
    }

    Ok(json!({
        "projectId": project_id,
        "projectName": project_name,
        "description": description,
        "classroomId": classroom_id,
        "subjectName": subject_name,
        "teams": rows
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "projects.list" => projects_list(state, &req.params),
        "projects.create" => projects_create(state, &req.params),
        "projects.update" => projects_update(state, &req.params),
        "projects.delete" => projects_delete(state, &req.params),
        "projects.board" => projects_board(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
