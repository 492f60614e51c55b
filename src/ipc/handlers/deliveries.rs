use crate::db::sha256_hex;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    begin_tx, commit_tx, exec_delete, get_required_str, not_found, query_failed, require_db,
    row_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub(super) fn delivery_team(conn: &Connection, delivery_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT team_id FROM deliveries WHERE id = ?",
        [delivery_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(query_failed)?
    .ok_or_else(|| not_found("delivery"))
}

fn deliveries_add(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let team_id = get_required_str(params, "teamId")?;
    let path = PathBuf::from(get_required_str(params, "path")?);
    if !row_exists(conn, "SELECT 1 FROM teams WHERE id = ?", &team_id)? {
        return Err(not_found("team"));
    }

    let Some(file_name) = path.file_name().and_then(|s| s.to_str()).map(String::from) else {
        return Err(HandlerErr::new("bad_params", "path has no file name"));
    };
    let file_bytes = std::fs::read(&path).map_err(|e| {
        HandlerErr::with_details(
            "bad_params",
            format!("failed to read file: {}", e),
            json!({ "path": path.to_string_lossy() }),
        )
    })?;
    let file_sha256 = sha256_hex(&file_bytes);
    let submitted_at = Utc::now().to_rfc3339();

    // One delivery per team: a resubmission replaces the previous one,
    // and grades for the replaced delivery are dropped.
    let previous: Option<String> = conn
        .query_row(
            "SELECT id FROM deliveries WHERE team_id = ?",
            [&team_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;

    let delivery_id = Uuid::new_v4().to_string();
    let tx = begin_tx(conn)?;
    if let Some(ref prev_id) = previous {
        exec_delete(&tx, "DELETE FROM grades WHERE delivery_id = ?", prev_id, "grades")?;
        exec_delete(&tx, "DELETE FROM deliveries WHERE id = ?", prev_id, "deliveries")?;
    }
    tx.execute(
        "INSERT INTO deliveries(id, team_id, submitted_at, file_name, file_sha256, file_bytes)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &delivery_id,
            &team_id,
            &submitted_at,
            &file_name,
            &file_sha256,
            &file_bytes,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "deliveries" }))
    })?;
    commit_tx(tx)?;

    Ok(json!({
        "deliveryId": delivery_id,
        "teamId": team_id,
        "fileName": file_name,
        "fileSha256": file_sha256,
        "submittedAt": submitted_at,
        "replacedDeliveryId": previous
    }))
}

/// Everything the grading screen shows above the grade inputs: the
/// subject/classroom/project/team breadcrumb, the member names, and the
/// stored file's metadata.
fn deliveries_info(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let delivery_id = get_required_str(params, "deliveryId")?;
    let row = conn
        .query_row(
            "SELECT
               d.team_id, d.submitted_at, d.file_name, d.file_sha256, LENGTH(d.file_bytes),
               t.project_id, p.name, p.classroom_id, s.name
             FROM deliveries d
             JOIN teams t ON t.id = d.team_id
             JOIN projects p ON p.id = t.project_id
             JOIN classrooms c ON c.id = p.classroom_id
             JOIN subjects s ON s.id = c.subject_id
             WHERE d.id = ?",
            [&delivery_id],
            |r| {
                let team_id: String = r.get(0)?;
                let submitted_at: String = r.get(1)?;
                let file_name: String = r.get(2)?;
                let file_sha256: String = r.get(3)?;
                let byte_count: i64 = r.get(4)?;
                let project_id: String = r.get(5)?;
                let project_name: String = r.get(6)?;
                let classroom_id: String = r.get(7)?;
                let subject_name: String = r.get(8)?;
                Ok((
                    team_id,
                    submitted_at,
                    file_name,
                    file_sha256,
                    byte_count,
                    project_id,
                    project_name,
                    classroom_id,
                    subject_name,
                ))
            },
        )
        .optional()
        .map_err(query_failed)?;

    let Some((
        team_id,
        submitted_at,
        file_name,
        file_sha256,
        byte_count,
        project_id,
        project_name,
        classroom_id,
        subject_name,
    )) = row
    else {
        return Err(not_found("delivery"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT s.name
             FROM students s
             JOIN team_memberships m ON m.student_id = s.id
             WHERE m.team_id = ?
             ORDER BY s.name",
        )
        .map_err(query_failed)?;
    let members = stmt
        .query_map([&team_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({
        "deliveryId": delivery_id,
        "teamId": team_id,
        "projectId": project_id,
        "projectName": project_name,
        "classroomId": classroom_id,
        "subjectName": subject_name,
        "members": members,
        "fileName": file_name,
        "fileSha256": file_sha256,
        "byteCount": byte_count,
        "submittedAt": submitted_at
    }))
}

/// Write the stored blob back to disk so the UI can hand it to a viewer.
/// Defaults to a preview directory under the system temp dir.
fn deliveries_export(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let delivery_id = get_required_str(params, "deliveryId")?;
    let row = conn
        .query_row(
            "SELECT file_name, file_bytes FROM deliveries WHERE id = ?",
            [&delivery_id],
            |r| {
                let file_name: String = r.get(0)?;
                let file_bytes: Vec<u8> = r.get(1)?;
                Ok((file_name, file_bytes))
            },
        )
        .optional()
        .map_err(query_failed)?;
    let Some((file_name, file_bytes)) = row else {
        return Err(not_found("delivery"));
    };

    let out_dir = match params.get("outDir").and_then(|v| v.as_str()) {
        Some(dir) => PathBuf::from(dir),
        None => std::env::temp_dir().join("gradr-previews"),
    };
    std::fs::create_dir_all(&out_dir).map_err(|e| {
        HandlerErr::new("export_failed", format!("failed to create output directory: {}", e))
    })?;

    // Keep only the final component so a hostile file_name cannot escape
    // the output directory.
    let safe_name = Path::new(&file_name)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("delivery.bin");
    let out_path = out_dir.join(safe_name);
    std::fs::write(&out_path, &file_bytes).map_err(|e| {
        HandlerErr::new("export_failed", format!("failed to write file: {}", e))
    })?;

    Ok(json!({
        "deliveryId": delivery_id,
        "path": out_path.to_string_lossy(),
        "byteCount": file_bytes.len()
    }))
}

fn deliveries_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let delivery_id = get_required_str(params, "deliveryId")?;
    delivery_team(conn, &delivery_id)?;

    let tx = begin_tx(conn)?;
    exec_delete(&tx, "DELETE FROM grades WHERE delivery_id = ?", &delivery_id, "grades")?;
    exec_delete(&tx, "DELETE FROM deliveries WHERE id = ?", &delivery_id, "deliveries")?;
    commit_tx(tx)?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "deliveries.add" => deliveries_add(state, &req.params),
        "deliveries.info" => deliveries_info(state, &req.params),
        "deliveries.export" => deliveries_export(state, &req.params),
        "deliveries.delete" => deliveries_delete(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
