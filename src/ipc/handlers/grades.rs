use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_opt_str, get_required_f64, get_required_str, not_found, query_failed, require_db,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use super::deliveries::delivery_team;

fn delivery_classroom(conn: &Connection, delivery_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT p.classroom_id
         FROM deliveries d
         JOIN teams t ON t.id = d.team_id
         JOIN projects p ON p.id = t.project_id
         WHERE d.id = ?",
        [delivery_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(query_failed)?
    .ok_or_else(|| not_found("delivery"))
}

fn grades_submit(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let delivery_id = get_required_str(params, "deliveryId")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let grade = get_required_f64(params, "grade")?;
    if !(0.0..=10.0).contains(&grade) {
        return Err(HandlerErr::new(
            "grade_out_of_range",
            "grade must be between 0 and 10",
        ));
    }
    let comments = get_opt_str(params, "comments");

    let classroom_id = delivery_classroom(conn, &delivery_id)?;
    let teacher_classroom: Option<String> = conn
        .query_row(
            "SELECT classroom_id FROM teachers WHERE id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    let Some(teacher_classroom) = teacher_classroom else {
        return Err(not_found("teacher"));
    };
    if teacher_classroom != classroom_id {
        return Err(HandlerErr::new(
            "teacher_not_in_classroom",
            "teacher does not teach the delivery's classroom",
        ));
    }

    let existing: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM grades WHERE delivery_id = ? AND teacher_id = ?",
            (&delivery_id, &teacher_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;

    conn.execute(
        "INSERT INTO grades(delivery_id, teacher_id, grade, comments)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(delivery_id, teacher_id)
         DO UPDATE SET grade = excluded.grade, comments = excluded.comments",
        (&delivery_id, &teacher_id, grade, &comments),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "grades" }))
    })?;

    Ok(json!({
        "deliveryId": delivery_id,
        "teacherId": teacher_id,
        "grade": grade,
        "updated": existing.is_some()
    }))
}

fn grades_get(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let delivery_id = get_required_str(params, "deliveryId")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    delivery_team(conn, &delivery_id)?;

    let row = conn
        .query_row(
            "SELECT grade, comments FROM grades WHERE delivery_id = ? AND teacher_id = ?",
            (&delivery_id, &teacher_id),
            |r| {
                let grade: f64 = r.get(0)?;
                let comments: Option<String> = r.get(1)?;
                Ok((grade, comments))
            },
        )
        .optional()
        .map_err(query_failed)?;

    let grade = row.map(|(grade, comments)| {
        json!({
            "deliveryId": delivery_id,
            "teacherId": teacher_id,
            "grade": grade,
            "comments": comments
        })
    });
    Ok(json!({ "grade": grade }))
}

fn grades_list_for_delivery(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let delivery_id = get_required_str(params, "deliveryId")?;
    delivery_team(conn, &delivery_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT g.teacher_id, te.name, g.grade, g.comments
             FROM grades g
             JOIN teachers te ON te.id = g.teacher_id
             WHERE g.delivery_id = ?
             ORDER BY te.name",
        )
        .map_err(query_failed)?;

    let grades = stmt
        .query_map([&delivery_id], |row| {
            let teacher_id: String = row.get(0)?;
            let teacher_name: String = row.get(1)?;
            let grade: f64 = row.get(2)?;
            let comments: Option<String> = row.get(3)?;
            Ok(json!({
                "teacherId": teacher_id,
                "teacherName": teacher_name,
                "grade": grade,
                "comments": comments
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let average: Option<f64> = conn
        .query_row(
            "SELECT AVG(grade) FROM grades WHERE delivery_id = ?",
            [&delivery_id],
            |r| r.get(0),
        )
        .map_err(query_failed)?;

    Ok(json!({
        "deliveryId": delivery_id,
        "grades": grades,
        "averageGrade": average
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "grades.submit" => grades_submit(state, &req.params),
        "grades.get" => grades_get(state, &req.params),
        "grades.listForDelivery" => grades_list_for_delivery(state, &req.params),
        _ => return None,
    };
    Some(match out {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
