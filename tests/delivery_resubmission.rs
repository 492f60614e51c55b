use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradrd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradrd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn result_str(result: &serde_json::Value, key: &str) -> String {
    result
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, result))
        .to_string()
}

#[test]
fn resubmission_replaces_the_previous_delivery_and_its_grades() {
    let workspace = temp_dir("gradr-resubmission");
    let db_path = workspace.join("grading.sqlite3");
    let first_src = workspace.join("draft.pdf");
    let second_src = workspace.join("final.pdf");
    std::fs::write(&first_src, b"draft contents").expect("write first fixture");
    std::fs::write(&second_src, b"final contents, rather longer").expect("write second fixture");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "db.open",
        json!({ "path": db_path.to_string_lossy() }),
    );

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "Deliveries" }),
    );
    let subject_id = result_str(&subject, "subjectId");
    let classroom = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classrooms.create",
        json!({ "subjectId": subject_id }),
    );
    let classroom_id = result_str(&classroom, "classroomId");
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.create",
        json!({ "classroomId": classroom_id, "name": "Hopper" }),
    );
    let teacher_id = result_str(&teacher, "teacherId");
    let project = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "projects.create",
        json!({ "classroomId": classroom_id, "name": "Essay" }),
    );
    let project_id = result_str(&project, "projectId");
    let team = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "teams.create",
        json!({ "projectId": project_id }),
    );
    let team_id = result_str(&team, "teamId");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "deliveries.add",
        json!({ "teamId": team_id, "path": first_src.to_string_lossy() }),
    );
    let first_id = result_str(&first, "deliveryId");
    assert!(first.get("replacedDeliveryId").expect("field").is_null());
    assert_eq!(first.get("fileName").and_then(|v| v.as_str()), Some("draft.pdf"));

    // The exported copy matches the ingested bytes.
    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "deliveries.export",
        json!({
            "deliveryId": first_id,
            "outDir": workspace.join("previews").to_string_lossy()
        }),
    );
    let exported_path = PathBuf::from(result_str(&exported, "path"));
    assert_eq!(
        std::fs::read(&exported_path).expect("read exported file"),
        b"draft contents"
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.submit",
        json!({ "deliveryId": first_id, "teacherId": teacher_id, "grade": 4.0 }),
    );

    // Resubmit. The team keeps exactly one delivery and the stale grade
    // does not carry over to the new artifact.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "deliveries.add",
        json!({ "teamId": team_id, "path": second_src.to_string_lossy() }),
    );
    let second_id = result_str(&second, "deliveryId");
    assert_ne!(second_id, first_id);
    assert_eq!(
        second.get("replacedDeliveryId").and_then(|v| v.as_str()),
        Some(first_id.as_str())
    );

    let gone = request(
        &mut stdin,
        &mut reader,
        "11",
        "deliveries.info",
        json!({ "deliveryId": first_id }),
    );
    assert_eq!(error_code(&gone), "not_found");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.listForDelivery",
        json!({ "deliveryId": second_id }),
    );
    assert_eq!(
        listed.get("grades").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    assert!(listed.get("averageGrade").expect("field").is_null());

    let board = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "projects.board",
        json!({ "projectId": project_id }),
    );
    let teams = board.get("teams").and_then(|v| v.as_array()).expect("teams");
    assert_eq!(teams.len(), 1);
    let delivery = teams[0].get("delivery").expect("delivery");
    assert_eq!(
        delivery.get("fileName").and_then(|v| v.as_str()),
        Some("final.pdf")
    );
    assert!(teams[0].get("averageGrade").expect("field").is_null());

    // Info on the live delivery reports size and digest of the new bytes.
    let info = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "deliveries.info",
        json!({ "deliveryId": second_id }),
    );
    assert_eq!(
        info.get("byteCount").and_then(|v| v.as_i64()),
        Some(b"final contents, rather longer".len() as i64)
    );
    assert_eq!(
        info.get("fileSha256").and_then(|v| v.as_str()),
        second.get("fileSha256").and_then(|v| v.as_str())
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn export_into_an_unwritable_location_reports_export_failed() {
    let workspace = temp_dir("gradr-export-failure");
    let db_path = workspace.join("grading.sqlite3");
    let src = workspace.join("report.pdf");
    std::fs::write(&src, b"report contents").expect("write fixture");
    // A regular file where a directory is expected makes create_dir_all fail.
    let blocker = workspace.join("blocker");
    std::fs::write(&blocker, b"not a directory").expect("write blocker");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "db.open",
        json!({ "path": db_path.to_string_lossy() }),
    );
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "Exports" }),
    );
    let subject_id = result_str(&subject, "subjectId");
    let classroom = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classrooms.create",
        json!({ "subjectId": subject_id }),
    );
    let classroom_id = result_str(&classroom, "classroomId");
    let project = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "projects.create",
        json!({ "classroomId": classroom_id, "name": "Essay" }),
    );
    let project_id = result_str(&project, "projectId");
    let team = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teams.create",
        json!({ "projectId": project_id }),
    );
    let team_id = result_str(&team, "teamId");
    let delivery = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "deliveries.add",
        json!({ "teamId": team_id, "path": src.to_string_lossy() }),
    );
    let delivery_id = result_str(&delivery, "deliveryId");

    let failed = request(
        &mut stdin,
        &mut reader,
        "7",
        "deliveries.export",
        json!({
            "deliveryId": delivery_id,
            "outDir": blocker.join("previews").to_string_lossy()
        }),
    );
    assert_eq!(error_code(&failed), "export_failed");

    // A bad delivery id is still a parameter problem, not an export one.
    let missing = request(
        &mut stdin,
        &mut reader,
        "8",
        "deliveries.export",
        json!({ "deliveryId": "nope", "outDir": workspace.join("out").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
