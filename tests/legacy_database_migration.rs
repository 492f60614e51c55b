use rusqlite::Connection;
use serde_json::json;
use sha2::{Digest, Sha256};
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

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// A file written under the earlier format: students carry classroom_id
/// directly, and deliveries are named file/timestamp with a project_id
/// column, no file name or digest, and several rows per team.
fn write_old_format_db(db_path: &PathBuf) {
    let conn = Connection::open(db_path).expect("create fixture db");
    conn.execute_batch(
        "CREATE TABLE subjects(id TEXT PRIMARY KEY, name TEXT NOT NULL, description TEXT);
         CREATE TABLE classrooms(id TEXT PRIMARY KEY, subject_id TEXT NOT NULL);
         CREATE TABLE students(id TEXT PRIMARY KEY, name TEXT NOT NULL, classroom_id TEXT NOT NULL);
         CREATE TABLE teachers(id TEXT PRIMARY KEY, classroom_id TEXT NOT NULL, name TEXT NOT NULL);
         CREATE TABLE projects(id TEXT PRIMARY KEY, classroom_id TEXT NOT NULL, name TEXT NOT NULL, description TEXT);
         CREATE TABLE teams(id TEXT PRIMARY KEY, project_id TEXT NOT NULL);
         CREATE TABLE team_memberships(student_id TEXT NOT NULL, team_id TEXT NOT NULL,
            PRIMARY KEY(student_id, team_id));
         CREATE TABLE deliveries(id TEXT PRIMARY KEY, project_id TEXT NOT NULL,
            team_id TEXT NOT NULL, timestamp TEXT NOT NULL, file BLOB NOT NULL);
         CREATE TABLE grades(delivery_id TEXT NOT NULL, teacher_id TEXT NOT NULL,
            grade REAL NOT NULL, comments TEXT, PRIMARY KEY(delivery_id, teacher_id));

         INSERT INTO subjects(id, name) VALUES('s1', 'Databases');
         INSERT INTO classrooms(id, subject_id) VALUES('c1', 's1');
         INSERT INTO students(id, name, classroom_id) VALUES('st1', 'Noor', 'c1');
         INSERT INTO teachers(id, classroom_id, name) VALUES('t1', 'c1', 'Prof Vik');
         INSERT INTO projects(id, classroom_id, name) VALUES('p1', 'c1', 'ER Modeling');
         INSERT INTO teams(id, project_id) VALUES('tm1', 'p1');
         INSERT INTO team_memberships(student_id, team_id) VALUES('st1', 'tm1');",
    )
    .expect("create fixture schema");

    conn.execute(
        "INSERT INTO deliveries(id, project_id, team_id, timestamp, file)
         VALUES('d1', 'p1', 'tm1', '2024-04-20T09:00:00Z', ?)",
        [&b"first draft".to_vec()],
    )
    .expect("insert superseded delivery");
    conn.execute(
        "INSERT INTO deliveries(id, project_id, team_id, timestamp, file)
         VALUES('d2', 'p1', 'tm1', '2024-05-01T10:00:00Z', ?)",
        [&b"final submission".to_vec()],
    )
    .expect("insert latest delivery");
    conn.execute_batch(
        "INSERT INTO grades(delivery_id, teacher_id, grade) VALUES('d1', 't1', 6.0);
         INSERT INTO grades(delivery_id, teacher_id, grade) VALUES('d2', 't1', 9.0);",
    )
    .expect("insert fixture grades");
}

#[test]
fn old_format_database_is_migrated_on_open() {
    let workspace = temp_dir("gradr-legacy-migrate");
    let db_path = workspace.join("grading.sqlite3");
    write_old_format_db(&db_path);

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "db.open",
        json!({ "path": db_path.to_string_lossy() }),
    );

    // classroom_id moved off the student row into a membership.
    let members = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classrooms.members",
        json!({ "classroomId": "c1" }),
    );
    let member_names: Vec<&str> = members
        .get("members")
        .and_then(|v| v.as_array())
        .expect("members")
        .iter()
        .filter_map(|m| m.get("name").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(member_names, vec!["Noor"]);

    let students = request_ok(&mut stdin, &mut reader, "3", "students.list", json!({}));
    let rows = students.get("students").and_then(|v| v.as_array()).expect("students");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("classroomCount").and_then(|v| v.as_i64()), Some(1));

    // Only the latest row per team survives the deliveries rebuild.
    let info = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "deliveries.info",
        json!({ "deliveryId": "d2" }),
    );
    assert_eq!(info.get("fileName").and_then(|v| v.as_str()), Some("delivery.bin"));
    assert_eq!(
        info.get("fileSha256").and_then(|v| v.as_str()),
        Some(sha256_hex(b"final submission").as_str())
    );
    assert_eq!(
        info.get("byteCount").and_then(|v| v.as_i64()),
        Some(b"final submission".len() as i64)
    );
    assert_eq!(
        info.get("submittedAt").and_then(|v| v.as_str()),
        Some("2024-05-01T10:00:00Z")
    );

    let gone = request(
        &mut stdin,
        &mut reader,
        "5",
        "deliveries.info",
        json!({ "deliveryId": "d1" }),
    );
    assert_eq!(error_code(&gone), "not_found");

    // The superseded row's grade went with it; the latest one kept its.
    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.listForDelivery",
        json!({ "deliveryId": "d2" }),
    );
    let grades = graded.get("grades").and_then(|v| v.as_array()).expect("grades");
    assert_eq!(grades.len(), 1);
    assert_eq!(grades[0].get("grade").and_then(|v| v.as_f64()), Some(9.0));

    let board = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "projects.board",
        json!({ "projectId": "p1" }),
    );
    let teams = board.get("teams").and_then(|v| v.as_array()).expect("teams");
    assert_eq!(teams.len(), 1);
    assert_eq!(
        teams[0]
            .get("delivery")
            .and_then(|d| d.get("deliveryId"))
            .and_then(|v| v.as_str()),
        Some("d2")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn classroom_scoped_team_era_files_are_refused() {
    let workspace = temp_dir("gradr-legacy-refuse");
    let db_path = workspace.join("old-app.sqlite3");

    // Teams belonged to a classroom and grades were keyed by project and
    // team; there is no faithful mapping for that era.
    let conn = Connection::open(&db_path).expect("create fixture db");
    conn.execute_batch(
        "CREATE TABLE classrooms(id INTEGER PRIMARY KEY, subject_id INTEGER NOT NULL);
         CREATE TABLE teams(id INTEGER PRIMARY KEY, classroom_id INTEGER NOT NULL);
         CREATE TABLE deliveries(id INTEGER PRIMARY KEY, project_id INTEGER NOT NULL,
            team_id INTEGER NOT NULL, timestamp TEXT NOT NULL, file BLOB NOT NULL);
         CREATE TABLE grades(project_id INTEGER NOT NULL, team_id INTEGER NOT NULL,
            teacher_id INTEGER NOT NULL, grade REAL NOT NULL,
            PRIMARY KEY(project_id, team_id, teacher_id));
         INSERT INTO teams(id, classroom_id) VALUES(1, 1);",
    )
    .expect("create fixture schema");
    drop(conn);

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let refused = request(
        &mut stdin,
        &mut reader,
        "1",
        "db.open",
        json!({ "path": db_path.to_string_lossy() }),
    );
    assert_eq!(error_code(&refused), "unsupported_schema");

    // The refused file is left as-is and the sidecar stays usable.
    let fresh_path = workspace.join("fresh.sqlite3");
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "db.open",
        json!({ "path": fresh_path.to_string_lossy() }),
    );
    request_ok(&mut stdin, &mut reader, "3", "subjects.list", json!({}));

    let check = Connection::open(&db_path).expect("reopen fixture db");
    let has_project_id: i64 = check
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_info('teams') WHERE name = 'project_id'",
            [],
            |r| r.get(0),
        )
        .expect("inspect fixture");
    assert_eq!(has_project_id, 0);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
