use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Database file from the pre-project-scoped era. Its teams belong to a
/// classroom and may span several projects, so there is no faithful
/// mapping into the current schema.
#[derive(Debug)]
pub struct UnsupportedSchema(pub String);

impl std::fmt::Display for UnsupportedSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unsupported database schema: {}", self.0)
    }
}

impl std::error::Error for UnsupportedSchema {}

pub fn open_db(db_path: &Path) -> anyhow::Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(db_path)?;

    // Schema creation and shape fixes run as one unit, with foreign-key
    // enforcement off until the fixes are done: the deliveries rebuild
    // briefly leaves grades pointing at a table mid-rename.
    {
        let tx = conn.unchecked_transaction()?;
        reject_unsupported_schema(&tx)?;
        create_tables(&tx)?;
        ensure_students_decoupled(&tx)?;
        ensure_deliveries_modern_shape(&tx)?;
        ensure_deliveries_team_scoped(&tx)?;
        ensure_deliveries_file_sha256(&tx)?;
        create_indexes(&tx)?;
        tx.commit()?;
    }
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    Ok(conn)
}

/// Files from before teams were scoped to a project keyed grades by
/// (project, team, teacher) and let one team work across projects. Refuse
/// them up front rather than failing on some later statement.
fn reject_unsupported_schema(conn: &Connection) -> anyhow::Result<()> {
    if table_exists(conn, "teams")? && !table_has_column(conn, "teams", "project_id")? {
        return Err(UnsupportedSchema(
            "teams are classroom-scoped; this file predates project-scoped teams".to_string(),
        )
        .into());
    }
    if table_exists(conn, "grades")? && !table_has_column(conn, "grades", "delivery_id")? {
        return Err(UnsupportedSchema(
            "grades are keyed by project and team; this file predates delivery-keyed grading"
                .to_string(),
        )
        .into());
    }
    Ok(())
}

fn create_tables(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classroom_memberships(
            student_id TEXT NOT NULL,
            classroom_id TEXT NOT NULL,
            PRIMARY KEY(student_id, classroom_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS projects(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teams(
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            FOREIGN KEY(project_id) REFERENCES projects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS team_memberships(
            student_id TEXT NOT NULL,
            team_id TEXT NOT NULL,
            PRIMARY KEY(student_id, team_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(team_id) REFERENCES teams(id)
        )",
        [],
    )?;

    // One delivery per team; resubmission replaces the previous row.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS deliveries(
            id TEXT PRIMARY KEY,
            team_id TEXT NOT NULL UNIQUE,
            submitted_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            file_name TEXT NOT NULL,
            file_sha256 TEXT NOT NULL,
            file_bytes BLOB NOT NULL,
            FOREIGN KEY(team_id) REFERENCES teams(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            delivery_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            grade REAL NOT NULL CHECK(grade >= 0.0 AND grade <= 10.0),
            comments TEXT,
            PRIMARY KEY(delivery_id, teacher_id),
            FOREIGN KEY(delivery_id) REFERENCES deliveries(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    Ok(())
}

// Indexes come after the shape fixes; idx_grades_delivery would fail
// against a grades table that still lacks delivery_id.
fn create_indexes(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classrooms_subject ON classrooms(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classroom_memberships_classroom
         ON classroom_memberships(classroom_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_classroom ON teachers(classroom_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_projects_classroom ON projects(classroom_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teams_project ON teams(project_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_team_memberships_team ON team_memberships(team_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_delivery ON grades(delivery_id)",
        [],
    )?;
    Ok(())
}

/// An earlier revision scoped students to a classroom directly. Move that
/// column into classroom_memberships so the same student can appear in
/// several classrooms.
fn ensure_students_decoupled(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "classroom_id")? {
        return Ok(());
    }
    conn.execute(
        "INSERT OR IGNORE INTO classroom_memberships(student_id, classroom_id)
         SELECT s.id, s.classroom_id
         FROM students s
         JOIN classrooms c ON c.id = s.classroom_id",
        [],
    )?;
    conn.execute("ALTER TABLE students DROP COLUMN classroom_id", [])?;
    Ok(())
}

/// An earlier revision named the delivery columns `file` and `timestamp`,
/// carried no file name or digest, and allowed several rows per team.
/// Rebuild the table under the current shape, keeping the most recent row
/// per team; grades attached to superseded rows go with them.
fn ensure_deliveries_modern_shape(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "deliveries", "file")? {
        return Ok(());
    }
    conn.execute(
        "CREATE TABLE deliveries_migrated(
            id TEXT PRIMARY KEY,
            team_id TEXT NOT NULL UNIQUE,
            submitted_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            file_name TEXT NOT NULL,
            file_sha256 TEXT NOT NULL,
            file_bytes BLOB NOT NULL,
            FOREIGN KEY(team_id) REFERENCES teams(id)
        )",
        [],
    )?;
    // The old format stored no file name; exports of migrated rows fall
    // back to the same placeholder the export handler uses. The digest is
    // backfilled by ensure_deliveries_file_sha256.
    conn.execute(
        "INSERT INTO deliveries_migrated(id, team_id, submitted_at, file_name, file_sha256, file_bytes)
         SELECT id, team_id, timestamp, 'delivery.bin', '', file
         FROM deliveries
         WHERE rowid IN (SELECT MAX(rowid) FROM deliveries GROUP BY team_id)",
        [],
    )?;
    conn.execute(
        "DELETE FROM grades
         WHERE delivery_id NOT IN (SELECT id FROM deliveries_migrated)",
        [],
    )?;
    conn.execute("DROP TABLE deliveries", [])?;
    conn.execute("ALTER TABLE deliveries_migrated RENAME TO deliveries", [])?;
    Ok(())
}

/// An earlier revision stored project_id on deliveries as well; the team
/// already determines the project.
fn ensure_deliveries_team_scoped(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "deliveries", "project_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE deliveries DROP COLUMN project_id", [])?;
    Ok(())
}

fn ensure_deliveries_file_sha256(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "deliveries", "file_sha256")? {
        conn.execute(
            "ALTER TABLE deliveries ADD COLUMN file_sha256 TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }

    // Covers both a freshly added column and rows rebuilt by the
    // modern-shape migration, which leaves the digest empty.
    let mut stmt =
        conn.prepare("SELECT id, file_bytes FROM deliveries WHERE file_sha256 = ''")?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let bytes: Vec<u8> = r.get(1)?;
            Ok((id, bytes))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (id, bytes) in rows {
        conn.execute(
            "UPDATE deliveries SET file_sha256 = ? WHERE id = ?",
            (sha256_hex(&bytes), &id),
        )?;
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> anyhow::Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            [table],
            |r| r.get::<_, i64>(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
