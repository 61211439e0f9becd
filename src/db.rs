use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("results.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            arms TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            arm TEXT NOT NULL,
            admission_no TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            code TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_assignments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            arm TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(teacher_id, class_id, arm, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_assignments_teacher ON teacher_assignments(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_assignments_class ON teacher_assignments(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            is_current INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            arm TEXT NOT NULL,
            term TEXT NOT NULL,
            session TEXT NOT NULL,
            total_score INTEGER NOT NULL,
            average_score REAL NOT NULL,
            status TEXT NOT NULL,
            position INTEGER,
            total_students INTEGER,
            class_teacher_remark TEXT,
            principal_remark TEXT,
            recommendation TEXT,
            submitted_by TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            approved_by TEXT,
            approved_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_student ON results(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_scope ON results(class_id, term, session, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_submitted_by ON results(submitted_by)",
        [],
    )?;
    // Backstop against concurrent duplicate submissions. REJECTED results are
    // excluded so a teacher can resubmit after a rejection.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_results_live_identity
         ON results(student_id, term, session)
         WHERE status IN ('PENDING', 'APPROVED')",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_subjects(
            id TEXT PRIMARY KEY,
            result_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            name TEXT NOT NULL,
            ca1 INTEGER NOT NULL,
            ca2 INTEGER NOT NULL,
            exam INTEGER NOT NULL,
            total INTEGER NOT NULL,
            grade TEXT NOT NULL,
            remark TEXT,
            FOREIGN KEY(result_id) REFERENCES results(id),
            UNIQUE(result_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_result_subjects_result ON result_subjects(result_id)",
        [],
    )?;

    Ok(conn)
}
