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
    let exe = env!("CARGO_BIN_EXE_resultd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultd");
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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
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

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("resultd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "JSS 1", "arms": ["A", "B"] }),
    );
    let class_id = created
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "4", "classes.list", json!({}));

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.create",
        json!({ "name": "Ngozi Okafor", "email": "ngozi@school.test" }),
    );
    let teacher_id = teacher
        .get("teacherId")
        .and_then(|v| v.as_str())
        .expect("teacherId")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "6", "teachers.list", json!({}));

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.create",
        json!({ "name": "Mathematics", "code": "mat" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "8", "subjects.list", json!({}));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "teachers.assign",
        json!({
            "teacherId": teacher_id,
            "classId": class_id,
            "arm": "A",
            "subjectId": subject_id
        }),
    );
    let assignments = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "teachers.assignments",
        json!({ "teacherId": teacher_id }),
    );
    assert_eq!(
        assignments
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "sessions.create",
        json!({ "name": "2024/2025" }),
    );
    let session_id = session
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "sessions.setCurrent",
        json!({ "sessionId": session_id }),
    );
    let sessions = request_ok(&mut stdin, &mut reader, "13", "sessions.list", json!({}));
    let current = sessions
        .get("sessions")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|s| s.get("isCurrent"))
        .and_then(|v| v.as_bool());
    assert_eq!(current, Some(true));

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "students.create",
        json!({
            "classId": class_id,
            "arm": "A",
            "admissionNo": "STU001",
            "lastName": "Adeyemi",
            "firstName": "Tunde"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "students.list",
        json!({ "classId": class_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "students.update",
        json!({ "studentId": student_id, "patch": { "firstName": "Babatunde" } }),
    );

    let _ = request_ok(&mut stdin, &mut reader, "17", "results.list", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "results.listSubmitted",
        json!({ "submittedBy": teacher_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "results.forStudent",
        json!({ "studentId": student_id }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "classes.delete",
        json!({ "classId": class_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
