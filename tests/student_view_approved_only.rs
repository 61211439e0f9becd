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
fn students_see_only_approved_results_filtered_by_term() {
    let workspace = temp_dir("resultd-student-view");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "JSS 1", "arms": ["A"] }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({ "name": "Ngozi Okafor", "email": "ngozi@school.test" }),
    );
    let teacher_id = teacher
        .get("teacherId")
        .and_then(|v| v.as_str())
        .expect("teacherId")
        .to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "4",
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

    let submit = |stdin: &mut ChildStdin,
                  reader: &mut BufReader<ChildStdout>,
                  id: &str,
                  term: &str|
     -> String {
        let submitted = request_ok(
            stdin,
            reader,
            id,
            "results.submit",
            json!({
                "studentId": student_id,
                "term": term,
                "session": "2024/2025",
                "submittedBy": teacher_id,
                "subjects": [
                    { "name": "Mathematics", "ca1": 18, "ca2": 19, "exam": 55 },
                    { "name": "English", "ca1": 15, "ca2": 16, "exam": 48 }
                ]
            }),
        );
        submitted
            .get("resultId")
            .and_then(|v| v.as_str())
            .expect("resultId")
            .to_string()
    };

    let first_term = submit(&mut stdin, &mut reader, "5", "first");
    let second_term = submit(&mut stdin, &mut reader, "6", "second");

    // Nothing approved yet; the student-facing view is empty.
    let before = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "results.forStudent",
        json!({ "studentId": student_id }),
    );
    assert_eq!(
        before.get("results").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "results.review",
        json!({ "resultId": first_term, "status": "APPROVED", "reviewedBy": "admin-1" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "results.review",
        json!({ "resultId": second_term, "status": "REJECTED", "reviewedBy": "admin-1" }),
    );

    let after = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "results.forStudent",
        json!({ "studentId": student_id }),
    );
    let results = after.get("results").and_then(|v| v.as_array()).expect("results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].get("term").and_then(|v| v.as_str()), Some("first"));
    assert_eq!(
        results[0].get("status").and_then(|v| v.as_str()),
        Some("APPROVED")
    );
    // Report card payload carries the subjects in submission order.
    let subjects = results[0]
        .get("subjects")
        .and_then(|v| v.as_array())
        .expect("subjects");
    assert_eq!(subjects.len(), 2);
    assert_eq!(subjects[0].get("name").and_then(|v| v.as_str()), Some("Mathematics"));
    assert_eq!(subjects[1].get("name").and_then(|v| v.as_str()), Some("English"));

    // Term filter that matches nothing stays empty.
    let third = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "results.forStudent",
        json!({ "studentId": student_id, "term": "third" }),
    );
    assert_eq!(
        third.get("results").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    // Session filter applies too.
    let wrong_session = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "results.forStudent",
        json!({ "studentId": student_id, "session": "2023/2024" }),
    );
    assert_eq!(
        wrong_session
            .get("results")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    let _ = std::fs::remove_dir_all(workspace);
}
