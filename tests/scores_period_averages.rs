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
    let exe = env!("CARGO_BIN_EXE_colegiod");
    let mut child = Command::new(exe)
        .env_remove("COLEGIOD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn colegiod");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_as(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: Option<&str>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(t) = token {
        payload["token"] = json!(t);
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    request_as(stdin, reader, None, id, method, params)
}

fn ok_as(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: Option<&str>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request_as(stdin, reader, token, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    ok_as(stdin, reader, None, id, method, params)
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn bootstrap_admin(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let boot = request_ok(
        stdin,
        reader,
        "boot",
        "auth.bootstrap",
        json!({
            "email": "admin@colegio.test",
            "password": "admin-pass-1",
            "name": "Ada",
            "surname": "Root"
        }),
    );
    boot["token"].as_str().expect("admin token").to_string()
}

fn create_user(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin: &str,
    email: &str,
    role: &str,
    name: &str,
    surname: &str,
    dni: Option<&str>,
) -> String {
    let mut params = json!({
        "email": email,
        "password": "user-pass-1",
        "role": role,
        "name": name,
        "surname": surname
    });
    if let Some(d) = dni {
        params["dni"] = json!(d);
    }
    let created = ok_as(stdin, reader, Some(admin), "mkuser", "users.create", params);
    created["userId"].as_str().expect("userId").to_string()
}

fn sign_in(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, email: &str) -> String {
    let res = request_ok(
        stdin,
        reader,
        "signin",
        "auth.signIn",
        json!({ "email": email, "password": "user-pass-1" }),
    );
    res["token"].as_str().expect("token").to_string()
}

/// Grade, section, course and a teacher-owned group. Returns (grade_id, group_id).
fn seed_group(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin: &str,
    teacher_id: &str,
    course: &str,
) -> (String, String) {
    let grade = ok_as(stdin, reader, Some(admin), "g", "grades.create", json!({ "name": "Primero", "level": 1 }));
    let grade_id = grade["gradeId"].as_str().expect("gradeId").to_string();
    let section = ok_as(
        stdin,
        reader,
        Some(admin),
        "s",
        "sections.create",
        json!({ "name": "A", "gradeId": grade_id }),
    );
    let course = ok_as(
        stdin,
        reader,
        Some(admin),
        "c",
        "courses.create",
        json!({ "name": course, "description": "" }),
    );
    let group = ok_as(
        stdin,
        reader,
        Some(admin),
        "grp",
        "groups.create",
        json!({
            "gradeId": grade_id,
            "sectionId": section["sectionId"],
            "courseId": course["courseId"],
            "teacherId": teacher_id,
            "schoolYear": 2026
        }),
    );
    (grade_id, group["groupId"].as_str().expect("groupId").to_string())
}

#[test]
fn scores_period_averages_and_scoping() {
    let workspace = temp_dir("colegio-scores");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = bootstrap_admin(&mut stdin, &mut reader);
    let teacher_id = create_user(
        &mut stdin, &mut reader, &admin, "rosa@colegio.test", "teacher", "Rosa", "Huaman", None,
    );
    let other_teacher_id = create_user(
        &mut stdin, &mut reader, &admin, "juan@colegio.test", "teacher", "Juan", "Lopez", None,
    );
    let student_id = create_user(
        &mut stdin, &mut reader, &admin, "ana@colegio.test", "student", "Ana", "Perez", None,
    );
    let outsider_id = create_user(
        &mut stdin, &mut reader, &admin, "leo@colegio.test", "student", "Leo", "Vega", None,
    );
    let (_grade_id, group_id) = seed_group(&mut stdin, &mut reader, &admin, &teacher_id, "Matematica");
    let (_, other_group) = seed_group(&mut stdin, &mut reader, &admin, &other_teacher_id, "Historia");

    let _ = ok_as(
        &mut stdin,
        &mut reader,
        Some(&admin),
        "2",
        "assignments.create",
        json!({ "studentId": student_id, "groupId": group_id }),
    );
    let teacher_as_student = request_as(
        &mut stdin,
        &mut reader,
        Some(&admin),
        "3",
        "assignments.create",
        json!({ "studentId": teacher_id, "groupId": group_id }),
    );
    assert_eq!(error_code(&teacher_as_student), "bad_params");

    let teacher = sign_in(&mut stdin, &mut reader, "rosa@colegio.test");
    for (i, value) in [80.0, 90.0, 100.0].iter().enumerate() {
        let _ = ok_as(
            &mut stdin,
            &mut reader,
            Some(&teacher),
            &format!("score-{}", i),
            "scores.create",
            json!({
                "studentId": student_id,
                "groupId": group_id,
                "value": value,
                "description": format!("Practica {}", i + 1),
                "date": format!("2026-04-0{}", i + 1),
                "period": "Bimestre 1"
            }),
        );
    }
    let _ = ok_as(
        &mut stdin,
        &mut reader,
        Some(&teacher),
        "4",
        "scores.create",
        json!({ "studentId": student_id, "groupId": group_id, "value": 70, "period": "Bimestre 2", "date": "2026-06-01" }),
    );

    let out_of_range = request_as(
        &mut stdin,
        &mut reader,
        Some(&teacher),
        "5",
        "scores.create",
        json!({ "studentId": student_id, "groupId": group_id, "value": 101, "period": "Bimestre 1" }),
    );
    assert_eq!(error_code(&out_of_range), "bad_params");
    let unassigned = request_as(
        &mut stdin,
        &mut reader,
        Some(&teacher),
        "6",
        "scores.create",
        json!({ "studentId": outsider_id, "groupId": group_id, "value": 50, "period": "Bimestre 1" }),
    );
    assert_eq!(error_code(&unassigned), "bad_params");
    let not_mine = request_as(
        &mut stdin,
        &mut reader,
        Some(&teacher),
        "7",
        "scores.create",
        json!({ "studentId": student_id, "groupId": other_group, "value": 50, "period": "Bimestre 1" }),
    );
    assert_eq!(error_code(&not_mine), "forbidden");

    let summary = ok_as(
        &mut stdin,
        &mut reader,
        Some(&teacher),
        "8",
        "scores.summary",
        json!({ "studentId": student_id }),
    );
    assert_eq!(summary["count"], json!(4));
    assert_eq!(summary["periodAverages"]["Bimestre 1"], json!(90.0));
    assert_eq!(summary["periodAverages"]["Bimestre 2"], json!(70.0));
    assert_eq!(summary["average"], json!(85.0));

    let listed = ok_as(
        &mut stdin,
        &mut reader,
        Some(&teacher),
        "9",
        "scores.list",
        json!({ "groupId": group_id, "period": "Bimestre 1" }),
    );
    let scores = listed["scores"].as_array().expect("scores");
    assert_eq!(scores.len(), 3);
    assert_eq!(scores[0]["date"], json!("2026-04-03"));
    assert_eq!(scores[0]["courseName"], json!("Matematica"));
    assert_eq!(scores[0]["student"]["name"], json!("Ana"));

    let student = sign_in(&mut stdin, &mut reader, "ana@colegio.test");
    let mine = ok_as(&mut stdin, &mut reader, Some(&student), "10", "scores.list", json!({}));
    assert_eq!(mine["scores"].as_array().map(|a| a.len()), Some(4));
    let peek = ok_as(
        &mut stdin,
        &mut reader,
        Some(&student),
        "11",
        "scores.list",
        json!({ "studentId": outsider_id }),
    );
    assert_eq!(peek["scores"].as_array().map(|a| a.len()), Some(4));
    let notes = ok_as(&mut stdin, &mut reader, Some(&student), "12", "notifications.list", json!({}));
    assert_eq!(notes["unread"], json!(4));
    assert_eq!(notes["notifications"][0]["title"], json!("New grade"));

    let first_id = scores[0]["id"].as_str().expect("score id").to_string();
    let _ = ok_as(
        &mut stdin,
        &mut reader,
        Some(&teacher),
        "13",
        "scores.update",
        json!({ "scoreId": first_id, "patch": { "value": 40 } }),
    );
    let moved = request_as(
        &mut stdin,
        &mut reader,
        Some(&teacher),
        "14",
        "scores.update",
        json!({ "scoreId": first_id, "patch": { "groupId": other_group } }),
    );
    assert_eq!(error_code(&moved), "forbidden");
    let after = ok_as(
        &mut stdin,
        &mut reader,
        Some(&student),
        "15",
        "scores.summary",
        json!({}),
    );
    assert_eq!(after["periodAverages"]["Bimestre 1"], json!(70.0));

    let _ = ok_as(
        &mut stdin,
        &mut reader,
        Some(&teacher),
        "16",
        "scores.delete",
        json!({ "scoreId": first_id }),
    );
    let student_write = request_as(
        &mut stdin,
        &mut reader,
        Some(&student),
        "17",
        "scores.delete",
        json!({ "scoreId": first_id }),
    );
    assert_eq!(error_code(&student_write), "forbidden");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
