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
fn dashboards_aggregate_per_role() {
    let workspace = temp_dir("colegio-dashboards");
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
    let ana = create_user(
        &mut stdin, &mut reader, &admin, "ana@colegio.test", "student", "Ana", "Perez", None,
    );
    let luis = create_user(
        &mut stdin, &mut reader, &admin, "luis@colegio.test", "student", "Luis", "Quispe", None,
    );

    let empty_teacher = sign_in(&mut stdin, &mut reader, "rosa@colegio.test");
    let before = ok_as(&mut stdin, &mut reader, Some(&empty_teacher), "2", "dashboard.teacher", json!({}));
    assert_eq!(before["view"]["state"], json!("empty"));
    assert_eq!(before["recentScores"], json!([]));

    let (grade_id, math) = seed_group(&mut stdin, &mut reader, &admin, &teacher_id, "Matematica");
    let sections = ok_as(
        &mut stdin,
        &mut reader,
        Some(&admin),
        "3",
        "sections.list",
        json!({ "gradeId": grade_id }),
    );
    let section_id = sections["sections"][0]["id"].as_str().expect("section").to_string();
    assert_eq!(sections["sections"][0]["gradeName"], json!("Primero"));
    let science_course = ok_as(
        &mut stdin,
        &mut reader,
        Some(&admin),
        "4",
        "courses.create",
        json!({ "name": "Ciencia" }),
    );
    let science = ok_as(
        &mut stdin,
        &mut reader,
        Some(&admin),
        "5",
        "groups.create",
        json!({
            "gradeId": grade_id,
            "sectionId": section_id,
            "courseId": science_course["courseId"],
            "teacherId": teacher_id,
            "schoolYear": 2026
        }),
    )["groupId"]
        .as_str()
        .expect("groupId")
        .to_string();

    // Ana takes both courses of the same grade; she still counts once.
    for (i, (student, group)) in [(&ana, &math), (&ana, &science), (&luis, &math)].iter().enumerate() {
        let created = ok_as(
            &mut stdin,
            &mut reader,
            Some(&admin),
            &format!("assign-{}", i),
            "assignments.create",
            json!({ "studentId": student, "groupId": group }),
        );
        assert_eq!(created["gradeId"], json!(grade_id));
        assert_eq!(created["sectionId"], json!(section_id));
    }
    let duplicate = request_as(
        &mut stdin,
        &mut reader,
        Some(&admin),
        "6",
        "assignments.create",
        json!({ "studentId": ana, "groupId": math }),
    );
    assert_eq!(error_code(&duplicate), "conflict");

    let teacher = sign_in(&mut stdin, &mut reader, "rosa@colegio.test");
    for (i, (student, group, value)) in [(&ana, &math, 80.0), (&ana, &science, 60.0), (&luis, &math, 100.0)]
        .iter()
        .enumerate()
    {
        let _ = ok_as(
            &mut stdin,
            &mut reader,
            Some(&teacher),
            &format!("score-{}", i),
            "scores.create",
            json!({ "studentId": student, "groupId": group, "value": value, "period": "B1", "date": "2026-05-04" }),
        );
    }

    let admin_view = ok_as(&mut stdin, &mut reader, Some(&admin), "7", "dashboard.admin", json!({}));
    assert_eq!(admin_view["usersByRole"]["student"], json!(2));
    assert_eq!(admin_view["usersByRole"]["staff"], json!(0));
    assert_eq!(admin_view["catalog"]["groups"], json!(2));
    let per_grade = admin_view["studentsPerGrade"].as_array().expect("per grade");
    assert_eq!(per_grade.len(), 1);
    assert_eq!(per_grade[0]["students"], json!(2));
    assert_eq!(per_grade[0]["gradeName"], json!("Primero"));
    assert_eq!(admin_view["attendanceToday"]["percentages"]["attendance"], json!(0));

    let teacher_view = ok_as(&mut stdin, &mut reader, Some(&teacher), "8", "dashboard.teacher", json!({}));
    assert_eq!(teacher_view["view"]["state"], json!("populated"));
    assert_eq!(teacher_view["totalStudents"], json!(2));
    let cards = teacher_view["groups"].as_array().expect("cards");
    let math_card = cards
        .iter()
        .find(|c| c["group"]["id"] == json!(math))
        .expect("math card");
    assert_eq!(math_card["students"], json!(2));
    assert_eq!(math_card["scoreAverage"], json!(90.0));
    assert_eq!(math_card["scoreCount"], json!(2));
    assert_eq!(math_card["group"]["courseName"], json!("Matematica"));
    assert_eq!(teacher_view["recentScores"].as_array().map(|a| a.len()), Some(3));

    let student = sign_in(&mut stdin, &mut reader, "ana@colegio.test");
    let student_view = ok_as(&mut stdin, &mut reader, Some(&student), "9", "dashboard.student", json!({}));
    assert_eq!(student_view["assignments"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(student_view["scores"]["periodAverages"]["B1"], json!(70.0));
    assert_eq!(student_view["attendance"]["percentages"]["attendance"], json!(0));
    assert_eq!(student_view["unreadNotifications"], json!(2));
    let by_course: Vec<&serde_json::Value> = student_view["courseAverages"]
        .as_array()
        .expect("course averages")
        .iter()
        .collect();
    assert_eq!(by_course.len(), 2);
    assert!(by_course
        .iter()
        .any(|c| c["courseName"] == json!("Ciencia") && c["average"] == json!(60.0)));

    let wrong_role = request_as(&mut stdin, &mut reader, Some(&student), "10", "dashboard.admin", json!({}));
    assert_eq!(error_code(&wrong_role), "forbidden");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
