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

#[test]
fn sign_in_session_and_route_gates() {
    let workspace = temp_dir("colegio-auth-gate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let anon = request_ok(&mut stdin, &mut reader, "2", "session.get", json!({}));
    assert_eq!(anon, json!({ "authenticated": false }));
    let gate = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "session.gate",
        json!({ "route": "/teacher/groups" }),
    );
    assert_eq!(gate["allowed"], json!(false));
    assert_eq!(gate["redirect"], json!("/login"));
    let public = request_ok(&mut stdin, &mut reader, "4", "session.gate", json!({ "route": "/login" }));
    assert_eq!(public["allowed"], json!(true));

    let admin = bootstrap_admin(&mut stdin, &mut reader);
    let again = request(
        &mut stdin,
        &mut reader,
        "5",
        "auth.bootstrap",
        json!({ "email": "x@colegio.test", "password": "another-pass", "name": "X", "surname": "Y" }),
    );
    assert_eq!(error_code(&again), "conflict");

    let weak = request_as(
        &mut stdin,
        &mut reader,
        Some(&admin),
        "6",
        "users.create",
        json!({ "email": "t@colegio.test", "password": "short", "role": "teacher", "name": "T", "surname": "T" }),
    );
    assert_eq!(error_code(&weak), "bad_params");

    let teacher_id = create_user(
        &mut stdin, &mut reader, &admin, "Rosa@Colegio.test", "teacher", "Rosa", "Huaman", None,
    );
    let dup = request_as(
        &mut stdin,
        &mut reader,
        Some(&admin),
        "7",
        "users.create",
        json!({ "email": "rosa@colegio.test", "password": "user-pass-1", "role": "teacher", "name": "R", "surname": "H" }),
    );
    assert_eq!(error_code(&dup), "conflict");

    let wrong = request(
        &mut stdin,
        &mut reader,
        "8",
        "auth.signIn",
        json!({ "email": "rosa@colegio.test", "password": "nope-nope-nope" }),
    );
    assert_eq!(error_code(&wrong), "invalid_credentials");
    let unknown = request(
        &mut stdin,
        &mut reader,
        "9",
        "auth.signIn",
        json!({ "email": "ghost@colegio.test", "password": "user-pass-1" }),
    );
    assert_eq!(error_code(&unknown), "invalid_credentials");

    // Emails match case-insensitively.
    let teacher = sign_in(&mut stdin, &mut reader, "ROSA@colegio.test");
    let me = ok_as(&mut stdin, &mut reader, Some(&teacher), "10", "session.get", json!({}));
    assert_eq!(me["authenticated"], json!(true));
    assert_eq!(me["user"]["id"], json!(teacher_id));
    assert_eq!(me["user"]["role"], json!("teacher"));
    assert_eq!(me["user"]["profile"]["surname"], json!("Huaman"));

    let allowed = ok_as(
        &mut stdin,
        &mut reader,
        Some(&teacher),
        "11",
        "session.gate",
        json!({ "route": "/attendance/scan" }),
    );
    assert_eq!(allowed["allowed"], json!(true));
    let denied = ok_as(
        &mut stdin,
        &mut reader,
        Some(&teacher),
        "12",
        "session.gate",
        json!({ "route": "/admin/users" }),
    );
    assert_eq!(denied["allowed"], json!(false));
    assert_eq!(denied["redirect"], json!("/dashboard"));

    let forbidden = request_as(&mut stdin, &mut reader, Some(&teacher), "13", "users.list", json!({}));
    assert_eq!(error_code(&forbidden), "forbidden");
    let own = ok_as(&mut stdin, &mut reader, Some(&teacher), "14", "users.get", json!({}));
    assert_eq!(own["user"]["email"], json!("rosa@colegio.test"));
    let admin_profile = request_as(
        &mut stdin,
        &mut reader,
        Some(&teacher),
        "15",
        "users.get",
        json!({ "userId": "someone-else" }),
    );
    assert_eq!(error_code(&admin_profile), "forbidden");

    // Role changes apply to live sessions.
    let _ = ok_as(
        &mut stdin,
        &mut reader,
        Some(&admin),
        "16",
        "users.update",
        json!({ "userId": teacher_id, "patch": { "role": "staff" } }),
    );
    let now_staff = ok_as(&mut stdin, &mut reader, Some(&teacher), "17", "session.get", json!({}));
    assert_eq!(now_staff["user"]["role"], json!("staff"));

    let listed = ok_as(
        &mut stdin,
        &mut reader,
        Some(&admin),
        "18",
        "users.list",
        json!({ "role": "staff" }),
    );
    assert_eq!(listed["users"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(listed["view"]["state"], json!("populated"));
    let none = ok_as(
        &mut stdin,
        &mut reader,
        Some(&admin),
        "19",
        "users.list",
        json!({ "role": "student" }),
    );
    assert_eq!(none["view"]["state"], json!("empty"));

    let out = ok_as(&mut stdin, &mut reader, Some(&teacher), "21", "auth.signOut", json!({}));
    assert_eq!(out["revoked"], json!(true));
    let gone = ok_as(&mut stdin, &mut reader, Some(&teacher), "22", "session.get", json!({}));
    assert_eq!(gone["authenticated"], json!(false));

    let admin_me = ok_as(&mut stdin, &mut reader, Some(&admin), "23", "session.get", json!({}));
    let admin_id = admin_me["user"]["id"].as_str().expect("admin id").to_string();
    let refuse = request_as(
        &mut stdin,
        &mut reader,
        Some(&admin),
        "24",
        "users.delete",
        json!({ "userId": admin_id }),
    );
    assert_eq!(error_code(&refuse), "conflict");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
