use crate::auth::{self, Gate};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{db_conn, new_id, now_rfc3339, required_str, respond};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Value};

fn users_count(conn: &Connection) -> Result<i64, HandlerErr> {
    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?)
}

fn start_session(state: &mut AppState, user_id: &str) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let token = auth::create_session(conn, user_id, Utc::now(), state.config.session_ttl_hours)?;
    let who = auth::load_identity(conn, user_id)?.ok_or(HandlerErr::NotFound("user"))?;
    tracing::info!(user_id = %who.id, role = who.role.as_str(), "signed in");
    state.session_token = Some(token.clone());
    Ok(json!({ "token": token, "user": who }))
}

fn auth_bootstrap(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let email = required_str(params, "email")?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    let name = required_str(params, "name")?;
    let surname = required_str(params, "surname")?;
    if !email.contains('@') {
        return Err(HandlerErr::bad_params("email must contain @"));
    }
    auth::validate_password_strength(password, state.config.min_password_len)
        .map_err(HandlerErr::BadParams)?;

    let conn = db_conn(state)?;
    if users_count(conn)? > 0 {
        return Err(HandlerErr::Conflict(
            "workspace already has users; sign in instead".to_string(),
        ));
    }
    let hash = auth::hash_password(password)
        .map_err(|e| HandlerErr::Internal(anyhow::anyhow!("password hashing failed: {e}")))?;
    let user_id = new_id();
    conn.execute(
        "INSERT INTO users(id, email, password_hash, role, name, surname, dni, created_at)
         VALUES(?, ?, ?, ?, ?, ?, NULL, ?)",
        (
            &user_id,
            &email,
            &hash,
            Role::Admin.as_str(),
            &name,
            &surname,
            now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::insert("users"))?;
    tracing::info!(user_id = %user_id, "bootstrap admin created");
    start_session(state, &user_id)
}

fn auth_sign_in(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let email = required_str(params, "email")?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    let conn = db_conn(state)?;
    let Some((user_id, hash)) = auth::find_credentials(conn, &email)? else {
        tracing::info!("sign-in rejected: unknown email");
        return Err(HandlerErr::InvalidCredentials);
    };
    let valid = auth::verify_password(password, &hash).unwrap_or_else(|e| {
        tracing::warn!(user_id = %user_id, error = %e, "stored password hash unreadable");
        false
    });
    if !valid {
        tracing::info!(user_id = %user_id, "sign-in rejected: wrong password");
        return Err(HandlerErr::InvalidCredentials);
    }
    start_session(state, &user_id)
}

fn auth_sign_out(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let revoked = match state.current_token(req) {
        Some(token) => auth::revoke_session(conn, token)?,
        None => false,
    };
    let req_token = req.token.as_deref();
    if req_token.is_none() || req_token == state.session_token.as_deref() {
        state.session_token = None;
    }
    Ok(json!({ "ok": true, "revoked": revoked }))
}

fn session_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let who = match state.current_token(req) {
        Some(token) => auth::resolve_session(conn, token, Utc::now())?,
        None => None,
    };
    Ok(match who {
        Some(who) => json!({ "authenticated": true, "user": who }),
        None => json!({ "authenticated": false }),
    })
}

fn session_gate(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let route = required_str(&req.params, "route")?;
    let conn = db_conn(state)?;
    let who = match state.current_token(req) {
        Some(token) => auth::resolve_session(conn, token, Utc::now())?,
        None => None,
    };
    Ok(match auth::gate(who.as_ref(), &route) {
        Gate::Allow => json!({
            "allowed": true,
            "route": route,
            "role": who.as_ref().map(|w| w.role)
        }),
        Gate::Redirect(to) => json!({
            "allowed": false,
            "route": route,
            "redirect": to
        }),
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "auth.bootstrap" => auth_bootstrap(state, &req.params),
        "auth.signIn" => auth_sign_in(state, &req.params),
        "auth.signOut" => auth_sign_out(state, req),
        "session.get" => session_get(state, req),
        "session.gate" => session_gate(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
