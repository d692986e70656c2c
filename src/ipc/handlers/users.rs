use crate::auth::{self, Identity};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    new_id, now_rfc3339, optional_role, optional_str, patch_object, required_str, with_session,
    ADMIN, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use crate::readmodel::{fetch_primary, Filter};
use crate::view::{view_json, EmptyCopy};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{json, Value};

const NO_USERS: EmptyCopy =
    EmptyCopy::with_action("No users registered", "Add user", "/admin/users/new");

const USER_SELECT: &str = "SELECT id, email, role, name, surname, dni, created_at FROM users";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserRow {
    id: String,
    email: String,
    role: String,
    name: String,
    surname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dni: Option<String>,
    created_at: String,
}

impl UserRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            email: r.get(1)?,
            role: r.get(2)?,
            name: r.get(3)?,
            surname: r.get(4)?,
            dni: r.get(5)?,
            created_at: r.get(6)?,
        })
    }
}

fn validate_email(email: &str) -> Result<String, HandlerErr> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(HandlerErr::bad_params("email must look like name@domain")),
    }
}

fn validate_dni(dni: &str) -> Result<(), HandlerErr> {
    if dni.contains(':') {
        return Err(HandlerErr::bad_params("dni must not contain ':'"));
    }
    Ok(())
}

fn email_taken(conn: &Connection, email: &str, except_id: Option<&str>) -> Result<bool, HandlerErr> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE lower(email) = lower(?)",
            [email],
            |r| r.get(0),
        )
        .optional()?;
    Ok(match found {
        Some(id) => Some(id.as_str()) != except_id,
        None => false,
    })
}

fn users_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let role = optional_role(params, "role")?;
    let filter = Filter::new()
        .eq_opt("role", role.map(|r| r.as_str().to_string()))
        .order_by("surname, name, id");
    let rows = fetch_primary(conn, USER_SELECT, &filter, UserRow::from_row)?;
    Ok(json!({
        "users": rows,
        "view": view_json(rows.len(), NO_USERS)
    }))
}

fn users_get(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = optional_str(params, "userId")?.unwrap_or_else(|| who.id.clone());
    if user_id != who.id && !who.is(Role::Admin) {
        return Err(HandlerErr::Forbidden {
            role: who.role.as_str(),
            method: "users.get".to_string(),
        });
    }
    let row = fetch_primary(
        conn,
        USER_SELECT,
        &Filter::new().eq("id", user_id),
        UserRow::from_row,
    )?
    .into_iter()
    .next()
    .ok_or(HandlerErr::NotFound("user"))?;
    Ok(json!({ "user": row }))
}

fn users_create(conn: &Connection, params: &Value, min_password_len: usize) -> Result<Value, HandlerErr> {
    let email = validate_email(&required_str(params, "email")?)?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    auth::validate_password_strength(password, min_password_len).map_err(HandlerErr::BadParams)?;
    let role_raw = required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown role: {}", role_raw)))?;
    let name = required_str(params, "name")?;
    let surname = required_str(params, "surname")?;
    let dni = optional_str(params, "dni")?;
    if let Some(d) = dni.as_deref() {
        validate_dni(d)?;
    }
    if email_taken(conn, &email, None)? {
        return Err(HandlerErr::Conflict(format!("email already registered: {}", email)));
    }

    let hash = auth::hash_password(password)
        .map_err(|e| HandlerErr::Internal(anyhow::anyhow!("password hashing failed: {e}")))?;
    let user_id = new_id();
    conn.execute(
        "INSERT INTO users(id, email, password_hash, role, name, surname, dni, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &email,
            &hash,
            role.as_str(),
            &name,
            &surname,
            &dni,
            now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::insert("users"))?;
    tracing::info!(user_id = %user_id, role = role.as_str(), "user created");
    Ok(json!({ "userId": user_id }))
}

fn users_update(conn: &Connection, params: &Value, min_password_len: usize) -> Result<Value, HandlerErr> {
    let user_id = required_str(params, "userId")?;
    let patch = patch_object(params)?;

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "email" => {
                let raw = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("patch.email must be string"))?;
                let email = validate_email(raw)?;
                if email_taken(conn, &email, Some(&user_id))? {
                    return Err(HandlerErr::Conflict(format!(
                        "email already registered: {}",
                        email
                    )));
                }
                sets.push("email = ?");
                values.push(email.into());
            }
            "name" | "surname" => {
                let s = v
                    .as_str()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| HandlerErr::bad_params(format!("patch.{} must be non-empty", k)))?;
                sets.push(if k == "name" { "name = ?" } else { "surname = ?" });
                values.push(s.to_string().into());
            }
            "role" => {
                let role = v
                    .as_str()
                    .and_then(Role::parse)
                    .ok_or_else(|| HandlerErr::bad_params("patch.role is not a known role"))?;
                sets.push("role = ?");
                values.push(role.as_str().to_string().into());
            }
            "dni" => match v {
                Value::Null => {
                    sets.push("dni = NULL");
                }
                Value::String(s) => {
                    let s = s.trim();
                    validate_dni(s)?;
                    if s.is_empty() {
                        sets.push("dni = NULL");
                    } else {
                        sets.push("dni = ?");
                        values.push(s.to_string().into());
                    }
                }
                _ => return Err(HandlerErr::bad_params("patch.dni must be string or null")),
            },
            "password" => {
                let pw = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("patch.password must be string"))?;
                auth::validate_password_strength(pw, min_password_len)
                    .map_err(HandlerErr::BadParams)?;
                let hash = auth::hash_password(pw).map_err(|e| {
                    HandlerErr::Internal(anyhow::anyhow!("password hashing failed: {e}"))
                })?;
                sets.push("password_hash = ?");
                values.push(hash.into());
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown user field: {}", other)));
            }
        }
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("patch is empty"));
    }

    let sql = format!("UPDATE users SET {} WHERE id = ?", sets.join(", "));
    values.push(user_id.clone().into());
    let n = conn
        .execute(&sql, rusqlite::params_from_iter(values))
        .map_err(HandlerErr::update("users"))?;
    if n == 0 {
        return Err(HandlerErr::NotFound("user"));
    }
    tracing::info!(user_id = %user_id, fields = sets.len(), "user updated");
    Ok(json!({ "ok": true }))
}

/// Removes the user document only; their sessions are revoked, other records stay.
fn users_delete(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = required_str(params, "userId")?;
    if user_id == who.id {
        return Err(HandlerErr::Conflict("cannot delete your own account".to_string()));
    }
    let tx = conn.unchecked_transaction()?;
    let n = tx
        .execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(HandlerErr::delete("users"))?;
    if n == 0 {
        return Err(HandlerErr::NotFound("user"));
    }
    let revoked = tx
        .execute("DELETE FROM sessions WHERE user_id = ?", [&user_id])
        .map_err(HandlerErr::delete("sessions"))?;
    tx.commit()?;
    tracing::info!(user_id = %user_id, revoked_sessions = revoked, "user deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let min_password_len = state.config.min_password_len;
    let resp = match req.method.as_str() {
        "users.list" => with_session(state, req, ADMIN, |conn, _, params| users_list(conn, params)),
        "users.get" => with_session(state, req, ANY_ROLE, users_get),
        "users.create" => with_session(state, req, ADMIN, |conn, _, params| {
            users_create(conn, params, min_password_len)
        }),
        "users.update" => with_session(state, req, ADMIN, |conn, _, params| {
            users_update(conn, params, min_password_len)
        }),
        "users.delete" => with_session(state, req, ADMIN, users_delete),
        _ => return None,
    };
    Some(resp)
}
