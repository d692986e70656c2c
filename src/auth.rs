//! Credentials, sessions and route gating.
//!
//! Passwords are stored as Argon2id PHC strings. Session tokens are random and
//! only their SHA-256 digest is persisted, so a copied database cannot be used
//! to impersonate a signed-in user.

use crate::model::Role;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed_hash = PasswordHash::new(hash)?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn validate_password_strength(password: &str, min_length: usize) -> Result<(), String> {
    if password.chars().count() < min_length {
        return Err(format!(
            "password must be at least {min_length} characters long"
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub email: String,
    pub name: String,
    pub surname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dni: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub role: Role,
    pub profile: Profile,
}

impl Identity {
    pub fn is(&self, role: Role) -> bool {
        self.role == role
    }
}

fn token_digest(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Loads the user document and its role claim. Unknown roles resolve to `None`.
pub fn load_identity(conn: &Connection, user_id: &str) -> anyhow::Result<Option<Identity>> {
    let row = conn
        .query_row(
            "SELECT id, role, email, name, surname, dni FROM users WHERE id = ?",
            [user_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((id, role_raw, email, name, surname, dni)) = row else {
        return Ok(None);
    };
    let Some(role) = Role::parse(&role_raw) else {
        tracing::warn!(user_id = %id, role = %role_raw, "user has unknown role");
        return Ok(None);
    };
    Ok(Some(Identity {
        id,
        role,
        profile: Profile {
            email,
            name,
            surname,
            dni,
        },
    }))
}

/// Returns the user id and password hash for an email, if registered.
pub fn find_credentials(conn: &Connection, email: &str) -> anyhow::Result<Option<(String, String)>> {
    let row = conn
        .query_row(
            "SELECT id, password_hash FROM users WHERE lower(email) = lower(?)",
            [email.trim()],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()?;
    Ok(row)
}

pub fn create_session(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
    ttl_hours: i64,
) -> anyhow::Result<String> {
    let token = Uuid::new_v4().simple().to_string();
    let expires = now + Duration::hours(ttl_hours);
    conn.execute(
        "INSERT INTO sessions(token_hash, user_id, created_at, expires_at) VALUES(?, ?, ?, ?)",
        (
            token_digest(&token),
            user_id,
            now.to_rfc3339(),
            expires.to_rfc3339(),
        ),
    )?;
    Ok(token)
}

pub fn revoke_session(conn: &Connection, token: &str) -> anyhow::Result<bool> {
    let n = conn.execute(
        "DELETE FROM sessions WHERE token_hash = ?",
        [token_digest(token)],
    )?;
    Ok(n > 0)
}

/// Session Resolver: token -> identity, or `None` when unauthenticated.
///
/// The role is re-read from the user document on every call, so role changes
/// and deleted users take effect immediately. Expired sessions are removed.
pub fn resolve_session(
    conn: &Connection,
    token: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<Identity>> {
    let digest = token_digest(token);
    let row = conn
        .query_row(
            "SELECT user_id, expires_at FROM sessions WHERE token_hash = ?",
            [&digest],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()?;
    let Some((user_id, expires_at)) = row else {
        return Ok(None);
    };
    let expired = DateTime::parse_from_rfc3339(&expires_at)
        .map(|t| t.with_timezone(&Utc) <= now)
        .unwrap_or(true);
    if expired {
        conn.execute("DELETE FROM sessions WHERE token_hash = ?", [&digest])?;
        return Ok(None);
    }
    load_identity(conn, &user_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Allow,
    Redirect(&'static str),
}

pub const LOGIN_ROUTE: &str = "/login";
pub const DASHBOARD_ROUTE: &str = "/dashboard";

/// `None` means the route is public.
fn route_roles(route: &str) -> Option<&'static [Role]> {
    let top = route
        .trim()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("");
    match top {
        "login" | "" => None,
        "admin" => Some(&[Role::Admin]),
        "teacher" => Some(&[Role::Teacher]),
        "student" => Some(&[Role::Student]),
        "attendance" => Some(&[Role::Admin, Role::Teacher, Role::Staff]),
        _ => Some(&Role::ALL),
    }
}

pub fn gate(identity: Option<&Identity>, route: &str) -> Gate {
    let Some(roles) = route_roles(route) else {
        return Gate::Allow;
    };
    match identity {
        None => Gate::Redirect(LOGIN_ROUTE),
        Some(who) if roles.contains(&who.role) => Gate::Allow,
        Some(_) => Gate::Redirect(DASHBOARD_ROUTE),
    }
}
