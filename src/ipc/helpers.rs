use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use crate::auth::{self, Identity};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;

pub const ANY_ROLE: &[Role] = &Role::ALL;
pub const ADMIN: &[Role] = &[Role::Admin];
pub const ADMIN_TEACHER: &[Role] = &[Role::Admin, Role::Teacher];
pub const ATTENDANCE_DESK: &[Role] = &[Role::Admin, Role::Teacher, Role::Staff];

pub const DATE_FMT: &str = "%Y-%m-%d";
pub const TIME_FMT: &str = "%H:%M:%S";

pub fn respond(req: &Request, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::warn!(method = %req.method, code = e.code(), error = %e, "request failed");
            e.response(&req.id)
        }
    }
}

pub fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state.db.as_ref().ok_or(HandlerErr::NoWorkspace)
}

/// Resolves the caller and checks the method's role list.
pub fn authorize<'a>(
    state: &'a AppState,
    req: &Request,
    roles: &[Role],
) -> Result<(&'a Connection, Identity), HandlerErr> {
    let conn = db_conn(state)?;
    let token = state
        .current_token(req)
        .ok_or(HandlerErr::Unauthenticated)?;
    let who = auth::resolve_session(conn, token, Utc::now())?
        .ok_or(HandlerErr::Unauthenticated)?;
    if !roles.contains(&who.role) {
        return Err(HandlerErr::Forbidden {
            role: who.role.as_str(),
            method: req.method.clone(),
        });
    }
    Ok((conn, who))
}

pub fn with_session<F>(state: &AppState, req: &Request, roles: &[Role], f: F) -> Value
where
    F: FnOnce(&Connection, &Identity, &Value) -> Result<Value, HandlerErr>,
{
    let result = authorize(state, req, roles).and_then(|(conn, who)| f(conn, &who, &req.params));
    respond(req, result)
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()).map(|s| s.trim()) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(HandlerErr::bad_params(format!("missing {}", key))),
    }
}

/// Missing, null and blank strings are all `None`.
pub fn optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok((!t.is_empty()).then(|| t.to_string()))
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn required_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn optional_role(params: &Value, key: &str) -> Result<Option<Role>, HandlerErr> {
    match optional_str(params, key)? {
        None => Ok(None),
        Some(s) => Role::parse(&s)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown {}: {}", key, s))),
    }
}

pub fn patch_object<'a>(params: &'a Value) -> Result<&'a serde_json::Map<String, Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))
}

pub fn optional_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match optional_str(params, key)? {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(&s, DATE_FMT)
            .map(Some)
            .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key))),
    }
}

pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let t = raw.trim();
    NaiveTime::parse_from_str(t, TIME_FMT)
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M"))
        .ok()
}

pub fn parse_local_datetime(raw: &str) -> Option<NaiveDateTime> {
    let t = raw.trim();
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(t, fmt).ok())
}

pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

pub fn today() -> NaiveDate {
    local_now().date()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn exists(conn: &Connection, table: &'static str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    Ok(conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub fn user_role(conn: &Connection, user_id: &str) -> Result<Option<Role>, HandlerErr> {
    let raw: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| r.get(0))
        .optional()?;
    Ok(raw.as_deref().and_then(Role::parse))
}

/// Ids of the groups a teacher teaches.
pub fn teacher_group_ids(conn: &Connection, teacher_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn.prepare("SELECT id FROM class_groups WHERE teacher_id = ?")?;
    let ids = stmt
        .query_map([teacher_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Ids of the groups a student is assigned to.
pub fn student_group_ids(conn: &Connection, student_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT group_id FROM assignments WHERE student_id = ?")?;
    let ids = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn group_teacher(conn: &Connection, group_id: &str) -> Result<Option<String>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT teacher_id FROM class_groups WHERE id = ?",
            [group_id],
            |r| r.get(0),
        )
        .optional()?)
}

/// Teachers may only act on their own groups; admins on any existing group.
pub fn ensure_group_access(conn: &Connection, who: &Identity, group_id: &str) -> Result<(), HandlerErr> {
    let Some(teacher_id) = group_teacher(conn, group_id)? else {
        return Err(HandlerErr::NotFound("group"));
    };
    if who.is(Role::Teacher) && teacher_id != who.id {
        return Err(HandlerErr::Forbidden {
            role: who.role.as_str(),
            method: format!("group {}", group_id),
        });
    }
    Ok(())
}

/// Access to a record that already references `group_id`. Admins keep access
/// after the group is deleted so orphaned records can still be cleaned up.
pub fn ensure_record_group_access(
    conn: &Connection,
    who: &Identity,
    group_id: &str,
) -> Result<(), HandlerErr> {
    match group_teacher(conn, group_id)? {
        None if who.is(Role::Admin) => Ok(()),
        None => Err(HandlerErr::NotFound("group")),
        Some(teacher_id) if who.is(Role::Teacher) && teacher_id != who.id => {
            Err(HandlerErr::Forbidden {
                role: who.role.as_str(),
                method: format!("group {}", group_id),
            })
        }
        Some(_) => Ok(()),
    }
}
