use crate::calc;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    local_now, parse_time_of_day, patch_object, required_str, with_session, ADMIN, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveTime};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Attendance,
    School,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "attendance" => Some(Self::Attendance),
            "school" => Some(Self::School),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Attendance => "setup.attendance",
            Self::School => "setup.school",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Attendance => json!({
            "lateThreshold": format!(
                "{:02}:{:02}",
                calc::DEFAULT_LATE_THRESHOLD.0,
                calc::DEFAULT_LATE_THRESHOLD.1
            )
        }),
        SetupSection::School => json!({
            "name": "",
            "schoolYear": local_now().year()
        }),
    }
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Attendance => match k.as_str() {
                "lateThreshold" => {
                    let raw = v
                        .as_str()
                        .ok_or_else(|| "lateThreshold must be string".to_string())?;
                    let t = parse_time_of_day(raw)
                        .ok_or_else(|| "lateThreshold must be HH:MM or HH:MM:SS".to_string())?;
                    obj.insert(k.clone(), json!(t.format("%H:%M:%S").to_string()));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::School => match k.as_str() {
                "name" => {
                    obj.insert(k.clone(), json!(parse_string_max(v, k, 120)?));
                }
                "schoolYear" => {
                    obj.insert(k.clone(), json!(parse_i64_range(v, k, 2000, 2100)?));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            if let Err(e) = merge_section_patch(section, &mut current, saved_obj) {
                tracing::warn!(section = section.key(), error = %e, "ignoring saved setup values");
            }
        }
    }
    Ok(current)
}

/// Workspace-wide lateness cutoff used by QR check-in.
pub fn late_threshold(conn: &Connection) -> NaiveTime {
    let loaded = load_section(conn, SetupSection::Attendance);
    let parsed = loaded.as_ref().ok().and_then(|v| {
        v.get("lateThreshold")
            .and_then(|t| t.as_str())
            .and_then(parse_time_of_day)
    });
    match parsed {
        Some(t) => t,
        None => {
            if let Err(e) = loaded {
                tracing::warn!(error = %e, "late threshold unavailable, using default");
            }
            calc::default_late_threshold()
        }
    }
}

pub fn current_school_year(conn: &Connection) -> i64 {
    load_section(conn, SetupSection::School)
        .ok()
        .and_then(|v| v.get("schoolYear").and_then(|y| y.as_i64()))
        .unwrap_or_else(|| i64::from(local_now().year()))
}

fn setup_get(conn: &Connection) -> Result<Value, HandlerErr> {
    let attendance = load_section(conn, SetupSection::Attendance)?;
    let school = load_section(conn, SetupSection::School)?;
    Ok(json!({
        "attendance": attendance,
        "school": school
    }))
}

fn setup_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let section_raw = required_str(params, "section")?;
    let section = SetupSection::parse(&section_raw)
        .ok_or_else(|| HandlerErr::bad_params("unknown section"))?;
    let patch = patch_object(params)?;
    let mut current = load_section(conn, section)?;
    merge_section_patch(section, &mut current, patch).map_err(HandlerErr::BadParams)?;
    db::settings_set_json(conn, section.key(), &current)?;
    tracing::info!(section = section.key(), "setup updated");
    Ok(json!({ "ok": true, "section": section_raw, "values": current }))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> Value {
    with_session(state, req, ANY_ROLE, |conn, _, _| setup_get(conn))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> Value {
    with_session(state, req, ADMIN, |conn, _, params| setup_update(conn, params))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
