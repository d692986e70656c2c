use crate::auth::Identity;
use crate::calc;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::notifications::notify;
use crate::ipc::helpers::{
    ensure_group_access, ensure_record_group_access, new_id, now_rfc3339, optional_date,
    optional_str, patch_object, required_f64, required_str, teacher_group_ids, today, with_session,
    ADMIN_TEACHER, DATE_FMT,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{NotificationKind, Role};
use crate::readmodel::{fetch_primary, join_fetch, Filter, ScoreDoc, SCORE_SELECT};
use crate::view::{view_json, EmptyCopy};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

const SCORE_ROLES: &[Role] = &[Role::Admin, Role::Teacher, Role::Student];

const NO_SCORES: EmptyCopy = EmptyCopy::new("No grades recorded yet");
const SCORE_MIN: f64 = 0.0;
const SCORE_MAX: f64 = 100.0;

fn validate_value(v: f64) -> Result<f64, HandlerErr> {
    if !v.is_finite() || !(SCORE_MIN..=SCORE_MAX).contains(&v) {
        return Err(HandlerErr::bad_params(format!(
            "value must be between {} and {}",
            SCORE_MIN, SCORE_MAX
        )));
    }
    Ok(v)
}

fn validate_period(raw: &str) -> Result<String, HandlerErr> {
    let p = raw.trim();
    if p.is_empty() || p.chars().count() > 40 {
        return Err(HandlerErr::bad_params("period must be 1..=40 characters"));
    }
    Ok(p.to_string())
}

fn student_assigned(conn: &Connection, student_id: &str, group_id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM assignments WHERE student_id = ? AND group_id = ?",
            (student_id, group_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

/// Applies the caller's scope on top of the requested filters.
fn scoped_filter(conn: &Connection, who: &Identity, params: &Value) -> Result<Filter, HandlerErr> {
    let filter = Filter::new().eq_opt("group_id", optional_str(params, "groupId")?);
    Ok(match who.role {
        Role::Student => filter.eq("student_id", who.id.clone()),
        Role::Teacher => filter
            .eq_opt("student_id", optional_str(params, "studentId")?)
            .in_list("group_id", &teacher_group_ids(conn, &who.id)?),
        _ => filter.eq_opt("student_id", optional_str(params, "studentId")?),
    })
}

fn load_score(conn: &Connection, score_id: &str) -> Result<ScoreDoc, HandlerErr> {
    fetch_primary(
        conn,
        SCORE_SELECT,
        &Filter::new().eq("id", score_id.to_string()),
        ScoreDoc::from_row,
    )?
    .into_iter()
    .next()
    .ok_or(HandlerErr::NotFound("score"))
}

fn scores_list(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let filter = scoped_filter(conn, who, params)?
        .eq_opt("period", optional_str(params, "period")?)
        .order_by("date DESC, created_at DESC");
    let views = join_fetch(conn, SCORE_SELECT, &filter, ScoreDoc::from_row, |j, s| {
        j.score_view(s)
    })?;
    Ok(json!({ "scores": views, "view": view_json(views.len(), NO_SCORES) }))
}

fn scores_create(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let group_id = required_str(params, "groupId")?;
    let value = validate_value(required_f64(params, "value")?)?;
    let description = optional_str(params, "description")?.unwrap_or_default();
    let period = validate_period(&required_str(params, "period")?)?;
    let date = optional_date(params, "date")?.unwrap_or_else(today);

    ensure_group_access(conn, who, &group_id)?;
    if !student_assigned(conn, &student_id, &group_id)? {
        return Err(HandlerErr::bad_params("student is not assigned to this group"));
    }

    let tx = conn.unchecked_transaction()?;
    let id = new_id();
    tx.execute(
        "INSERT INTO grade_records(id, student_id, group_id, value, description, date, period, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            &group_id,
            value,
            &description,
            date.format(DATE_FMT).to_string(),
            &period,
            now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::insert("grade_records"))?;

    let message = if description.is_empty() {
        format!("You received {} for {}", value, period)
    } else {
        format!("You received {} in {} ({})", value, description, period)
    };
    notify(
        &tx,
        &student_id,
        "New grade",
        &message,
        NotificationKind::Info,
        Some("/student/grades"),
    )?;
    tx.commit()?;
    tracing::info!(score_id = %id, student_id = %student_id, group_id = %group_id, "score recorded");
    Ok(json!({ "scoreId": id }))
}

fn scores_update(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let score_id = required_str(params, "scoreId")?;
    let patch = patch_object(params)?;
    let current = load_score(conn, &score_id)?;
    ensure_record_group_access(conn, who, &current.group_id)?;

    let mut value = current.value;
    let mut description = current.description;
    let mut date = current.date;
    let mut period = current.period;
    let mut group_id = current.group_id.clone();
    for (k, v) in patch {
        match k.as_str() {
            "value" => {
                let n = v
                    .as_f64()
                    .ok_or_else(|| HandlerErr::bad_params("patch.value must be a number"))?;
                value = validate_value(n)?;
            }
            "description" => {
                description = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("patch.description must be string"))?
                    .trim()
                    .to_string();
            }
            "date" => {
                let raw = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("patch.date must be string"))?;
                let d = NaiveDate::parse_from_str(raw.trim(), DATE_FMT)
                    .map_err(|_| HandlerErr::bad_params("patch.date must be YYYY-MM-DD"))?;
                date = d.format(DATE_FMT).to_string();
            }
            "period" => {
                let raw = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("patch.period must be string"))?;
                period = validate_period(raw)?;
            }
            "groupId" => {
                let g = v
                    .as_str()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| HandlerErr::bad_params("patch.groupId must be non-empty"))?;
                ensure_group_access(conn, who, g)?;
                group_id = g.to_string();
            }
            other => return Err(HandlerErr::bad_params(format!("unknown score field: {}", other))),
        }
    }
    if group_id != current.group_id && !student_assigned(conn, &current.student_id, &group_id)? {
        return Err(HandlerErr::bad_params("student is not assigned to this group"));
    }

    conn.execute(
        "UPDATE grade_records
         SET value = ?, description = ?, date = ?, period = ?, group_id = ?
         WHERE id = ?",
        (value, &description, &date, &period, &group_id, &score_id),
    )
    .map_err(HandlerErr::update("grade_records"))?;
    tracing::info!(score_id = %score_id, "score updated");
    Ok(json!({ "ok": true }))
}

fn scores_delete(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let score_id = required_str(params, "scoreId")?;
    let current = load_score(conn, &score_id)?;
    ensure_record_group_access(conn, who, &current.group_id)?;
    conn.execute("DELETE FROM grade_records WHERE id = ?", [&score_id])
        .map_err(HandlerErr::delete("grade_records"))?;
    tracing::info!(score_id = %score_id, "score deleted");
    Ok(json!({ "ok": true }))
}

fn scores_summary(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let filter = scoped_filter(conn, who, params)?;
    let docs = fetch_primary(conn, SCORE_SELECT, &filter, ScoreDoc::from_row)?;
    let summary = calc::score_summary(docs.iter().map(|d| (d.period.as_str(), d.value)));
    Ok(json!({
        "count": summary.count,
        "average": summary.average,
        "periodAverages": summary.period_averages,
        "view": view_json(summary.count, NO_SCORES)
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "scores.list" => with_session(state, req, SCORE_ROLES, scores_list),
        "scores.create" => with_session(state, req, ADMIN_TEACHER, scores_create),
        "scores.update" => with_session(state, req, ADMIN_TEACHER, scores_update),
        "scores.delete" => with_session(state, req, ADMIN_TEACHER, scores_delete),
        "scores.summary" => with_session(state, req, SCORE_ROLES, scores_summary),
        _ => return None,
    };
    Some(resp)
}
