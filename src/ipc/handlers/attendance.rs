use crate::auth::{self, Identity};
use crate::calc;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::notifications::notify;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    local_now, new_id, now_rfc3339, optional_date, optional_role, optional_str,
    parse_local_datetime, parse_time_of_day, required_str, today, user_role, with_session, ADMIN,
    ANY_ROLE, ATTENDANCE_DESK, DATE_FMT, TIME_FMT,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{AttendanceStatus, NotificationKind, Role};
use crate::qr;
use crate::readmodel::{
    fetch_primary, join_fetch, AttendanceDoc, AttendanceView, Filter, ATTENDANCE_SELECT,
};
use crate::view::{view_json, EmptyCopy};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

const MARK_ABSENT_ROLES: &[Role] = &[Role::Admin, Role::Staff];

const NO_ATTENDANCE: EmptyCopy =
    EmptyCopy::with_action("No attendance recorded", "Scan QR", "/attendance/scan");
const NO_ATTENDANCE_SELF: EmptyCopy = EmptyCopy::new("No attendance records for you yet");

const CSV_HEADER: &str = "Name,Surname,Role,Time,Status";

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn status_param(params: &Value, key: &str) -> Result<Option<AttendanceStatus>, HandlerErr> {
    match optional_str(params, key)? {
        None => Ok(None),
        Some(s) => AttendanceStatus::parse(&s)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown {}: {}", key, s))),
    }
}

fn record_for_day(
    conn: &Connection,
    person_id: &str,
    date: &str,
) -> Result<Option<AttendanceDoc>, HandlerErr> {
    let sql = format!("{ATTENDANCE_SELECT} WHERE person_id = ? AND date = ?");
    Ok(conn
        .query_row(&sql, (person_id, date), AttendanceDoc::from_row)
        .optional()?)
}

fn hydrate_one(conn: &Connection, id: &str) -> Result<AttendanceView, HandlerErr> {
    join_fetch(
        conn,
        ATTENDANCE_SELECT,
        &Filter::new().eq("id", id.to_string()),
        AttendanceDoc::from_row,
        |j, a| j.attendance_view(a),
    )?
    .into_iter()
    .next()
    .ok_or(HandlerErr::NotFound("attendance record"))
}

fn insert_record(
    conn: &Connection,
    person_id: &str,
    role: Role,
    date: &str,
    time: &str,
    status: AttendanceStatus,
    notified: bool,
) -> Result<String, HandlerErr> {
    let id = new_id();
    conn.execute(
        "INSERT INTO attendance_records(id, person_id, role, date, time, status, notified, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            person_id,
            role.as_str(),
            date,
            time,
            status.as_str(),
            i64::from(notified),
            now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::insert("attendance_records"))?;
    Ok(id)
}

fn arrival_time(params: &Value) -> Result<NaiveDateTime, HandlerErr> {
    match optional_str(params, "at")? {
        None => Ok(local_now()),
        Some(raw) => parse_local_datetime(&raw)
            .ok_or_else(|| HandlerErr::bad_params("at must be YYYY-MM-DDTHH:MM[:SS]")),
    }
}

/// Resolves the QR payload to a person, checks it against the user document
/// and records the arrival. Scanning the same person twice on one day is
/// answered with the first record.
fn attendance_check_in(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let raw = params
        .get("payload")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing payload"))?;
    let payload = qr::parse_payload(raw)
        .ok_or_else(|| HandlerErr::InvalidQr("unrecognised payload".to_string()))?;
    let kind = payload
        .person_type()
        .ok_or_else(|| HandlerErr::InvalidQr(format!("unknown person type: {}", payload.tipo)))?;
    let at = arrival_time(params)?;

    let person = auth::load_identity(conn, &payload.id)?
        .ok_or_else(|| HandlerErr::InvalidQr("no user matches this code".to_string()))?;
    if let (Some(qr_dni), Some(user_dni)) = (payload.dni.as_deref(), person.profile.dni.as_deref()) {
        if qr_dni != user_dni {
            tracing::warn!(person_id = %person.id, "check-in rejected: dni mismatch");
            return Err(HandlerErr::InvalidQr("document number does not match".to_string()));
        }
    }
    if kind.role() != person.role {
        return Err(HandlerErr::InvalidQr(format!(
            "code type {} does not match user role {}",
            kind.as_str(),
            person.role.as_str()
        )));
    }

    let date = at.date().format(DATE_FMT).to_string();
    if let Some(existing) = record_for_day(conn, &person.id, &date)? {
        tracing::info!(person_id = %person.id, date = %date, "duplicate check-in");
        let late = existing.status == AttendanceStatus::Late.as_str();
        let view = hydrate_one(conn, &existing.id)?;
        return Ok(json!({ "record": view, "duplicate": true, "late": late }));
    }

    let threshold = setup::late_threshold(conn);
    let status = calc::classify_arrival(at.time(), threshold);
    let time = at.time().format(TIME_FMT).to_string();
    let id = insert_record(conn, &person.id, person.role, &date, &time, status, false)?;
    tracing::info!(
        person_id = %person.id,
        role = person.role.as_str(),
        status = status.as_str(),
        "check-in recorded"
    );
    let view = hydrate_one(conn, &id)?;
    Ok(json!({
        "record": view,
        "duplicate": false,
        "late": status == AttendanceStatus::Late,
        "threshold": threshold.format(TIME_FMT).to_string()
    }))
}

/// Manual desk entry; replaces the person's record for that day if one exists.
fn attendance_record(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let person_id = required_str(params, "personId")?;
    let status = status_param(params, "status")?.ok_or_else(|| HandlerErr::bad_params("missing status"))?;
    let now = local_now();
    let date = optional_date(params, "date")?.unwrap_or_else(|| now.date());
    let time = match optional_str(params, "time")? {
        None => now.time(),
        Some(raw) => parse_time_of_day(&raw)
            .ok_or_else(|| HandlerErr::bad_params("time must be HH:MM or HH:MM:SS"))?,
    };
    let role = user_role(conn, &person_id)?.ok_or(HandlerErr::NotFound("person"))?;

    let date_s = date.format(DATE_FMT).to_string();
    let time_s = time.format(TIME_FMT).to_string();
    let (id, replaced) = match record_for_day(conn, &person_id, &date_s)? {
        Some(existing) => {
            conn.execute(
                "UPDATE attendance_records SET status = ?, time = ?, role = ? WHERE id = ?",
                (status.as_str(), &time_s, role.as_str(), &existing.id),
            )
            .map_err(HandlerErr::update("attendance_records"))?;
            (existing.id, true)
        }
        None => (
            insert_record(conn, &person_id, role, &date_s, &time_s, status, false)?,
            false,
        ),
    };
    tracing::info!(person_id = %person_id, date = %date_s, status = status.as_str(), replaced, "attendance recorded");
    Ok(json!({ "record": hydrate_one(conn, &id)?, "replaced": replaced }))
}

fn listing_filter(who: &Identity, params: &Value, default_today: bool) -> Result<Filter, HandlerErr> {
    let date = match optional_date(params, "date")? {
        Some(d) => Some(d),
        None if default_today => Some(today()),
        None => None,
    };
    let mut filter = Filter::new()
        .eq_opt("date", date.map(|d| d.format(DATE_FMT).to_string()))
        .eq_opt("role", optional_role(params, "role")?.map(|r| r.as_str().to_string()))
        .eq_opt("status", status_param(params, "status")?.map(|s| s.as_str().to_string()));
    filter = if who.is(Role::Student) {
        filter.eq("person_id", who.id.clone())
    } else {
        filter.eq_opt("person_id", optional_str(params, "personId")?)
    };
    Ok(filter)
}

fn attendance_list(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let filter = listing_filter(who, params, false)?.order_by("date DESC, time DESC");
    let views = join_fetch(conn, ATTENDANCE_SELECT, &filter, AttendanceDoc::from_row, |j, a| {
        j.attendance_view(a)
    })?;
    let empty = if who.is(Role::Student) {
        NO_ATTENDANCE_SELF
    } else {
        NO_ATTENDANCE
    };
    Ok(json!({ "records": views, "view": view_json(views.len(), empty) }))
}

fn parse_status(doc: &AttendanceDoc) -> Option<AttendanceStatus> {
    let s = AttendanceStatus::parse(&doc.status);
    if s.is_none() {
        tracing::warn!(record_id = %doc.id, status = %doc.status, "skipping record with unknown status");
    }
    s
}

fn attendance_summary(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut filter = Filter::new();
    let date = optional_date(params, "date")?;
    let from = optional_date(params, "from")?;
    let to = optional_date(params, "to")?;
    match (date, from, to) {
        (Some(d), _, _) => filter = filter.eq("date", d.format(DATE_FMT).to_string()),
        (None, None, None) => filter = filter.eq("date", today().format(DATE_FMT).to_string()),
        (None, from, to) => {
            if let (Some(f), Some(t)) = (from, to) {
                if f > t {
                    return Err(HandlerErr::bad_params("from must not be after to"));
                }
            }
            if let Some(f) = from {
                filter = filter.gte("date", f.format(DATE_FMT).to_string());
            }
            if let Some(t) = to {
                filter = filter.lte("date", t.format(DATE_FMT).to_string());
            }
        }
    }
    filter = filter.eq_opt("role", optional_role(params, "role")?.map(|r| r.as_str().to_string()));

    let docs = fetch_primary(conn, ATTENDANCE_SELECT, &filter, AttendanceDoc::from_row)?;
    let classified: Vec<(&AttendanceDoc, AttendanceStatus)> = docs
        .iter()
        .filter_map(|d| parse_status(d).map(|s| (d, s)))
        .collect();

    let counts = calc::tally_attendance(classified.iter().map(|(_, s)| *s));
    let histogram: BTreeMap<String, calc::AttendanceCounts> = calc::daily_histogram(
        classified.iter().filter_map(|(d, s)| {
            NaiveDate::parse_from_str(&d.date, DATE_FMT)
                .ok()
                .map(|day| (day, *s))
        }),
    )
    .into_iter()
    .map(|(day, c)| (day.format(DATE_FMT).to_string(), c))
    .collect();
    let mut by_role: BTreeMap<String, calc::AttendanceCounts> = BTreeMap::new();
    for (d, s) in &classified {
        by_role.entry(d.role.clone()).or_default().add(*s);
    }

    Ok(json!({
        "counts": counts,
        "percentages": counts.percentages(),
        "histogram": histogram,
        "byRole": by_role,
        "view": view_json(counts.total, NO_ATTENDANCE)
    }))
}

fn render_csv(rows: &[AttendanceView]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for r in rows {
        let line = [
            r.name.as_deref().unwrap_or(""),
            r.surname.as_deref().unwrap_or(""),
            r.role.as_str(),
            r.time.as_str(),
            r.status.as_str(),
        ]
        .iter()
        .map(|f| csv_quote(f))
        .collect::<Vec<_>>()
        .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn attendance_export_csv(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let filter = listing_filter(who, params, true)?.order_by("time, id");
    let views = join_fetch(conn, ATTENDANCE_SELECT, &filter, AttendanceDoc::from_row, |j, a| {
        j.attendance_view(a)
    })?;
    let csv = render_csv(&views);

    let mut result = Map::new();
    if let Some(out_path) = optional_str(params, "outPath")? {
        let path = PathBuf::from(&out_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &csv)?;
        tracing::info!(path = %path.display(), rows = views.len(), "attendance exported");
        result.insert("path".into(), json!(out_path));
    }
    result.insert("rowsExported".into(), json!(views.len()));
    result.insert("csv".into(), json!(csv));
    Ok(Value::Object(result))
}

/// Marks everyone of `role` without a record on `date` as absent and notifies them.
/// All inserts and notifications commit together.
fn attendance_mark_absent(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let date = optional_date(params, "date")?.unwrap_or_else(today);
    let role = optional_role(params, "role")?.unwrap_or(Role::Student);
    let date_s = date.format(DATE_FMT).to_string();

    let tx = conn.unchecked_transaction()?;
    let missing: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT u.id FROM users u
             WHERE u.role = ?
               AND NOT EXISTS (
                 SELECT 1 FROM attendance_records a WHERE a.person_id = u.id AND a.date = ?
               )
             ORDER BY u.surname, u.name, u.id",
        )?;
        let ids = stmt
            .query_map((role.as_str(), &date_s), |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };
    let message = format!("You were marked absent on {}", date_s);
    for person_id in &missing {
        insert_record(&tx, person_id, role, &date_s, "00:00:00", AttendanceStatus::Absent, true)?;
        notify(
            &tx,
            person_id,
            "Absence recorded",
            &message,
            NotificationKind::Warning,
            Some("/attendance"),
        )?;
    }
    tx.commit()?;
    tracing::info!(date = %date_s, role = role.as_str(), marked = missing.len(), "absences marked");
    Ok(json!({ "date": date_s, "role": role, "marked": missing.len() }))
}

fn attendance_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "recordId")?;
    let n = conn
        .execute("DELETE FROM attendance_records WHERE id = ?", [&id])
        .map_err(HandlerErr::delete("attendance_records"))?;
    if n == 0 {
        return Err(HandlerErr::NotFound("attendance record"));
    }
    tracing::info!(record_id = %id, "attendance record deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "attendance.checkIn" => with_session(state, req, ATTENDANCE_DESK, |conn, _, p| {
            attendance_check_in(conn, p)
        }),
        "attendance.record" => with_session(state, req, ATTENDANCE_DESK, |conn, _, p| {
            attendance_record(conn, p)
        }),
        "attendance.list" => with_session(state, req, ANY_ROLE, attendance_list),
        "attendance.summary" => with_session(state, req, ATTENDANCE_DESK, |conn, _, p| {
            attendance_summary(conn, p)
        }),
        "attendance.exportCsv" => with_session(state, req, ATTENDANCE_DESK, attendance_export_csv),
        "attendance.markAbsent" => with_session(state, req, MARK_ABSENT_ROLES, |conn, _, p| {
            attendance_mark_absent(conn, p)
        }),
        "attendance.delete" => with_session(state, req, ADMIN, |conn, _, p| {
            attendance_delete(conn, p)
        }),
        _ => return None,
    };
    Some(resp)
}
