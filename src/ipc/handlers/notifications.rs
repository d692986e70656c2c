use crate::auth::Identity;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    exists, new_id, now_rfc3339, optional_bool, optional_str, required_str, with_session,
    ADMIN_TEACHER, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use crate::model::NotificationKind;
use crate::readmodel::{fetch_primary, Filter};
use crate::view::{view_json, EmptyCopy};
use rusqlite::{Connection, Row};
use serde::Serialize;
use serde_json::{json, Value};

const NO_NOTIFICATIONS: EmptyCopy = EmptyCopy::new("You have no notifications");

const NOTIFICATION_SELECT: &str =
    "SELECT id, user_id, title, message, kind, read, date, link FROM notifications";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationRow {
    id: String,
    user_id: String,
    title: String,
    message: String,
    kind: String,
    read: bool,
    date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<String>,
}

impl NotificationRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            user_id: r.get(1)?,
            title: r.get(2)?,
            message: r.get(3)?,
            kind: r.get(4)?,
            read: r.get::<_, i64>(5)? != 0,
            date: r.get(6)?,
            link: r.get(7)?,
        })
    }
}

/// Inserts one unread notification and returns its id.
pub fn notify(
    conn: &Connection,
    user_id: &str,
    title: &str,
    message: &str,
    kind: NotificationKind,
    link: Option<&str>,
) -> Result<String, HandlerErr> {
    let id = new_id();
    conn.execute(
        "INSERT INTO notifications(id, user_id, title, message, kind, read, date, link)
         VALUES(?, ?, ?, ?, ?, 0, ?, ?)",
        (&id, user_id, title, message, kind.as_str(), now_rfc3339(), link),
    )
    .map_err(HandlerErr::insert("notifications"))?;
    tracing::debug!(notification_id = %id, user_id, kind = kind.as_str(), "notification created");
    Ok(id)
}

fn unread_count(conn: &Connection, user_id: &str) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read = 0",
        [user_id],
        |r| r.get(0),
    )?)
}

fn notifications_list(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let mut filter = Filter::new().eq("user_id", who.id.clone());
    if optional_bool(params, "unreadOnly")?.unwrap_or(false) {
        filter = filter.eq("read", 0i64);
    }
    let rows = fetch_primary(
        conn,
        NOTIFICATION_SELECT,
        &filter.order_by("date DESC, id"),
        NotificationRow::from_row,
    )?;
    Ok(json!({
        "notifications": rows,
        "unread": unread_count(conn, &who.id)?,
        "view": view_json(rows.len(), NO_NOTIFICATIONS)
    }))
}

fn notifications_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = required_str(params, "userId")?;
    let title = required_str(params, "title")?;
    let message = required_str(params, "message")?;
    let kind = match optional_str(params, "kind")? {
        None => NotificationKind::Info,
        Some(k) => NotificationKind::parse(&k)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown kind: {}", k)))?,
    };
    let link = optional_str(params, "link")?;
    if !exists(conn, "users", &user_id)? {
        return Err(HandlerErr::NotFound("user"));
    }
    let id = notify(conn, &user_id, &title, &message, kind, link.as_deref())?;
    Ok(json!({ "notificationId": id }))
}

/// Affects only the caller's own notification; someone else's id reads as not found.
fn notifications_mark_read(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "notificationId")?;
    let n = conn
        .execute(
            "UPDATE notifications SET read = 1 WHERE id = ? AND user_id = ?",
            (&id, &who.id),
        )
        .map_err(HandlerErr::update("notifications"))?;
    if n == 0 {
        return Err(HandlerErr::NotFound("notification"));
    }
    Ok(json!({ "ok": true }))
}

fn notifications_mark_all_read(conn: &Connection, who: &Identity) -> Result<Value, HandlerErr> {
    let n = conn
        .execute(
            "UPDATE notifications SET read = 1 WHERE user_id = ? AND read = 0",
            [&who.id],
        )
        .map_err(HandlerErr::update("notifications"))?;
    Ok(json!({ "ok": true, "updated": n }))
}

fn notifications_delete(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "notificationId")?;
    let n = conn
        .execute(
            "DELETE FROM notifications WHERE id = ? AND user_id = ?",
            (&id, &who.id),
        )
        .map_err(HandlerErr::delete("notifications"))?;
    if n == 0 {
        return Err(HandlerErr::NotFound("notification"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "notifications.list" => with_session(state, req, ANY_ROLE, notifications_list),
        "notifications.unreadCount" => with_session(state, req, ANY_ROLE, |conn, who, _| {
            Ok(json!({ "unread": unread_count(conn, &who.id)? }))
        }),
        "notifications.create" => with_session(state, req, ADMIN_TEACHER, |conn, _, params| {
            notifications_create(conn, params)
        }),
        "notifications.markRead" => with_session(state, req, ANY_ROLE, notifications_mark_read),
        "notifications.markAllRead" => with_session(state, req, ANY_ROLE, |conn, who, _| {
            notifications_mark_all_read(conn, who)
        }),
        "notifications.delete" => with_session(state, req, ANY_ROLE, notifications_delete),
        _ => return None,
    };
    Some(resp)
}
