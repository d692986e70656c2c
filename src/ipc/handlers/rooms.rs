use crate::auth::Identity;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::notifications::notify;
use crate::ipc::helpers::{
    ensure_group_access, new_id, now_rfc3339, optional_str, required_str, student_group_ids,
    teacher_group_ids, with_session, ADMIN_TEACHER, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{NotificationKind, Role};
use crate::readmodel::{fetch_primary, join_fetch, Filter, RoomDoc, ROOM_SELECT};
use crate::view::{view_json, EmptyCopy};
use rusqlite::Connection;
use serde_json::{json, Value};

const NO_ROOMS: EmptyCopy = EmptyCopy::new("No virtual rooms available");
const NO_ROOMS_TEACHER: EmptyCopy =
    EmptyCopy::with_action("You have not opened any rooms", "Create room", "/rooms/new");

fn rooms_list(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let mut filter = Filter::new().eq_opt("group_id", optional_str(params, "groupId")?);
    filter = match who.role {
        Role::Teacher => filter.in_list("group_id", &teacher_group_ids(conn, &who.id)?),
        Role::Student => filter.in_list("group_id", &student_group_ids(conn, &who.id)?),
        Role::Admin | Role::Staff => filter,
    };
    let views = join_fetch(
        conn,
        ROOM_SELECT,
        &filter.order_by("created_at DESC"),
        RoomDoc::from_row,
        |j, r| j.room_view(r),
    )?;
    let empty = if who.is(Role::Teacher) {
        NO_ROOMS_TEACHER
    } else {
        NO_ROOMS
    };
    Ok(json!({ "rooms": views, "view": view_json(views.len(), empty) }))
}

fn rooms_create(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let group_id = required_str(params, "groupId")?;
    ensure_group_access(conn, who, &group_id)?;

    let tx = conn.unchecked_transaction()?;
    let id = new_id();
    tx.execute(
        "INSERT INTO rooms(id, name, group_id, creator_id, created_at) VALUES(?, ?, ?, ?, ?)",
        (&id, &name, &group_id, &who.id, now_rfc3339()),
    )
    .map_err(HandlerErr::insert("rooms"))?;
    let students: Vec<String> = {
        let mut stmt =
            tx.prepare("SELECT DISTINCT student_id FROM assignments WHERE group_id = ?")?;
        let ids = stmt
            .query_map([&group_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };
    let message = format!("A new virtual room is open: {}", name);
    let link = format!("/rooms/{}", id);
    for student_id in &students {
        notify(
            &tx,
            student_id,
            "New virtual room",
            &message,
            NotificationKind::Info,
            Some(&link),
        )?;
    }
    tx.commit()?;
    tracing::info!(room_id = %id, group_id = %group_id, notified = students.len(), "room created");
    Ok(json!({ "roomId": id, "notified": students.len() }))
}

/// Admins may delete any room; everyone else only rooms they created.
fn rooms_delete(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let room_id = required_str(params, "roomId")?;
    let room = fetch_primary(
        conn,
        ROOM_SELECT,
        &Filter::new().eq("id", room_id.clone()),
        RoomDoc::from_row,
    )?
    .into_iter()
    .next()
    .ok_or(HandlerErr::NotFound("room"))?;
    if !who.is(Role::Admin) && room.creator_id != who.id {
        return Err(HandlerErr::Forbidden {
            role: who.role.as_str(),
            method: "rooms.delete".to_string(),
        });
    }
    conn.execute("DELETE FROM rooms WHERE id = ?", [&room_id])
        .map_err(HandlerErr::delete("rooms"))?;
    tracing::info!(room_id = %room_id, "room deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "rooms.list" => with_session(state, req, ANY_ROLE, rooms_list),
        "rooms.create" => with_session(state, req, ADMIN_TEACHER, rooms_create),
        "rooms.delete" => with_session(state, req, ANY_ROLE, rooms_delete),
        _ => return None,
    };
    Some(resp)
}
