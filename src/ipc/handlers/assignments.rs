use crate::auth::Identity;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    new_id, now_rfc3339, optional_str, required_str, teacher_group_ids, user_role, with_session,
    ADMIN,
};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use crate::readmodel::{
    fetch_primary, join_fetch, AssignmentDoc, Filter, GroupDoc, ASSIGNMENT_SELECT, GROUP_SELECT,
};
use crate::view::{view_json, EmptyCopy};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

const ASSIGNMENT_ROLES: &[Role] = &[Role::Admin, Role::Teacher, Role::Student];

const NO_ASSIGNMENTS: EmptyCopy = EmptyCopy::with_action(
    "No students assigned",
    "Assign student",
    "/admin/assignments/new",
);
const NO_ASSIGNMENTS_STUDENT: EmptyCopy = EmptyCopy::new("You are not enrolled in any group yet");

fn assignments_list(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let mut filter = Filter::new()
        .eq_opt("group_id", optional_str(params, "groupId")?)
        .eq_opt("grade_id", optional_str(params, "gradeId")?);
    filter = match who.role {
        Role::Student => filter.eq("student_id", who.id.clone()),
        Role::Teacher => filter
            .eq_opt("student_id", optional_str(params, "studentId")?)
            .in_list("group_id", &teacher_group_ids(conn, &who.id)?),
        _ => filter.eq_opt("student_id", optional_str(params, "studentId")?),
    };
    let views = join_fetch(
        conn,
        ASSIGNMENT_SELECT,
        &filter.order_by("created_at, id"),
        AssignmentDoc::from_row,
        |j, a| j.assignment_view(a),
    )?;
    let empty = if who.is(Role::Student) {
        NO_ASSIGNMENTS_STUDENT
    } else {
        NO_ASSIGNMENTS
    };
    Ok(json!({ "assignments": views, "view": view_json(views.len(), empty) }))
}

/// Grade and section are copied from the group so an assignment can never disagree with it.
fn assignments_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let group_id = required_str(params, "groupId")?;

    match user_role(conn, &student_id)? {
        None => return Err(HandlerErr::NotFound("student")),
        Some(Role::Student) => {}
        Some(_) => return Err(HandlerErr::bad_params("studentId must reference a student")),
    }
    let group = fetch_primary(
        conn,
        GROUP_SELECT,
        &Filter::new().eq("id", group_id.clone()),
        GroupDoc::from_row,
    )?
    .into_iter()
    .next()
    .ok_or(HandlerErr::NotFound("group"))?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM assignments WHERE student_id = ? AND group_id = ?",
            (&student_id, &group_id),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Err(HandlerErr::Conflict(format!(
            "student already assigned to group (assignment {})",
            id
        )));
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO assignments(id, student_id, group_id, grade_id, section_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            &group.id,
            &group.grade_id,
            &group.section_id,
            now_rfc3339(),
        ),
    )
    .map_err(HandlerErr::insert("assignments"))?;
    tracing::info!(assignment_id = %id, student_id = %student_id, group_id = %group.id, "student assigned");
    Ok(json!({
        "assignmentId": id,
        "gradeId": group.grade_id,
        "sectionId": group.section_id
    }))
}

fn assignments_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = required_str(params, "assignmentId")?;
    let n = conn
        .execute("DELETE FROM assignments WHERE id = ?", [&id])
        .map_err(HandlerErr::delete("assignments"))?;
    if n == 0 {
        return Err(HandlerErr::NotFound("assignment"));
    }
    tracing::info!(assignment_id = %id, "assignment deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "assignments.list" => with_session(state, req, ASSIGNMENT_ROLES, assignments_list),
        "assignments.create" => with_session(state, req, ADMIN, |conn, _, p| {
            assignments_create(conn, p)
        }),
        "assignments.delete" => with_session(state, req, ADMIN, |conn, _, p| {
            assignments_delete(conn, p)
        }),
        _ => return None,
    };
    Some(resp)
}
