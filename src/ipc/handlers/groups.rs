use crate::auth::Identity;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    exists, new_id, optional_i64, optional_str, required_str, user_role, with_session, ADMIN,
    ADMIN_TEACHER,
};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use crate::readmodel::{join_fetch, Filter, GroupDoc, GROUP_SELECT};
use crate::view::{view_json, EmptyCopy};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

const NO_GROUPS_ADMIN: EmptyCopy =
    EmptyCopy::with_action("No groups created yet", "Create group", "/admin/groups/new");
const NO_GROUPS_TEACHER: EmptyCopy = EmptyCopy::new("You have no groups assigned");

fn groups_list(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = if who.is(Role::Teacher) {
        Some(who.id.clone())
    } else {
        optional_str(params, "teacherId")?
    };
    let mut filter = Filter::new()
        .eq_opt("teacher_id", teacher_id)
        .eq_opt("grade_id", optional_str(params, "gradeId")?);
    if let Some(year) = optional_i64(params, "schoolYear")? {
        filter = filter.eq("school_year", year);
    }
    let views = join_fetch(
        conn,
        GROUP_SELECT,
        &filter.order_by("school_year DESC, id"),
        GroupDoc::from_row,
        |j, g| j.group_view(g),
    )?;
    let empty = if who.is(Role::Teacher) {
        NO_GROUPS_TEACHER
    } else {
        NO_GROUPS_ADMIN
    };
    Ok(json!({ "groups": views, "view": view_json(views.len(), empty) }))
}

fn groups_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let grade_id = required_str(params, "gradeId")?;
    let section_id = required_str(params, "sectionId")?;
    let course_id = required_str(params, "courseId")?;
    let teacher_id = required_str(params, "teacherId")?;
    let school_year = match optional_i64(params, "schoolYear")? {
        Some(y) => y,
        None => setup::current_school_year(conn),
    };

    if !exists(conn, "grades", &grade_id)? {
        return Err(HandlerErr::NotFound("grade"));
    }
    let section_grade: Option<String> = conn
        .query_row(
            "SELECT grade_id FROM sections WHERE id = ?",
            [&section_id],
            |r| r.get(0),
        )
        .optional()?;
    match section_grade {
        None => return Err(HandlerErr::NotFound("section")),
        Some(g) if g != grade_id => {
            return Err(HandlerErr::bad_params("section does not belong to grade"));
        }
        Some(_) => {}
    }
    if !exists(conn, "courses", &course_id)? {
        return Err(HandlerErr::NotFound("course"));
    }
    if user_role(conn, &teacher_id)? != Some(Role::Teacher) {
        return Err(HandlerErr::bad_params("teacherId must reference a teacher"));
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO class_groups(id, grade_id, section_id, course_id, teacher_id, school_year)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &grade_id, &section_id, &course_id, &teacher_id, school_year),
    )
    .map_err(HandlerErr::insert("class_groups"))?;
    tracing::info!(group_id = %id, teacher_id = %teacher_id, school_year, "group created");
    Ok(json!({ "groupId": id, "schoolYear": school_year }))
}

fn groups_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let group_id = required_str(params, "groupId")?;
    let n = conn
        .execute("DELETE FROM class_groups WHERE id = ?", [&group_id])
        .map_err(HandlerErr::delete("class_groups"))?;
    if n == 0 {
        return Err(HandlerErr::NotFound("group"));
    }
    tracing::info!(group_id = %group_id, "group deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "groups.list" => with_session(state, req, ADMIN_TEACHER, groups_list),
        "groups.create" => with_session(state, req, ADMIN, |conn, _, p| groups_create(conn, p)),
        "groups.delete" => with_session(state, req, ADMIN, |conn, _, p| groups_delete(conn, p)),
        _ => return None,
    };
    Some(resp)
}
