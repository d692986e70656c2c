//! Grades, sections and courses: the small reference collections groups point at.
//!
//! Deletes remove the single document. Groups, sections or assignments still
//! pointing at it keep the dangling id and their views omit the name.

use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    exists, new_id, optional_str, patch_object, required_str, with_session, ADMIN, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use crate::readmodel::{fetch_primary, join_fetch, Filter, SectionDoc, SECTION_SELECT};
use crate::view::{view_json, EmptyCopy};
use rusqlite::{Connection, Row};
use serde::Serialize;
use serde_json::{json, Value};

const NO_GRADES: EmptyCopy =
    EmptyCopy::with_action("No grades defined", "Create grade", "/admin/grades/new");
const NO_SECTIONS: EmptyCopy =
    EmptyCopy::with_action("No sections defined", "Create section", "/admin/sections/new");
const NO_COURSES: EmptyCopy =
    EmptyCopy::with_action("No courses defined", "Create course", "/admin/courses/new");

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GradeRow {
    id: String,
    name: String,
    level: i64,
}

impl GradeRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            level: r.get(2)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CourseRow {
    id: String,
    name: String,
    description: String,
}

impl CourseRow {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            description: r.get(2)?,
        })
    }
}

fn delete_one(conn: &Connection, table: &'static str, id: &str, what: &'static str) -> Result<Value, HandlerErr> {
    let sql = format!("DELETE FROM {} WHERE id = ?", table);
    let n = conn
        .execute(&sql, [id])
        .map_err(HandlerErr::delete(table))?;
    if n == 0 {
        return Err(HandlerErr::NotFound(what));
    }
    tracing::info!(table, id, "deleted");
    Ok(json!({ "ok": true }))
}

fn grades_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let rows = fetch_primary(
        conn,
        "SELECT id, name, level FROM grades",
        &Filter::new().order_by("level, name"),
        GradeRow::from_row,
    )?;
    Ok(json!({ "grades": rows, "view": view_json(rows.len(), NO_GRADES) }))
}

fn grades_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let level = params
        .get("level")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing level"))?;
    if level < 0 {
        return Err(HandlerErr::bad_params("level must be >= 0"));
    }
    let id = new_id();
    conn.execute(
        "INSERT INTO grades(id, name, level) VALUES(?, ?, ?)",
        (&id, &name, level),
    )
    .map_err(HandlerErr::insert("grades"))?;
    tracing::info!(grade_id = %id, "grade created");
    Ok(json!({ "gradeId": id }))
}

fn sections_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let filter = Filter::new()
        .eq_opt("grade_id", optional_str(params, "gradeId")?)
        .order_by("name, id");
    let views = join_fetch(conn, SECTION_SELECT, &filter, SectionDoc::from_row, |j, s| {
        j.section_view(s)
    })?;
    Ok(json!({ "sections": views, "view": view_json(views.len(), NO_SECTIONS) }))
}

fn sections_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let grade_id = required_str(params, "gradeId")?;
    if !exists(conn, "grades", &grade_id)? {
        return Err(HandlerErr::NotFound("grade"));
    }
    let id = new_id();
    conn.execute(
        "INSERT INTO sections(id, name, grade_id) VALUES(?, ?, ?)",
        (&id, &name, &grade_id),
    )
    .map_err(HandlerErr::insert("sections"))?;
    tracing::info!(section_id = %id, grade_id = %grade_id, "section created");
    Ok(json!({ "sectionId": id }))
}

fn courses_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let rows = fetch_primary(
        conn,
        "SELECT id, name, description FROM courses",
        &Filter::new().order_by("name, id"),
        CourseRow::from_row,
    )?;
    Ok(json!({ "courses": rows, "view": view_json(rows.len(), NO_COURSES) }))
}

fn courses_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let description = optional_str(params, "description")?.unwrap_or_default();
    let id = new_id();
    conn.execute(
        "INSERT INTO courses(id, name, description) VALUES(?, ?, ?)",
        (&id, &name, &description),
    )
    .map_err(HandlerErr::insert("courses"))?;
    tracing::info!(course_id = %id, "course created");
    Ok(json!({ "courseId": id }))
}

fn courses_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let patch = patch_object(params)?;
    let mut name: Option<String> = None;
    let mut description: Option<String> = None;
    for (k, v) in patch {
        let s = v
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| HandlerErr::bad_params(format!("patch.{} must be string", k)))?;
        match k.as_str() {
            "name" if s.is_empty() => return Err(HandlerErr::bad_params("name must not be empty")),
            "name" => name = Some(s),
            "description" => description = Some(s),
            other => return Err(HandlerErr::bad_params(format!("unknown course field: {}", other))),
        }
    }
    let n = conn
        .execute(
            "UPDATE courses
             SET name = COALESCE(?, name), description = COALESCE(?, description)
             WHERE id = ?",
            (&name, &description, &course_id),
        )
        .map_err(HandlerErr::update("courses"))?;
    if n == 0 {
        return Err(HandlerErr::NotFound("course"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "grades.list" => with_session(state, req, ANY_ROLE, |conn, _, _| grades_list(conn)),
        "grades.create" => with_session(state, req, ADMIN, |conn, _, p| grades_create(conn, p)),
        "grades.delete" => with_session(state, req, ADMIN, |conn, _, p| {
            delete_one(conn, "grades", &required_str(p, "gradeId")?, "grade")
        }),
        "sections.list" => with_session(state, req, ANY_ROLE, |conn, _, p| sections_list(conn, p)),
        "sections.create" => with_session(state, req, ADMIN, |conn, _, p| sections_create(conn, p)),
        "sections.delete" => with_session(state, req, ADMIN, |conn, _, p| {
            delete_one(conn, "sections", &required_str(p, "sectionId")?, "section")
        }),
        "courses.list" => with_session(state, req, ANY_ROLE, |conn, _, _| courses_list(conn)),
        "courses.create" => with_session(state, req, ADMIN, |conn, _, p| courses_create(conn, p)),
        "courses.update" => with_session(state, req, ADMIN, |conn, _, p| courses_update(conn, p)),
        "courses.delete" => with_session(state, req, ADMIN, |conn, _, p| {
            delete_one(conn, "courses", &required_str(p, "courseId")?, "course")
        }),
        _ => return None,
    };
    Some(resp)
}
