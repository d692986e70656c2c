//! Role dashboards. Each one fetches its primary lists, hydrates names through
//! one shared `Joiner` and reduces everything in memory with `calc`.

use crate::auth::Identity;
use crate::calc;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{today, with_session, ADMIN, DATE_FMT};
use crate::ipc::types::{AppState, Request};
use crate::model::{AttendanceStatus, Role};
use crate::readmodel::{
    fetch_primary, AssignmentDoc, AttendanceDoc, Filter, GroupDoc, Joiner, ScoreDoc,
    ASSIGNMENT_SELECT, ATTENDANCE_SELECT, GROUP_SELECT, SCORE_SELECT,
};
use crate::view::{view_json, EmptyCopy};
use rusqlite::Connection;
use serde_json::{json, Value};

const TEACHER_ONLY: &[Role] = &[Role::Teacher];
const STUDENT_ONLY: &[Role] = &[Role::Student];

const ADMIN_EMPTY: EmptyCopy =
    EmptyCopy::with_action("No users registered yet", "Add user", "/admin/users/new");
const TEACHER_EMPTY: EmptyCopy = EmptyCopy::new("You have no groups assigned");
const STUDENT_EMPTY: EmptyCopy = EmptyCopy::new("You are not enrolled in any group yet");

fn count_rows(conn: &Connection, table: &'static str) -> Result<i64, HandlerErr> {
    let sql = format!("SELECT COUNT(*) FROM {}", table);
    Ok(conn.query_row(&sql, [], |r| r.get(0))?)
}

fn attendance_statuses(docs: &[AttendanceDoc]) -> impl Iterator<Item = AttendanceStatus> + '_ {
    docs.iter().filter_map(|d| AttendanceStatus::parse(&d.status))
}

fn dashboard_admin(conn: &Connection) -> Result<Value, HandlerErr> {
    let roles: Vec<String> = {
        let mut stmt = conn.prepare("SELECT role FROM users")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    let mut users_by_role = calc::count_by(roles.iter().map(String::as_str));
    for role in Role::ALL {
        users_by_role.entry(role.as_str()).or_insert(0);
    }

    let assignments = fetch_primary(conn, ASSIGNMENT_SELECT, &Filter::new(), AssignmentDoc::from_row)?;
    let per_grade = calc::distinct_by_key(
        assignments
            .iter()
            .map(|a| (a.grade_id.as_str(), a.student_id.as_str())),
    );
    let mut joiner = Joiner::new(conn);
    let students_per_grade: Vec<Value> = per_grade
        .into_iter()
        .map(|(grade_id, students)| {
            let mut row = json!({ "gradeId": grade_id, "students": students });
            if let Some(name) = joiner.grade_name(grade_id) {
                row["gradeName"] = json!(name);
            }
            row
        })
        .collect();

    let today_s = today().format(DATE_FMT).to_string();
    let attendance = fetch_primary(
        conn,
        ATTENDANCE_SELECT,
        &Filter::new().eq("date", today_s.clone()),
        AttendanceDoc::from_row,
    )?;
    let counts = calc::tally_attendance(attendance_statuses(&attendance));

    let total_users = roles.len();
    Ok(json!({
        "usersByRole": users_by_role,
        "totalUsers": total_users,
        "catalog": {
            "grades": count_rows(conn, "grades")?,
            "sections": count_rows(conn, "sections")?,
            "courses": count_rows(conn, "courses")?,
            "groups": count_rows(conn, "class_groups")?,
            "rooms": count_rows(conn, "rooms")?
        },
        "studentsPerGrade": students_per_grade,
        "attendanceToday": {
            "date": today_s,
            "counts": counts,
            "percentages": counts.percentages()
        },
        "view": view_json(total_users, ADMIN_EMPTY)
    }))
}

fn dashboard_teacher(conn: &Connection, who: &Identity) -> Result<Value, HandlerErr> {
    let groups = fetch_primary(
        conn,
        GROUP_SELECT,
        &Filter::new()
            .eq("teacher_id", who.id.clone())
            .order_by("school_year DESC, id"),
        GroupDoc::from_row,
    )?;
    let group_ids: Vec<String> = groups.iter().map(|g| g.id.clone()).collect();

    let assignments = fetch_primary(
        conn,
        ASSIGNMENT_SELECT,
        &Filter::new().in_list("group_id", &group_ids),
        AssignmentDoc::from_row,
    )?;
    let students_per_group = calc::distinct_by_key(
        assignments
            .iter()
            .map(|a| (a.group_id.as_str(), a.student_id.as_str())),
    );
    let scores = fetch_primary(
        conn,
        SCORE_SELECT,
        &Filter::new().in_list("group_id", &group_ids),
        ScoreDoc::from_row,
    )?;
    let avg_per_group = calc::grouped_means(scores.iter().map(|s| (s.group_id.as_str(), s.value)));
    let scores_per_group = calc::count_by(scores.iter().map(|s| s.group_id.as_str()));

    let mut joiner = Joiner::new(conn);
    let group_cards: Vec<Value> = groups
        .iter()
        .map(|g| {
            let id = g.id.as_str();
            json!({
                "group": joiner.group_view(g.clone()),
                "students": students_per_group.get(id).copied().unwrap_or(0),
                "scoreAverage": avg_per_group.get(id).copied().unwrap_or(0.0),
                "scoreCount": scores_per_group.get(id).copied().unwrap_or(0)
            })
        })
        .collect();

    let recent = fetch_primary(
        conn,
        SCORE_SELECT,
        &Filter::new()
            .in_list("group_id", &group_ids)
            .order_by("date DESC, created_at DESC")
            .limit(5),
        ScoreDoc::from_row,
    )?;
    let recent_scores: Vec<_> = recent.into_iter().map(|s| joiner.score_view(s)).collect();

    Ok(json!({
        "groups": group_cards,
        "totalStudents": calc::distinct_count(assignments.iter().map(|a| a.student_id.as_str())),
        "recentScores": recent_scores,
        "view": view_json(groups.len(), TEACHER_EMPTY)
    }))
}

fn dashboard_student(conn: &Connection, who: &Identity) -> Result<Value, HandlerErr> {
    let mut joiner = Joiner::new(conn);
    let assignments: Vec<_> = fetch_primary(
        conn,
        ASSIGNMENT_SELECT,
        &Filter::new()
            .eq("student_id", who.id.clone())
            .order_by("created_at, id"),
        AssignmentDoc::from_row,
    )?
    .into_iter()
    .map(|a| joiner.assignment_view(a))
    .collect();

    let scores = fetch_primary(
        conn,
        SCORE_SELECT,
        &Filter::new().eq("student_id", who.id.clone()),
        ScoreDoc::from_row,
    )?;
    let summary = calc::score_summary(scores.iter().map(|s| (s.period.as_str(), s.value)));
    let per_group = calc::grouped_means(scores.iter().map(|s| (s.group_id.as_str(), s.value)));
    let counts_per_group = calc::count_by(scores.iter().map(|s| s.group_id.as_str()));
    let course_averages: Vec<Value> = per_group
        .into_iter()
        .map(|(group_id, average)| {
            let mut row = json!({
                "groupId": group_id,
                "average": average,
                "count": counts_per_group.get(group_id).copied().unwrap_or(0)
            });
            let course_name = joiner
                .group_doc(group_id)
                .and_then(|g| joiner.course_name(&g.course_id));
            if let Some(name) = course_name {
                row["courseName"] = json!(name);
            }
            row
        })
        .collect();

    let attendance = fetch_primary(
        conn,
        ATTENDANCE_SELECT,
        &Filter::new().eq("person_id", who.id.clone()),
        AttendanceDoc::from_row,
    )?;
    let counts = calc::tally_attendance(attendance_statuses(&attendance));
    let unread: i64 = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read = 0",
        [&who.id],
        |r| r.get(0),
    )?;

    Ok(json!({
        "assignments": assignments,
        "scores": {
            "count": summary.count,
            "average": summary.average,
            "periodAverages": summary.period_averages
        },
        "courseAverages": course_averages,
        "attendance": {
            "counts": counts,
            "percentages": counts.percentages()
        },
        "unreadNotifications": unread,
        "view": view_json(assignments.len(), STUDENT_EMPTY)
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "dashboard.admin" => with_session(state, req, ADMIN, |conn, _, _| dashboard_admin(conn)),
        "dashboard.teacher" => with_session(state, req, TEACHER_ONLY, |conn, who, _| {
            dashboard_teacher(conn, who)
        }),
        "dashboard.student" => with_session(state, req, STUDENT_ONLY, |conn, who, _| {
            dashboard_student(conn, who)
        }),
        _ => return None,
    };
    Some(resp)
}
