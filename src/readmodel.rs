//! Denormalising read model: one primary query, then memoised point lookups
//! into the referenced collections.
//!
//! A secondary lookup that fails or finds nothing leaves its field out of the
//! view; only the primary query can fail a request.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<(String, Vec<Value>)>,
    order_by: Option<&'static str>,
    limit: Option<i64>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.clauses
            .push((format!("{column} = ?"), vec![value.into()]));
        self
    }

    pub fn eq_opt(self, column: &'static str, value: Option<String>) -> Self {
        match value {
            Some(v) => self.eq(column, v),
            None => self,
        }
    }

    pub fn gte(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.clauses
            .push((format!("{column} >= ?"), vec![value.into()]));
        self
    }

    pub fn lte(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.clauses
            .push((format!("{column} <= ?"), vec![value.into()]));
        self
    }

    /// An empty id list matches nothing.
    pub fn in_list(mut self, column: &'static str, values: &[String]) -> Self {
        if values.is_empty() {
            self.clauses.push(("0".to_string(), Vec::new()));
            return self;
        }
        let marks = vec!["?"; values.len()].join(", ");
        self.clauses.push((
            format!("{column} IN ({marks})"),
            values.iter().cloned().map(Value::from).collect(),
        ));
        self
    }

    pub fn order_by(mut self, clause: &'static str) -> Self {
        self.order_by = Some(clause);
        self
    }

    pub fn limit(mut self, n: i64) -> Self {
        self.limit = Some(n);
        self
    }

    fn sql_suffix(&self) -> String {
        let mut out = String::new();
        if !self.clauses.is_empty() {
            let parts: Vec<&str> = self.clauses.iter().map(|(s, _)| s.as_str()).collect();
            out.push_str(" WHERE ");
            out.push_str(&parts.join(" AND "));
        }
        if let Some(order) = self.order_by {
            out.push_str(" ORDER BY ");
            out.push_str(order);
        }
        if let Some(n) = self.limit {
            out.push_str(&format!(" LIMIT {n}"));
        }
        out
    }

    fn params(&self) -> Vec<Value> {
        self.clauses
            .iter()
            .flat_map(|(_, vals)| vals.iter().cloned())
            .collect()
    }
}

/// Runs `select` (a `SELECT ... FROM table` without WHERE) with the filter applied.
pub fn fetch_primary<T, F>(
    conn: &Connection,
    select: &str,
    filter: &Filter,
    map: F,
) -> rusqlite::Result<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let sql = format!("{select}{}", filter.sql_suffix());
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(filter.params()), map)?;
    rows.collect()
}

struct Lookup<T> {
    table: &'static str,
    sql: &'static str,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
    cache: HashMap<String, Option<T>>,
}

impl<T: Clone> Lookup<T> {
    fn new(table: &'static str, sql: &'static str, map: fn(&Row<'_>) -> rusqlite::Result<T>) -> Self {
        Self {
            table,
            sql,
            map,
            cache: HashMap::new(),
        }
    }

    fn get(&mut self, conn: &Connection, id: &str) -> Option<T> {
        if let Some(hit) = self.cache.get(id) {
            return hit.clone();
        }
        let found = match conn.query_row(self.sql, [id], self.map).optional() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(table = self.table, id, error = %e, "lookup failed, field omitted");
                None
            }
        };
        self.cache.insert(id.to_string(), found.clone());
        found
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonRef {
    pub id: String,
    pub name: String,
    pub surname: String,
    pub role: String,
}

#[derive(Debug, Clone)]
pub struct GroupDoc {
    pub id: String,
    pub grade_id: String,
    pub section_id: String,
    pub course_id: String,
    pub teacher_id: String,
    pub school_year: i64,
}

pub const GROUP_SELECT: &str =
    "SELECT id, grade_id, section_id, course_id, teacher_id, school_year FROM class_groups";

impl GroupDoc {
    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            grade_id: r.get(1)?,
            section_id: r.get(2)?,
            course_id: r.get(3)?,
            teacher_id: r.get(4)?,
            school_year: r.get(5)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SectionDoc {
    pub id: String,
    pub name: String,
    pub grade_id: String,
}

pub const SECTION_SELECT: &str = "SELECT id, name, grade_id FROM sections";

impl SectionDoc {
    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            grade_id: r.get(2)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AssignmentDoc {
    pub id: String,
    pub student_id: String,
    pub group_id: String,
    pub grade_id: String,
    pub section_id: String,
}

pub const ASSIGNMENT_SELECT: &str =
    "SELECT id, student_id, group_id, grade_id, section_id FROM assignments";

impl AssignmentDoc {
    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            student_id: r.get(1)?,
            group_id: r.get(2)?,
            grade_id: r.get(3)?,
            section_id: r.get(4)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScoreDoc {
    pub id: String,
    pub student_id: String,
    pub group_id: String,
    pub value: f64,
    pub description: String,
    pub date: String,
    pub period: String,
}

pub const SCORE_SELECT: &str =
    "SELECT id, student_id, group_id, value, description, date, period FROM grade_records";

impl ScoreDoc {
    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            student_id: r.get(1)?,
            group_id: r.get(2)?,
            value: r.get(3)?,
            description: r.get(4)?,
            date: r.get(5)?,
            period: r.get(6)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AttendanceDoc {
    pub id: String,
    pub person_id: String,
    pub role: String,
    pub date: String,
    pub time: String,
    pub status: String,
    pub notified: bool,
}

pub const ATTENDANCE_SELECT: &str =
    "SELECT id, person_id, role, date, time, status, notified FROM attendance_records";

impl AttendanceDoc {
    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            person_id: r.get(1)?,
            role: r.get(2)?,
            date: r.get(3)?,
            time: r.get(4)?,
            status: r.get(5)?,
            notified: r.get::<_, i64>(6)? != 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RoomDoc {
    pub id: String,
    pub name: String,
    pub group_id: String,
    pub creator_id: String,
    pub created_at: String,
}

pub const ROOM_SELECT: &str = "SELECT id, name, group_id, creator_id, created_at FROM rooms";

impl RoomDoc {
    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            name: r.get(1)?,
            group_id: r.get(2)?,
            creator_id: r.get(3)?,
            created_at: r.get(4)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionView {
    pub id: String,
    pub name: String,
    pub grade_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    pub id: String,
    pub grade_id: String,
    pub section_id: String,
    pub course_id: String,
    pub teacher_id: String,
    pub school_year: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher: Option<PersonRef>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentView {
    pub id: String,
    pub student_id: String,
    pub group_id: String,
    pub grade_id: String,
    pub section_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student: Option<PersonRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreView {
    pub id: String,
    pub student_id: String,
    pub group_id: String,
    pub value: f64,
    pub description: String,
    pub date: String,
    pub period: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student: Option<PersonRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceView {
    pub id: String,
    pub person_id: String,
    pub role: String,
    pub date: String,
    pub time: String,
    pub status: String,
    pub notified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surname: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    pub id: String,
    pub name: String,
    pub group_id: String,
    pub creator_id: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<PersonRef>,
}

fn person_from_row(r: &Row<'_>) -> rusqlite::Result<PersonRef> {
    Ok(PersonRef {
        id: r.get(0)?,
        name: r.get(1)?,
        surname: r.get(2)?,
        role: r.get(3)?,
    })
}

fn name_from_row(r: &Row<'_>) -> rusqlite::Result<String> {
    r.get(0)
}

/// Per-request hydration context. Each distinct id is read at most once.
pub struct Joiner<'c> {
    conn: &'c Connection,
    people: Lookup<PersonRef>,
    grades: Lookup<String>,
    sections: Lookup<String>,
    courses: Lookup<String>,
    groups: Lookup<GroupDoc>,
}

impl<'c> Joiner<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            people: Lookup::new(
                "users",
                "SELECT id, name, surname, role FROM users WHERE id = ?",
                person_from_row,
            ),
            grades: Lookup::new("grades", "SELECT name FROM grades WHERE id = ?", name_from_row),
            sections: Lookup::new(
                "sections",
                "SELECT name FROM sections WHERE id = ?",
                name_from_row,
            ),
            courses: Lookup::new(
                "courses",
                "SELECT name FROM courses WHERE id = ?",
                name_from_row,
            ),
            groups: Lookup::new(
                "class_groups",
                "SELECT id, grade_id, section_id, course_id, teacher_id, school_year
                 FROM class_groups WHERE id = ?",
                GroupDoc::from_row,
            ),
        }
    }

    pub fn person(&mut self, id: &str) -> Option<PersonRef> {
        self.people.get(self.conn, id)
    }

    pub fn grade_name(&mut self, id: &str) -> Option<String> {
        self.grades.get(self.conn, id)
    }

    pub fn section_name(&mut self, id: &str) -> Option<String> {
        self.sections.get(self.conn, id)
    }

    pub fn course_name(&mut self, id: &str) -> Option<String> {
        self.courses.get(self.conn, id)
    }

    pub fn group_doc(&mut self, id: &str) -> Option<GroupDoc> {
        self.groups.get(self.conn, id)
    }

    pub fn group(&mut self, id: &str) -> Option<GroupView> {
        let doc = self.group_doc(id)?;
        Some(self.group_view(doc))
    }

    pub fn group_view(&mut self, g: GroupDoc) -> GroupView {
        GroupView {
            grade_name: self.grade_name(&g.grade_id),
            section_name: self.section_name(&g.section_id),
            course_name: self.course_name(&g.course_id),
            teacher: self.person(&g.teacher_id),
            id: g.id,
            grade_id: g.grade_id,
            section_id: g.section_id,
            course_id: g.course_id,
            teacher_id: g.teacher_id,
            school_year: g.school_year,
        }
    }

    pub fn section_view(&mut self, s: SectionDoc) -> SectionView {
        SectionView {
            grade_name: self.grade_name(&s.grade_id),
            id: s.id,
            name: s.name,
            grade_id: s.grade_id,
        }
    }

    pub fn assignment_view(&mut self, a: AssignmentDoc) -> AssignmentView {
        AssignmentView {
            student: self.person(&a.student_id),
            group: self.group(&a.group_id),
            id: a.id,
            student_id: a.student_id,
            group_id: a.group_id,
            grade_id: a.grade_id,
            section_id: a.section_id,
        }
    }

    pub fn score_view(&mut self, s: ScoreDoc) -> ScoreView {
        let course_name = self
            .group_doc(&s.group_id)
            .and_then(|g| self.course_name(&g.course_id));
        ScoreView {
            student: self.person(&s.student_id),
            course_name,
            id: s.id,
            student_id: s.student_id,
            group_id: s.group_id,
            value: s.value,
            description: s.description,
            date: s.date,
            period: s.period,
        }
    }

    pub fn attendance_view(&mut self, a: AttendanceDoc) -> AttendanceView {
        let person = self.person(&a.person_id);
        AttendanceView {
            name: person.as_ref().map(|p| p.name.clone()),
            surname: person.map(|p| p.surname),
            id: a.id,
            person_id: a.person_id,
            role: a.role,
            date: a.date,
            time: a.time,
            status: a.status,
            notified: a.notified,
        }
    }

    pub fn room_view(&mut self, r: RoomDoc) -> RoomView {
        RoomView {
            group: self.group(&r.group_id),
            creator: self.person(&r.creator_id),
            id: r.id,
            name: r.name,
            group_id: r.group_id,
            creator_id: r.creator_id,
            created_at: r.created_at,
        }
    }
}

/// Primary query plus hydration in one call.
pub fn join_fetch<D, V, F, H>(
    conn: &Connection,
    select: &str,
    filter: &Filter,
    map: F,
    mut hydrate: H,
) -> rusqlite::Result<Vec<V>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<D>,
    H: FnMut(&mut Joiner<'_>, D) -> V,
{
    let docs = fetch_primary(conn, select, filter, map)?;
    let mut joiner = Joiner::new(conn);
    Ok(docs.into_iter().map(|d| hydrate(&mut joiner, d)).collect())
}
