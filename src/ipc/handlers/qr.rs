use crate::auth::{self, Identity};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{optional_str, with_session, ANY_ROLE};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use crate::qr::{self, PersonType, QrParse};
use rusqlite::Connection;
use serde_json::{json, Value};

fn qr_generate(conn: &Connection, who: &Identity, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = optional_str(params, "userId")?.unwrap_or_else(|| who.id.clone());
    if user_id != who.id && !who.is(Role::Admin) {
        return Err(HandlerErr::Forbidden {
            role: who.role.as_str(),
            method: "qr.generate".to_string(),
        });
    }
    let person = if user_id == who.id {
        who.clone()
    } else {
        auth::load_identity(conn, &user_id)?.ok_or(HandlerErr::NotFound("user"))?
    };
    let kind = PersonType::for_role(person.role);
    let payload = qr::format_payload(kind, &person.id, person.profile.dni.as_deref())
        .map_err(HandlerErr::BadParams)?;
    Ok(json!({
        "payload": payload,
        "userId": person.id,
        "tipo": kind.as_str(),
        "name": person.profile.name,
        "surname": person.profile.surname
    }))
}

/// Public: scanners validate codes before anyone signs in.
fn handle_qr_parse(req: &Request) -> Value {
    let raw = req
        .params
        .get("payload")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let parsed = QrParse::from(qr::parse_payload(raw));
    ok(&req.id, json!(parsed))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "qr.generate" => Some(with_session(state, req, ANY_ROLE, qr_generate)),
        "qr.parse" => Some(handle_qr_parse(req)),
        _ => None,
    }
}
