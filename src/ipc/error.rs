use serde_json::json;

use crate::auth::{DASHBOARD_ROUTE, LOGIN_ROUTE};

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerErr {
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("sign in first")]
    Unauthenticated,
    #[error("role {role} cannot call {method}")]
    Forbidden { role: &'static str, method: String },
    #[error("{0}")]
    BadParams(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("invalid QR payload: {0}")]
    InvalidQr(String),
    #[error("{source}")]
    Db {
        code: &'static str,
        table: Option<&'static str>,
        source: rusqlite::Error,
    },
    #[error("io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(source: rusqlite::Error) -> Self {
        HandlerErr::Db {
            code: "db_query_failed",
            table: None,
            source,
        }
    }
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr::BadParams(message.into())
    }

    pub fn insert(table: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| HandlerErr::Db {
            code: "db_insert_failed",
            table: Some(table),
            source,
        }
    }

    pub fn update(table: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| HandlerErr::Db {
            code: "db_update_failed",
            table: Some(table),
            source,
        }
    }

    pub fn delete(table: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| HandlerErr::Db {
            code: "db_delete_failed",
            table: Some(table),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            HandlerErr::NoWorkspace => "no_workspace",
            HandlerErr::Unauthenticated => "unauthenticated",
            HandlerErr::Forbidden { .. } => "forbidden",
            HandlerErr::BadParams(_) => "bad_params",
            HandlerErr::NotFound(_) => "not_found",
            HandlerErr::Conflict(_) => "conflict",
            HandlerErr::InvalidCredentials => "invalid_credentials",
            HandlerErr::InvalidQr(_) => "invalid_qr",
            HandlerErr::Db { code, .. } => *code,
            HandlerErr::Io(_) => "io_failed",
            HandlerErr::Internal(_) => "internal",
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            HandlerErr::Unauthenticated => Some(json!({ "redirect": LOGIN_ROUTE })),
            HandlerErr::Forbidden { .. } => Some(json!({ "redirect": DASHBOARD_ROUTE })),
            HandlerErr::InvalidQr(_) => Some(json!({ "isValid": false })),
            HandlerErr::Db {
                table: Some(table), ..
            } => Some(json!({ "table": table })),
            _ => None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        let details = self.details();
        err(id, self.code(), self.to_string(), details)
    }
}
