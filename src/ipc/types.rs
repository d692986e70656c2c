use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::Config;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Overrides the process session for this request only.
    #[serde(default)]
    pub token: Option<String>,
}

pub struct AppState {
    pub config: Config,
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Token of the last successful sign-in on this process.
    pub session_token: Option<String>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            workspace: None,
            db: None,
            session_token: None,
        }
    }

    pub fn current_token<'a>(&'a self, req: &'a Request) -> Option<&'a str> {
        req.token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(self.session_token.as_deref())
    }
}
