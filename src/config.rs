use anyhow::Context;
use std::path::PathBuf;

/// Process configuration loaded from the environment (and `.env`, if present).
///
/// | Env Var                      | Default |
/// |------------------------------|---------|
/// | `COLEGIOD_WORKSPACE`         | unset   |
/// | `COLEGIOD_SESSION_TTL_HOURS` | `12`    |
/// | `COLEGIOD_MIN_PASSWORD_LEN`  | `8`     |
#[derive(Debug, Clone)]
pub struct Config {
    /// Workspace opened before the first request is read.
    pub workspace: Option<PathBuf>,
    pub session_ttl_hours: i64,
    pub min_password_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            session_ttl_hours: 12,
            min_password_len: 8,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let workspace = std::env::var("COLEGIOD_WORKSPACE")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let session_ttl_hours = match std::env::var("COLEGIOD_SESSION_TTL_HOURS") {
            Ok(raw) => raw
                .trim()
                .parse::<i64>()
                .context("COLEGIOD_SESSION_TTL_HOURS must be an integer")?,
            Err(_) => defaults.session_ttl_hours,
        };
        if session_ttl_hours <= 0 {
            anyhow::bail!("COLEGIOD_SESSION_TTL_HOURS must be positive");
        }

        let min_password_len = match std::env::var("COLEGIOD_MIN_PASSWORD_LEN") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .context("COLEGIOD_MIN_PASSWORD_LEN must be a non-negative integer")?,
            Err(_) => defaults.min_password_len,
        };

        Ok(Self {
            workspace,
            session_ttl_hours,
            min_password_len,
        })
    }
}
