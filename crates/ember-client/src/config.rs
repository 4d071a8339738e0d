use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use url::Url;

/// Runtime settings, read from `EMBER_*` environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub db_path: PathBuf,
    /// Used for password login when no stored session is valid.
    pub login: Option<(String, String)>,
    /// Log out on exit instead of keeping the stored session.
    pub logout_on_exit: bool,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = var("EMBER_API_URL").context("EMBER_API_URL is not set")?;
        let api_url = Url::parse(&raw).with_context(|| format!("invalid EMBER_API_URL {:?}", raw))?;
        if !matches!(api_url.scheme(), "http" | "https") {
            bail!("EMBER_API_URL must be http or https, got {}", api_url.scheme());
        }

        let db_path = var("EMBER_DB_PATH").unwrap_or_else(|| "ember.db".into());
        let login = match (var("EMBER_USERNAME"), var("EMBER_PASSWORD")) {
            (Some(user), Some(pass)) => Some((user, pass)),
            (None, None) => None,
            _ => bail!("EMBER_USERNAME and EMBER_PASSWORD must be set together"),
        };
        let logout_on_exit = var("EMBER_LOGOUT_ON_EXIT")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            api_url,
            db_path: PathBuf::from(db_path),
            login,
            logout_on_exit,
        })
    }
}
