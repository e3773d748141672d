// Connection configuration. Each setting resolves as: explicit value, then
// environment variable, then the configured default (YAML file), then the
// built-in fallback.

use crate::error::{ModelGateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const ENV_URI: &str = "MODELGATE_URI";
pub const ENV_USERNAME: &str = "MODELGATE_USERNAME";
pub const ENV_PASSWORD: &str = "MODELGATE_PASSWORD";
pub const ENV_DB_NAME: &str = "MODELGATE_DB_NAME";
pub const ENV_PACKAGE: &str = "PACKAGE";
pub const ENV_TEST_WORKER_ID: &str = "TEST_WORKER_ID";

pub const DEFAULT_URI: &str = "embedded://:memory:";
pub const DEFAULT_DB_NAME: &str = "modelgate-test";

const USERNAME_PLACEHOLDER: &str = "<username>";
const PASSWORD_PLACEHOLDER: &str = "<password>";

/// Partial connection settings, as written in a config file or passed in code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,
}

impl DatabaseConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn with_uri(mut self, uri: &str) -> Self {
        self.uri = Some(uri.to_string());
        self
    }

    pub fn with_db_name(mut self, db_name: &str) -> Self {
        self.db_name = Some(db_name.to_string());
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }
}

/// Where environment-style settings come from.
pub trait ConfigSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment. Empty variables count as unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl ConfigSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

impl ConfigSource for BTreeMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

/// Fully resolved settings used to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    /// Connection string with credential placeholders substituted.
    pub uri: String,
    pub db_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ResolvedConfig {
    /// Resolve `explicit` over the environment over `file` over fallbacks.
    pub fn resolve(
        explicit: &DatabaseConfig,
        file: &DatabaseConfig,
        source: &dyn ConfigSource,
    ) -> Result<Self> {
        let pick = |own: &Option<String>, env_key: &str, configured: &Option<String>| {
            own.clone()
                .or_else(|| source.var(env_key))
                .or_else(|| configured.clone())
        };

        let username = pick(&explicit.username, ENV_USERNAME, &file.username);
        let password = pick(&explicit.password, ENV_PASSWORD, &file.password);
        let raw_uri = pick(&explicit.uri, ENV_URI, &file.uri).unwrap_or_else(|| DEFAULT_URI.to_string());
        let uri = substitute_credentials(&raw_uri, username.as_deref(), password.as_deref())?;

        let db_name = match pick(&explicit.db_name, ENV_DB_NAME, &file.db_name) {
            Some(name) => name,
            None => fallback_db_name(source),
        };
        if db_name.trim().is_empty() {
            return Err(ModelGateError::Config("Database name must not be empty".into()));
        }

        Ok(ResolvedConfig {
            uri,
            db_name,
            username,
            password,
        })
    }

    /// The uri with the password masked, for logs and status output.
    pub fn redacted_uri(&self) -> String {
        match self.password.as_deref() {
            Some(password) if !password.is_empty() => self.uri.replace(password, "****"),
            _ => self.uri.clone(),
        }
    }
}

fn substitute_credentials(uri: &str, username: Option<&str>, password: Option<&str>) -> Result<String> {
    let mut out = uri.to_string();
    for (placeholder, value, what) in [
        (USERNAME_PLACEHOLDER, username, "username"),
        (PASSWORD_PLACEHOLDER, password, "password"),
    ] {
        if !out.contains(placeholder) {
            continue;
        }
        let value = value.ok_or_else(|| {
            ModelGateError::Config(format!(
                "Connection string references {placeholder} but no {what} is configured"
            ))
        })?;
        out = out.replace(placeholder, value);
    }
    Ok(out)
}

/// `modelgate-test`, or `{PACKAGE}-test-{TEST_WORKER_ID}` when running under a
/// package-level test runner.
fn fallback_db_name(source: &dyn ConfigSource) -> String {
    match source.var(ENV_PACKAGE) {
        Some(package) => {
            let worker = source.var(ENV_TEST_WORKER_ID).unwrap_or_else(|| "0".to_string());
            format!("{package}-test-{worker}")
        }
        None => DEFAULT_DB_NAME.to_string(),
    }
}
