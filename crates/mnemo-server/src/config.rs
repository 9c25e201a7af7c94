use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_root: PathBuf,
    /// Account created at startup when both variables are present. Further
    /// accounts are provisioned through the user store directly.
    pub default_account: Option<(String, String)>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("data_root", &self.data_root)
            .field(
                "default_account",
                &self.default_account.as_ref().map(|(user, _)| user),
            )
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "MNEMO_BIND_ADDR", "127.0.0.1:27701");
        let data_root = PathBuf::from(value_or_default(&lookup, "MNEMO_DATA_ROOT", "collections"));

        let default_account = match (
            optional_trimmed(&lookup, "MNEMO_DEFAULT_USER"),
            optional_trimmed(&lookup, "MNEMO_DEFAULT_PASSWORD"),
        ) {
            (Some(user), Some(password)) => Some((user, password)),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Invalid(
                    "MNEMO_DEFAULT_USER and MNEMO_DEFAULT_PASSWORD must be set together"
                        .to_string(),
                ))
            }
        };

        Ok(Self {
            bind_addr,
            data_root,
            default_account,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn config_falls_back_to_defaults() {
        let map: HashMap<&str, &str> = HashMap::new();
        let config =
            AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string())).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:27701");
        assert_eq!(config.data_root, PathBuf::from("collections"));
        assert!(config.default_account.is_none());
    }

    #[test]
    fn default_account_requires_both_variables() {
        let mut map = HashMap::new();
        map.insert("MNEMO_DEFAULT_USER", "alice");
        let err = AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("MNEMO_DEFAULT_PASSWORD"));
    }

    #[test]
    fn config_redacts_the_default_password() {
        let mut map = HashMap::new();
        map.insert("MNEMO_DEFAULT_USER", "alice");
        map.insert("MNEMO_DEFAULT_PASSWORD", "sensitive-password");
        let config =
            AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string())).unwrap();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-password"));
        assert!(debug_output.contains("alice"));
    }
}
