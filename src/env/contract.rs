//! Application settings contract
//!
//! The API process reads its settings from the shared env file. This is the
//! list of keys it expects, which ones have built-in defaults, and the shape
//! each value must have. Checking it before `up` turns a crash-looping app
//! container into an upfront error.

use crate::error::{BerthError, Result};
use serde::Serialize;
use std::collections::HashMap;

/// Value shape of a setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    Text,
    Integer,
    Boolean,
    Email,
    Url,
}

impl SettingKind {
    fn accepts(&self, value: &str) -> bool {
        match self {
            SettingKind::Text => true,
            SettingKind::Integer => value.trim().parse::<i64>().is_ok(),
            SettingKind::Boolean => matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "true" | "false" | "1" | "0" | "yes" | "no" | "on" | "off"
            ),
            SettingKind::Email => match value.split_once('@') {
                Some((user, domain)) => !user.is_empty() && domain.contains('.'),
                None => false,
            },
            SettingKind::Url => value
                .split_once("://")
                .map(|(scheme, rest)| !scheme.is_empty() && !rest.is_empty())
                .unwrap_or(false),
        }
    }
}

/// One expected setting
#[derive(Debug, Clone, Serialize)]
pub struct Setting {
    pub name: &'static str,
    pub kind: SettingKind,
    /// Built-in default; `None` means the key is required
    pub default: Option<&'static str>,
}

const fn required(name: &'static str, kind: SettingKind) -> Setting {
    Setting {
        name,
        kind,
        default: None,
    }
}

const fn optional(name: &'static str, kind: SettingKind, default: &'static str) -> Setting {
    Setting {
        name,
        kind,
        default: Some(default),
    }
}

/// Settings read by the contacts API
pub const APP_SETTINGS: &[Setting] = &[
    required("DB_URL", SettingKind::Url),
    required("JWT_SECRET", SettingKind::Text),
    optional("JWT_ALGORITHM", SettingKind::Text, "HS256"),
    optional("JWT_EXPIRATION_SECONDS", SettingKind::Integer, "3600"),
    optional("MAIL_USERNAME", SettingKind::Email, "example@meta.ua"),
    optional("MAIL_PASSWORD", SettingKind::Text, "secretPassword"),
    optional("MAIL_FROM", SettingKind::Email, "example@meta.ua"),
    optional("MAIL_PORT", SettingKind::Integer, "465"),
    optional("MAIL_SERVER", SettingKind::Text, "smtp.meta.ua"),
    optional("MAIL_FROM_NAME", SettingKind::Text, "Rest API Service"),
    optional("MAIL_STARTTLS", SettingKind::Boolean, "false"),
    optional("MAIL_SSL_TLS", SettingKind::Boolean, "true"),
    optional("USE_CREDENTIALS", SettingKind::Boolean, "true"),
    optional("VALIDATE_CERTS", SettingKind::Boolean, "true"),
    required("CLD_NAME", SettingKind::Text),
    optional("CLD_API_KEY", SettingKind::Integer, "111111111111111"),
    optional("CLD_API_SECRET", SettingKind::Text, "secret"),
    optional("REDIS_HOST", SettingKind::Text, "localhost"),
    // The app has a fallback, but the cache container refuses to start
    // without it, so the stack treats it as required.
    required("REDIS_PASSWORD", SettingKind::Text),
];

/// Outcome of checking an environment against a contract
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContractCheck {
    /// Required keys with no definition
    pub missing: Vec<String>,
    /// Keys whose value has the wrong shape, with the expected kind
    pub malformed: Vec<(String, SettingKind)>,
    /// Optional keys that fall back to their default
    pub defaulted: Vec<String>,
}

impl ContractCheck {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.malformed.is_empty()
    }

    /// Turn a failed check into an error
    pub fn into_result(self) -> Result<()> {
        if !self.missing.is_empty() {
            return Err(BerthError::UndefinedVariables(self.missing));
        }
        if let Some((name, kind)) = self.malformed.first() {
            return Err(BerthError::InvalidConfig(format!(
                "{} is not a valid {:?} value",
                name, kind
            )));
        }
        Ok(())
    }
}

/// Set of settings an environment must satisfy
#[derive(Debug, Clone)]
pub struct EnvContract {
    settings: Vec<Setting>,
}

impl Default for EnvContract {
    fn default() -> Self {
        Self::app()
    }
}

impl EnvContract {
    /// The contacts API contract
    pub fn app() -> Self {
        Self {
            settings: APP_SETTINGS.to_vec(),
        }
    }

    /// Contract from an explicit settings list
    pub fn new(settings: Vec<Setting>) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    /// Names of required settings
    pub fn required(&self) -> Vec<&'static str> {
        self.settings
            .iter()
            .filter(|s| s.default.is_none())
            .map(|s| s.name)
            .collect()
    }

    /// Check `env` against the contract. Empty values count as missing for
    /// required keys. A key that is present overrides its default, so an
    /// empty optional value must still have the setting's shape.
    pub fn check(&self, env: &HashMap<String, String>) -> ContractCheck {
        let mut report = ContractCheck::default();

        for setting in &self.settings {
            match (env.get(setting.name), setting.default) {
                (None, Some(_)) => report.defaulted.push(setting.name.to_string()),
                (None, None) => report.missing.push(setting.name.to_string()),
                (Some(value), None) if value.is_empty() => {
                    report.missing.push(setting.name.to_string())
                }
                (Some(value), _) => {
                    if !setting.kind.accepts(value) {
                        report.malformed.push((setting.name.to_string(), setting.kind));
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_env() -> HashMap<String, String> {
        [
            ("DB_URL", "postgresql+asyncpg://postgres:pw@postgres:5432/contacts"),
            ("JWT_SECRET", "secret"),
            ("CLD_NAME", "cloud"),
            ("REDIS_PASSWORD", "pw"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_complete_env_passes() {
        let check = EnvContract::app().check(&full_env());
        assert!(check.is_ok(), "{check:?}");
        assert!(check.defaulted.contains(&"JWT_ALGORITHM".to_string()));
        assert!(check.into_result().is_ok());
    }

    #[test]
    fn test_empty_env_lists_required_keys() {
        let check = EnvContract::app().check(&HashMap::new());
        assert_eq!(
            check.missing,
            vec!["DB_URL", "JWT_SECRET", "CLD_NAME", "REDIS_PASSWORD"]
        );
        assert!(matches!(
            check.into_result(),
            Err(BerthError::UndefinedVariables(_))
        ));
    }

    #[test]
    fn test_malformed_values() {
        let mut env = full_env();
        env.insert("MAIL_PORT".to_string(), "smtp".to_string());
        env.insert("MAIL_SSL_TLS".to_string(), "maybe".to_string());
        env.insert("DB_URL".to_string(), "localhost".to_string());
        env.insert("MAIL_FROM".to_string(), "nobody".to_string());

        let check = EnvContract::app().check(&env);
        let names: Vec<&str> = check.malformed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["DB_URL", "MAIL_FROM", "MAIL_PORT", "MAIL_SSL_TLS"]);
        assert!(check.into_result().is_err());
    }

    #[test]
    fn test_empty_optional_values() {
        let mut env = full_env();
        env.insert("MAIL_PORT".to_string(), String::new());
        env.insert("MAIL_FROM".to_string(), String::new());
        env.insert("MAIL_SERVER".to_string(), String::new());

        let check = EnvContract::app().check(&env);
        let names: Vec<&str> = check.malformed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["MAIL_FROM", "MAIL_PORT"]);
        // an empty text value is a value, not a fallback to the default
        assert!(!check.defaulted.contains(&"MAIL_SERVER".to_string()));
        assert!(!check.defaulted.contains(&"MAIL_PORT".to_string()));
        assert!(check.missing.is_empty());
    }

    #[test]
    fn test_required_names() {
        assert_eq!(
            EnvContract::app().required(),
            vec!["DB_URL", "JWT_SECRET", "CLD_NAME", "REDIS_PASSWORD"]
        );
    }
}
