//! Compose-style variable interpolation
//!
//! Supports `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`,
//! `${VAR:?message}`, `${VAR?message}`, `${VAR:+alt}`, `${VAR+alt}` and
//! the `$$` escape. Unlike docker compose, a bare reference to an unset
//! variable is an error rather than an empty string.

use crate::error::{BerthError, Result};
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:(\$)|\{([^}]*)\}|([A-Za-z_][A-Za-z0-9_]*))").expect("static pattern")
    })
}

/// Accumulates failures across a whole document so every undefined
/// reference is reported at once.
#[derive(Default)]
struct Failures {
    undefined: BTreeSet<String>,
    required: Option<(String, String)>,
    malformed: Option<String>,
}

impl Failures {
    fn into_result(self) -> Result<()> {
        if let Some(expr) = self.malformed {
            return Err(BerthError::ComposeParse(format!(
                "Invalid interpolation format: ${{{}}}",
                expr
            )));
        }
        if let Some((name, message)) = self.required {
            return Err(BerthError::RequiredVariable { name, message });
        }
        if !self.undefined.is_empty() {
            return Err(BerthError::UndefinedVariables(
                self.undefined.into_iter().collect(),
            ));
        }
        Ok(())
    }
}

/// Interpolate a single string
pub fn interpolate_str(input: &str, env: &HashMap<String, String>) -> Result<String> {
    let mut failures = Failures::default();
    let out = substitute(input, env, &mut failures);
    failures.into_result()?;
    Ok(out)
}

/// Interpolate every string scalar of a YAML document in place. Mapping
/// keys are left alone.
pub fn interpolate_value(value: &mut Value, env: &HashMap<String, String>) -> Result<()> {
    let mut failures = Failures::default();
    walk(value, env, &mut failures);
    failures.into_result()
}

/// Variable names referenced by `input`, including those with defaults
pub fn references(input: &str) -> Vec<String> {
    let mut names = BTreeSet::new();
    for caps in pattern().captures_iter(input) {
        if let Some(name) = caps.get(3) {
            names.insert(name.as_str().to_string());
        } else if let Some(expr) = caps.get(2) {
            if let Some((name, _, _)) = split_expression(expr.as_str()) {
                names.insert(name.to_string());
            }
        }
    }
    names.into_iter().collect()
}

/// Variable names referenced anywhere in a YAML document
pub fn value_references(value: &Value) -> Vec<String> {
    let mut names = BTreeSet::new();
    collect_references(value, &mut names);
    names.into_iter().collect()
}

fn collect_references(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => names.extend(references(s)),
        Value::Sequence(seq) => seq.iter().for_each(|v| collect_references(v, names)),
        Value::Mapping(map) => map.iter().for_each(|(_, v)| collect_references(v, names)),
        Value::Tagged(tagged) => collect_references(&tagged.value, names),
        _ => {}
    }
}

fn walk(value: &mut Value, env: &HashMap<String, String>, failures: &mut Failures) {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                *s = substitute(s, env, failures);
            }
        }
        Value::Sequence(seq) => seq.iter_mut().for_each(|v| walk(v, env, failures)),
        Value::Mapping(map) => map.iter_mut().for_each(|(_, v)| walk(v, env, failures)),
        Value::Tagged(tagged) => walk(&mut tagged.value, env, failures),
        _ => {}
    }
}

/// Operator inside a braced expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    /// `${VAR}`
    Plain,
    /// `:-` when `colon`, else `-`
    Default { colon: bool },
    /// `:?` when `colon`, else `?`
    Required { colon: bool },
    /// `:+` when `colon`, else `+`
    Alternate { colon: bool },
}

fn split_expression(expr: &str) -> Option<(&str, Operator, &str)> {
    let name_end = expr
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(expr.len());
    let name = &expr[..name_end];
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }

    let rest = &expr[name_end..];
    if rest.is_empty() {
        return Some((name, Operator::Plain, ""));
    }

    let (colon, rest) = match rest.strip_prefix(':') {
        Some(r) => (true, r),
        None => (false, rest),
    };
    let mut chars = rest.chars();
    let op = match chars.next()? {
        '-' => Operator::Default { colon },
        '?' => Operator::Required { colon },
        '+' => Operator::Alternate { colon },
        _ => return None,
    };
    Some((name, op, chars.as_str()))
}

fn substitute(input: &str, env: &HashMap<String, String>, failures: &mut Failures) -> String {
    pattern()
        .replace_all(input, |caps: &Captures| {
            if caps.get(1).is_some() {
                return "$".to_string();
            }
            if let Some(name) = caps.get(3) {
                return lookup_plain(name.as_str(), env, failures);
            }

            let expr = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let Some((name, op, arg)) = split_expression(expr) else {
                failures.malformed.get_or_insert_with(|| expr.to_string());
                return String::new();
            };

            let value = env.get(name);
            let is_set = |colon: bool| match value {
                Some(v) => !colon || !v.is_empty(),
                None => false,
            };

            match op {
                Operator::Plain => lookup_plain(name, env, failures),
                Operator::Default { colon } => {
                    if is_set(colon) {
                        value.cloned().unwrap_or_default()
                    } else {
                        arg.to_string()
                    }
                }
                Operator::Required { colon } => {
                    if is_set(colon) {
                        value.cloned().unwrap_or_default()
                    } else {
                        failures
                            .required
                            .get_or_insert_with(|| (name.to_string(), arg.to_string()));
                        String::new()
                    }
                }
                Operator::Alternate { colon } => {
                    if is_set(colon) {
                        arg.to_string()
                    } else {
                        String::new()
                    }
                }
            }
        })
        .into_owned()
}

fn lookup_plain(name: &str, env: &HashMap<String, String>, failures: &mut Failures) -> String {
    match env.get(name) {
        Some(v) => v.clone(),
        None => {
            failures.undefined.insert(name.to_string());
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_plain_references() {
        let e = env(&[("REDIS_PASSWORD", "s3cret"), ("TAG", "1.0")]);
        assert_eq!(
            interpolate_str("redis-server --requirepass ${REDIS_PASSWORD}", &e).unwrap(),
            "redis-server --requirepass s3cret"
        );
        assert_eq!(interpolate_str("app:$TAG", &e).unwrap(), "app:1.0");
        assert_eq!(interpolate_str("cost $$5", &e).unwrap(), "cost $5");
    }

    #[test]
    fn test_undefined_reported_together() {
        let err = interpolate_str("${A} ${B} $A", &HashMap::new()).unwrap_err();
        match err {
            BerthError::UndefinedVariables(names) => assert_eq!(names, vec!["A", "B"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_defaults() {
        let e = env(&[("EMPTY", "")]);
        assert_eq!(interpolate_str("${MISSING:-x}", &e).unwrap(), "x");
        assert_eq!(interpolate_str("${EMPTY:-x}", &e).unwrap(), "x");
        assert_eq!(interpolate_str("${EMPTY-x}", &e).unwrap(), "");
        assert_eq!(interpolate_str("${MISSING-x}", &e).unwrap(), "x");
    }

    #[test]
    fn test_required_and_alternate() {
        let e = env(&[("SET", "v"), ("EMPTY", "")]);
        assert_eq!(interpolate_str("${SET:?need it}", &e).unwrap(), "v");
        let err = interpolate_str("${EMPTY:?password required}", &e).unwrap_err();
        assert!(err.to_string().contains("password required"));
        assert_eq!(interpolate_str("${EMPTY?x}", &e).unwrap(), "");
        assert_eq!(interpolate_str("${SET:+on}", &e).unwrap(), "on");
        assert_eq!(interpolate_str("${EMPTY:+on}", &e).unwrap(), "");
        assert_eq!(interpolate_str("${EMPTY+on}", &e).unwrap(), "on");
    }

    #[test]
    fn test_malformed_expression() {
        assert!(interpolate_str("${1BAD}", &HashMap::new()).is_err());
        assert!(interpolate_str("${A*b}", &HashMap::new()).is_err());
    }

    #[test]
    fn test_references() {
        assert_eq!(
            references("${A} $B ${C:-x} $$D ${E:?m}"),
            vec!["A", "B", "C", "E"]
        );
    }

    #[test]
    fn test_interpolate_document_leaves_keys() {
        let mut doc: Value = serde_yaml::from_str(
            r#"
services:
  cache:
    command: redis-server --requirepass ${REDIS_PASSWORD}
    ports: ["${PORT:-6379}:6379"]
"#,
        )
        .unwrap();
        let e = env(&[("REDIS_PASSWORD", "pw")]);
        interpolate_value(&mut doc, &e).unwrap();
        let cmd = &doc["services"]["cache"]["command"];
        assert_eq!(cmd.as_str(), Some("redis-server --requirepass pw"));
        assert_eq!(doc["services"]["cache"]["ports"][0].as_str(), Some("6379:6379"));
    }
}
