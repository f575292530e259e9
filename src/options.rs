//! Site option definitions and layered resolution.
//!
//! Layers, later wins per key: site defaults, config file, `--site-options` JSON,
//! then flags the user actually typed. No deep merge.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

pub type OptionMap = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum OptionError {
    #[error("Invalid --site-options JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("--site-options must be a JSON object, got {found}")]
    NotAnObject { found: String },
}

/// Value type of an option, used to build its CLI flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionKind {
    Bool,
    Int,
    Str,
    Choice(&'static [&'static str]),
}

/// One site-specific option.
#[derive(Debug, Clone)]
pub struct SiteOption {
    pub name: &'static str,
    /// Long flag without leading dashes.
    pub flag: &'static str,
    /// Long flag that sets a boolean option to false.
    pub negated_flag: Option<&'static str>,
    pub kind: OptionKind,
    pub default: Value,
    pub help: &'static str,
    /// Hidden options are only settable through config or JSON.
    pub exposed: bool,
}

impl SiteOption {
    pub fn boolean(name: &'static str, flag: &'static str, default: bool, help: &'static str) -> Self {
        Self {
            name,
            flag,
            negated_flag: None,
            kind: OptionKind::Bool,
            default: Value::Bool(default),
            help,
            exposed: true,
        }
    }

    pub fn int(name: &'static str, flag: &'static str, help: &'static str) -> Self {
        Self {
            name,
            flag,
            negated_flag: None,
            kind: OptionKind::Int,
            default: Value::Null,
            help,
            exposed: true,
        }
    }

    pub fn string(name: &'static str, flag: &'static str, help: &'static str) -> Self {
        Self {
            name,
            flag,
            negated_flag: None,
            kind: OptionKind::Str,
            default: Value::Null,
            help,
            exposed: true,
        }
    }

    pub fn choice(
        name: &'static str,
        flag: &'static str,
        choices: &'static [&'static str],
        default: &'static str,
        help: &'static str,
    ) -> Self {
        Self {
            name,
            flag,
            negated_flag: None,
            kind: OptionKind::Choice(choices),
            default: Value::String(default.to_string()),
            help,
            exposed: true,
        }
    }

    pub fn negated(mut self, flag: &'static str) -> Self {
        self.negated_flag = Some(flag);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.exposed = false;
        self
    }
}

/// Default value of every option, keyed by name.
pub fn defaults_for(defs: &[SiteOption]) -> OptionMap {
    defs.iter()
        .map(|d| (d.name.to_string(), d.default.clone()))
        .collect()
}

/// First definition of each name wins. Sites share base options, so the CLI sees each once.
pub fn dedup_defs<I>(defs: I) -> Vec<SiteOption>
where
    I: IntoIterator<Item = SiteOption>,
{
    let mut seen = HashSet::new();
    defs.into_iter().filter(|d| seen.insert(d.name)).collect()
}

/// Parse the `--site-options` override. Must be a JSON object.
pub fn parse_overrides(json: &str) -> Result<OptionMap, OptionError> {
    let value: Value = serde_json::from_str(json)?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(OptionError::NotAnObject {
            found: json_kind(&other).to_string(),
        }),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// The four layers feeding one run's options.
#[derive(Debug, Clone, Default)]
pub struct OptionLayers {
    pub defaults: OptionMap,
    pub config: OptionMap,
    pub overrides: OptionMap,
    /// Only flags explicitly present on the command line.
    pub flags: OptionMap,
}

impl OptionLayers {
    pub fn resolve(&self) -> ResolvedOptions {
        let mut merged = OptionMap::new();
        for layer in [&self.defaults, &self.config, &self.overrides, &self.flags] {
            for (k, v) in layer {
                merged.insert(k.clone(), v.clone());
            }
        }
        ResolvedOptions(merged)
    }
}

/// Final options handed to a site, with typed accessors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedOptions(pub OptionMap);

impl ResolvedOptions {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Missing or non-boolean values read as `default`.
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn as_map(&self) -> &OptionMap {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> OptionMap {
        match v {
            Value::Object(m) => m.into_iter().collect(),
            _ => OptionMap::new(),
        }
    }

    #[test]
    fn later_layers_win_per_key() {
        let layers = OptionLayers {
            defaults: map(json!({"a": 1, "b": 2})),
            config: map(json!({"a": 5})),
            overrides: map(json!({"b": 3})),
            flags: OptionMap::new(),
        };
        let resolved = layers.resolve();
        assert_eq!(resolved.as_map(), &map(json!({"a": 5, "b": 3})));
    }

    #[test]
    fn flags_beat_everything_and_do_not_deep_merge() {
        let layers = OptionLayers {
            defaults: map(json!({"nested": {"x": 1, "y": 2}})),
            config: OptionMap::new(),
            overrides: map(json!({"nested": {"x": 9}})),
            flags: map(json!({"limit": 4})),
        };
        let resolved = layers.resolve();
        assert_eq!(resolved.get("nested"), Some(&json!({"x": 9})));
        assert_eq!(resolved.int("limit"), Some(4));
    }

    #[test]
    fn overrides_must_be_an_object() {
        assert!(parse_overrides(r#"{"offset": 2}"#).is_ok());
        assert!(matches!(
            parse_overrides("[1, 2]"),
            Err(OptionError::NotAnObject { .. })
        ));
        assert!(matches!(
            parse_overrides("{"),
            Err(OptionError::InvalidJson(_))
        ));
    }

    #[test]
    fn dedup_keeps_first_definition() {
        let defs = dedup_defs(vec![
            SiteOption::boolean("strip_colors", "strip-colors", true, "first"),
            SiteOption::int("offset", "offset", "skip chapters"),
            SiteOption::boolean("strip_colors", "strip-colors", false, "second"),
        ]);
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].help, "first");
        assert_eq!(defaults_for(&defs).get("strip_colors"), Some(&json!(true)));
    }

    #[test]
    fn typed_accessors() {
        let opts = ResolvedOptions(map(json!({"on": true, "n": "7", "s": "skip"})));
        assert!(opts.bool_or("on", false));
        assert!(!opts.bool_or("missing", false));
        assert_eq!(opts.int("n"), Some(7));
        assert_eq!(opts.str("s"), Some("skip"));
        assert_eq!(opts.int("s"), None);
    }
}
