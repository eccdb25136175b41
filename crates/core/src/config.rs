//! Filter configuration and normalization
//!
//! Each filter kind declares a typed schema with defaults. [`normalize`]
//! overlays, in order of increasing precedence: schema defaults,
//! environment variables (`FILTER_` plus the kind-specific prefix), the
//! user-supplied mapping, and per-endpoint option overrides parsed by the
//! endpoint DSL. The result is a frozen config or a `ConfigError` naming
//! the offending field.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::endpoint::{self, Output, Source};
use crate::{Error, Result};

/// Environment prefix recognized for every filter kind
pub const ENV_PREFIX: &str = "FILTER_";

/// How the synchronizer assembles ticks for a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Deliver as soon as any subscribed topic has a frame pending
    #[default]
    Loose,
    /// Deliver only when every non-ephemeral topic has a frame pending
    Strict,
    /// Align frames by `meta.id` across non-ephemeral topics
    ById,
}

impl SyncMode {
    /// Case-insensitive parse of `loose`, `strict` or `by_id`
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "loose" => Ok(SyncMode::Loose),
            "strict" => Ok(SyncMode::Strict),
            "by_id" | "byid" => Ok(SyncMode::ById),
            other => Err(Error::config_field(
                "sync",
                format!("unknown sync mode {other:?}"),
            )),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        SyncMode::parse(s)
    }
}

/// Fully resolved runtime configuration for one filter instance.
///
/// Frozen after [`normalize`]; the `extra` mapping carries kind-specific
/// keys through to the user `setup` hook untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Immutable filter id
    pub id: String,
    /// Filter kind name (used for the env prefix and logging)
    pub kind: String,
    /// Parsed inbound endpoints
    pub sources: Vec<Source>,
    /// Parsed outbound endpoints
    pub outputs: Vec<Output>,
    /// Default synchronization mode (per-source options may override)
    pub sync: SyncMode,
    /// By-id alignment expiry window, milliseconds
    pub window_ms: u64,
    /// Default per-consumer outbox depth on this filter's outputs
    pub outbox: usize,
    /// Exit when every non-ephemeral source reports end-of-stream
    pub propagate_eos: bool,
    /// On termination, stop siblings that obey
    pub propagate_exit: bool,
    /// Accept stop from terminating siblings that propagate
    pub obey_exit: bool,
    /// Count toward the launcher's "pipeline done" quorum
    pub stop_exit: bool,
    /// Drain deadline after a stop signal, milliseconds
    pub drain_deadline_ms: u64,
    /// Kind-specific keys passed through to `setup`
    pub extra: Map<String, Value>,
}

impl FilterConfig {
    /// Drain deadline as a [`Duration`]
    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }

    /// Effective sync mode for one source (option override wins)
    pub fn source_sync(&self, source: &Source) -> SyncMode {
        source.options.sync.unwrap_or(self.sync)
    }

    /// Effective by-id window for one source
    pub fn source_window(&self, source: &Source) -> Duration {
        Duration::from_millis(source.options.window_ms.unwrap_or(self.window_ms))
    }
}

/// Keys consumed by the runtime itself; everything else lands in `extra`
const RUNTIME_KEYS: &[&str] = &[
    "id",
    "sources",
    "outputs",
    "sync",
    "window_ms",
    "outbox",
    "propagate_eos",
    "propagate_exit",
    "obey_exit",
    "stop_exit",
    "drain_deadline_ms",
];

/// Resolve a filter's runtime configuration.
///
/// `kind` also selects the environment prefix: for kind `Detector`, both
/// `FILTER_OUTBOX` and `DETECTOR_OUTBOX` are honored, the latter winning.
pub fn normalize(kind: &str, user: Map<String, Value>) -> Result<FilterConfig> {
    let mut merged: Map<String, Value> = Map::new();

    // defaults
    merged.insert("sync".into(), Value::from("loose"));
    merged.insert("window_ms".into(), Value::from(2_000u64));
    merged.insert("outbox".into(), Value::from(32u64));
    merged.insert("propagate_eos".into(), Value::from(true));
    merged.insert("propagate_exit".into(), Value::from(false));
    merged.insert("obey_exit".into(), Value::from(false));
    merged.insert("drain_deadline_ms".into(), Value::from(10_000u64));

    // environment overlay, generic prefix first so the kind prefix wins
    let kind_prefix = format!("{}_", kind.to_ascii_uppercase());
    for key in RUNTIME_KEYS {
        for prefix in [ENV_PREFIX, kind_prefix.as_str()] {
            let var = format!("{prefix}{}", key.to_ascii_uppercase());
            if let Ok(raw) = std::env::var(&var) {
                merged.insert((*key).to_string(), Value::from(raw));
            }
        }
    }

    // user-supplied mapping
    for (key, value) in user {
        merged.insert(key, value);
    }

    let id = match merged.remove("id") {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(other) => {
            return Err(Error::config_field("id", format!("expected string, got {other}")))
        }
        None => kind.to_string(),
    };

    let sources = parse_endpoint_field(&mut merged, "sources", endpoint::parse_sources, |items| {
        endpoint::parse_sources_list(items)
    })?;
    let outputs = parse_endpoint_field(&mut merged, "outputs", endpoint::parse_outputs, |items| {
        endpoint::parse_outputs_list(items)
    })?;

    let sync = match merged.remove("sync") {
        Some(v) => SyncMode::parse(&string_of("sync", v)?)?,
        None => SyncMode::Loose,
    };
    let window_ms = take_u64(&mut merged, "window_ms", 2_000)?;
    let outbox = take_u64(&mut merged, "outbox", 32)? as usize;
    if outbox == 0 {
        return Err(Error::config_field("outbox", "must be at least 1"));
    }
    let propagate_eos = take_bool(&mut merged, "propagate_eos", true)?;
    let propagate_exit = take_bool(&mut merged, "propagate_exit", false)?;
    let obey_exit = take_bool(&mut merged, "obey_exit", false)?;
    // a terminating propagator also satisfies the pipeline-done quorum
    // unless explicitly configured otherwise
    let stop_exit = take_bool(&mut merged, "stop_exit", propagate_exit)?;
    let drain_deadline_ms = take_u64(&mut merged, "drain_deadline_ms", 10_000)?;

    Ok(FilterConfig {
        id,
        kind: kind.to_string(),
        sources,
        outputs,
        sync,
        window_ms,
        outbox,
        propagate_eos,
        propagate_exit,
        obey_exit,
        stop_exit,
        drain_deadline_ms,
        extra: merged,
    })
}

fn parse_endpoint_field<T>(
    merged: &mut Map<String, Value>,
    field: &str,
    parse_str: impl Fn(&str) -> Result<Vec<T>>,
    parse_list: impl Fn(Vec<String>) -> Result<Vec<T>>,
) -> Result<Vec<T>> {
    match merged.remove(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(Vec::new()),
        Some(Value::String(s)) => parse_str(&s),
        Some(Value::Array(items)) => {
            let mut specs = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => specs.push(s),
                    other => {
                        return Err(Error::config_field(
                            field,
                            format!("expected string entries, got {other}"),
                        ))
                    }
                }
            }
            parse_list(specs)
        }
        Some(other) => Err(Error::config_field(
            field,
            format!("expected string or list, got {other}"),
        )),
    }
}

fn string_of(field: &str, v: Value) -> Result<String> {
    match v {
        Value::String(s) => Ok(s),
        other => Err(Error::config_field(
            field,
            format!("expected string, got {other}"),
        )),
    }
}

fn take_bool(merged: &mut Map<String, Value>, field: &str, default: bool) -> Result<bool> {
    match merged.remove(field) {
        None => Ok(default),
        Some(Value::Bool(b)) => Ok(b),
        Some(Value::String(s)) => {
            coerce_bool(&s).map_err(|_| Error::config_field(field, format!("not a boolean: {s:?}")))
        }
        Some(Value::Number(n)) => Ok(n.as_i64().map(|v| v != 0).unwrap_or(default)),
        Some(other) => Err(Error::config_field(
            field,
            format!("not a boolean: {other}"),
        )),
    }
}

fn take_u64(merged: &mut Map<String, Value>, field: &str, default: u64) -> Result<u64> {
    match merged.remove(field) {
        None => Ok(default),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| Error::config_field(field, format!("not a non-negative integer: {n}"))),
        Some(Value::String(s)) => match coerce_number(&s)? {
            Value::Number(n) => n.as_u64().ok_or_else(|| {
                Error::config_field(field, format!("not a non-negative integer: {s:?}"))
            }),
            _ => Err(Error::config_field(field, format!("not a number: {s:?}"))),
        },
        Some(other) => Err(Error::config_field(field, format!("not a number: {other}"))),
    }
}

/// Case-insensitive boolean coercion: `true/false/1/0/yes/no`
pub fn coerce_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(Error::config("invalid-field", format!("not a boolean: {other:?}"))),
    }
}

/// Numeric coercion with `k`/`M` unit suffixes (e.g. bitrates: `2M`, `500k`)
pub fn coerce_number(raw: &str) -> Result<Value> {
    let s = raw.trim();
    let (body, multiplier) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1_000f64),
        Some('M') => (&s[..s.len() - 1], 1_000_000f64),
        _ => (s, 1f64),
    };
    if multiplier == 1f64 {
        if let Ok(i) = body.parse::<i64>() {
            return Ok(Value::from(i));
        }
    } else if let Ok(i) = body.parse::<i64>() {
        return Ok(Value::from(i * multiplier as i64));
    }
    let f: f64 = body
        .parse()
        .map_err(|_| Error::config("invalid-field", format!("not a number: {raw:?}")))?;
    let scaled = f * multiplier;
    if scaled.fract() == 0.0 && scaled.abs() < i64::MAX as f64 {
        Ok(Value::from(scaled as i64))
    } else {
        Ok(Value::from(scaled))
    }
}

/// Case-insensitive enum coercion against declared variants
pub fn coerce_enum<'a>(raw: &str, variants: &[&'a str]) -> Result<&'a str> {
    let lower = raw.trim().to_ascii_lowercase();
    variants
        .iter()
        .find(|v| v.to_ascii_lowercase() == lower)
        .copied()
        .ok_or_else(|| {
            Error::config(
                "invalid-field",
                format!("{raw:?} not one of {variants:?}"),
            )
        })
}

/// Comma-separated or explicit list coercion, entries trimmed
pub fn coerce_list(value: &Value) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()),
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.trim().to_string()),
                other => Err(Error::config(
                    "invalid-field",
                    format!("expected string entries, got {other}"),
                )),
            })
            .collect(),
        other => Err(Error::config(
            "invalid-field",
            format!("expected string or list, got {other}"),
        )),
    }
}

/// Resolve a filter's runtime configuration and validate its
/// kind-specific keys against a declared schema.
///
/// The runtime keys are handled exactly as [`normalize`]; everything
/// that would land in `extra` goes through the schema's coercion and
/// strictness rules first.
pub fn normalize_with_schema(
    kind: &str,
    user: Map<String, Value>,
    schema: &ConfigSchema,
) -> Result<FilterConfig> {
    let mut config = normalize(kind, user)?;
    config.extra = schema.normalize(&config.extra)?;
    Ok(config)
}

/// Field type for kind-specific schemas
#[derive(Debug, Clone)]
pub enum FieldType {
    /// Boolean with the usual spellings
    Bool,
    /// Integer, `k`/`M` suffixes accepted
    Int,
    /// Float, `k`/`M` suffixes accepted
    Float,
    /// Free-form string
    Str,
    /// One of the declared variants, case-insensitive
    Enum(Vec<String>),
    /// Comma-separated or explicit list of strings
    List,
    /// Arbitrary JSON, passed through
    Json,
}

/// One declared config field
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Key name
    pub name: String,
    /// Expected type
    pub ty: FieldType,
    /// Default when absent everywhere
    pub default: Option<Value>,
}

impl FieldSpec {
    /// Declare a field
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        FieldSpec {
            name: name.into(),
            ty,
            default: None,
        }
    }

    /// Attach a default value
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Declarative schema for a filter kind's `extra` configuration
#[derive(Debug, Clone)]
pub struct ConfigSchema {
    /// Kind name, used for env prefixing and messages
    pub kind: String,
    /// Fail on unknown keys instead of warning
    pub strict: bool,
    /// Declared fields
    pub fields: Vec<FieldSpec>,
}

impl ConfigSchema {
    /// Schema accepting any keys (warn-only)
    pub fn new(kind: impl Into<String>) -> Self {
        ConfigSchema {
            kind: kind.into(),
            strict: false,
            fields: Vec::new(),
        }
    }

    /// Reject unknown keys
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Declare a field
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Coerce and validate a kind-specific config mapping.
    ///
    /// Precedence inside this schema: declared defaults, then
    /// `{KIND}_{FIELD}` environment variables, then the supplied mapping.
    /// Unknown keys warn, or fail when the schema is strict.
    pub fn normalize(&self, user: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        let known: BTreeMap<&str, &FieldSpec> =
            self.fields.iter().map(|f| (f.name.as_str(), f)).collect();

        for spec in &self.fields {
            if let Some(default) = &spec.default {
                out.insert(spec.name.clone(), default.clone());
            }
            let var = format!(
                "{}_{}",
                self.kind.to_ascii_uppercase(),
                spec.name.to_ascii_uppercase()
            );
            if let Ok(raw) = std::env::var(&var) {
                out.insert(spec.name.clone(), self.coerce(spec, &Value::from(raw))?);
            }
        }

        for (key, value) in user {
            match known.get(key.as_str()) {
                Some(spec) => {
                    out.insert(key.clone(), self.coerce(spec, value)?);
                }
                None if self.strict => {
                    return Err(Error::config_field(
                        key.clone(),
                        format!("unknown key for strict kind {}", self.kind),
                    ));
                }
                None => {
                    tracing::warn!(kind = %self.kind, key = %key, "unknown config key");
                    out.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(out)
    }

    fn coerce(&self, spec: &FieldSpec, value: &Value) -> Result<Value> {
        let fail = |v: &Value| {
            Err(Error::config_field(
                spec.name.clone(),
                format!("cannot coerce {v} to {:?}", spec.ty),
            ))
        };
        match (&spec.ty, value) {
            (FieldType::Json, v) => Ok(v.clone()),
            (FieldType::Bool, Value::Bool(b)) => Ok(Value::from(*b)),
            (FieldType::Bool, Value::String(s)) => coerce_bool(s)
                .map(Value::from)
                .map_err(|_| Error::config_field(spec.name.clone(), format!("not a boolean: {s:?}"))),
            (FieldType::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            (FieldType::Int, Value::String(s)) => match coerce_number(s)? {
                v @ Value::Number(_) if v.as_i64().is_some() || v.as_u64().is_some() => Ok(v),
                _ => fail(value),
            },
            (FieldType::Float, Value::Number(_)) => Ok(value.clone()),
            (FieldType::Float, Value::String(s)) => coerce_number(s),
            (FieldType::Str, Value::String(_)) => Ok(value.clone()),
            (FieldType::Enum(variants), Value::String(s)) => {
                let refs: Vec<&str> = variants.iter().map(String::as_str).collect();
                coerce_enum(s, &refs)
                    .map(Value::from)
                    .map_err(|e| Error::config_field(spec.name.clone(), e.to_string()))
            }
            (FieldType::List, v) => coerce_list(v).map(|items| {
                Value::Array(items.into_iter().map(Value::from).collect())
            }),
            _ => fail(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_normalize_defaults() {
        let cfg = normalize("Detector", Map::new()).unwrap();
        assert_eq!(cfg.id, "Detector");
        assert_eq!(cfg.sync, SyncMode::Loose);
        assert_eq!(cfg.window_ms, 2_000);
        assert!(cfg.propagate_eos);
        assert!(!cfg.propagate_exit);
        assert!(!cfg.obey_exit);
        assert!(!cfg.stop_exit);
        assert_eq!(cfg.drain_deadline_ms, 10_000);
    }

    #[test]
    fn test_stop_exit_follows_propagate_exit() {
        let cfg = normalize("Src", map(json!({ "propagate_exit": true }))).unwrap();
        assert!(cfg.stop_exit);
        let cfg = normalize(
            "Src",
            map(json!({ "propagate_exit": true, "stop_exit": false })),
        )
        .unwrap();
        assert!(!cfg.stop_exit);
    }

    #[test]
    fn test_sources_string_and_list() {
        let cfg = normalize(
            "F",
            map(json!({ "sources": "tcp://a:1;x,tcp://b:2" })),
        )
        .unwrap();
        assert_eq!(cfg.sources.len(), 2);
        let cfg = normalize(
            "F",
            map(json!({ "sources": ["tcp://a:1", "tcp://b:2?"] })),
        )
        .unwrap();
        assert_eq!(cfg.sources.len(), 2);
        assert!(cfg.sources[1].ephemerality.is_ephemeral());
    }

    #[test]
    fn test_string_coercions_from_env_style_values() {
        let cfg = normalize(
            "F",
            map(json!({
                "outbox": "64",
                "propagate_eos": "No",
                "window_ms": "1500",
            })),
        )
        .unwrap();
        assert_eq!(cfg.outbox, 64);
        assert!(!cfg.propagate_eos);
        assert_eq!(cfg.window_ms, 1_500);
    }

    #[test]
    fn test_extra_keys_pass_through() {
        let cfg = normalize("F", map(json!({ "model_path": "/m.onnx" }))).unwrap();
        assert_eq!(cfg.extra.get("model_path"), Some(&json!("/m.onnx")));
    }

    #[test]
    fn test_number_suffixes() {
        assert_eq!(coerce_number("500k").unwrap(), json!(500_000));
        assert_eq!(coerce_number("2M").unwrap(), json!(2_000_000));
        assert_eq!(coerce_number("1.5").unwrap(), json!(1.5));
        assert!(coerce_number("abc").is_err());
    }

    #[test]
    fn test_schema_strict_rejects_unknown() {
        let schema = ConfigSchema::new("Writer")
            .strict()
            .field(FieldSpec::new("path", FieldType::Str));
        let err = schema
            .normalize(&map(json!({ "paht": "/tmp/x" })))
            .unwrap_err();
        match err {
            Error::Config { field, .. } => assert_eq!(field.as_deref(), Some("paht")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_schema_enum_and_list() {
        let schema = ConfigSchema::new("Writer")
            .field(FieldSpec::new(
                "mode",
                FieldType::Enum(vec!["append".into(), "truncate".into()]),
            ))
            .field(FieldSpec::new("topics", FieldType::List));
        let out = schema
            .normalize(&map(json!({ "mode": "APPEND", "topics": "a, b ,c" })))
            .unwrap();
        assert_eq!(out.get("mode"), Some(&json!("append")));
        assert_eq!(out.get("topics"), Some(&json!(["a", "b", "c"])));
    }

    #[test]
    fn test_normalize_with_schema() {
        let schema = ConfigSchema::new("Writer")
            .strict()
            .field(FieldSpec::new("path", FieldType::Str))
            .field(FieldSpec::new("fps", FieldType::Float).with_default(30.0));
        let cfg = normalize_with_schema(
            "Writer",
            map(json!({ "outbox": 8, "path": "/tmp/out" })),
            &schema,
        )
        .unwrap();
        assert_eq!(cfg.outbox, 8);
        assert_eq!(cfg.extra.get("path"), Some(&json!("/tmp/out")));
        assert_eq!(cfg.extra.get("fps"), Some(&json!(30.0)));
        // runtime keys never reach the schema; unknown extras still fail
        assert!(normalize_with_schema(
            "Writer",
            map(json!({ "paht": "/tmp/out" })),
            &schema,
        )
        .is_err());
    }

    #[test]
    fn test_parse_serialize_round_trip() {
        let cfg = normalize(
            "F",
            map(json!({
                "sources": "tcp://a:1;cam>main!sync=strict",
                "outputs": "tcp://*:9000;main",
                "outbox": 8,
            })),
        )
        .unwrap();
        let json = serde_json::to_value(&cfg).unwrap();
        let back: FilterConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.outbox, cfg.outbox);
        assert_eq!(back.sources, cfg.sources);
        assert_eq!(back.outputs, cfg.outputs);
    }
}
