//! Endpoint DSL parser
//!
//! Tokenizes source/output declarations into structured [`Source`] and
//! [`Output`] records. The grammar:
//!
//! ```text
//! endpoints   = endpoint ("," endpoint)*
//! endpoint    = uri [";" topic_map] ("!" option)*
//! uri         = scheme "://" authority [path] ["?" query]
//! topic_map   = topic_spec (";" topic_spec)*
//! topic_spec  = [src_topic ">"] dst_topic | "*"
//! option      = key ["=" value]
//! ```
//!
//! Ephemerality markers trail the authority: `?` marks an ephemeral
//! consumer (no flow control), `??` a doubly-ephemeral one (upstream is
//! not even told it exists). Topic `main` is implicit when no mapping is
//! given. Unknown option keys are preserved; recognized keys are
//! type-checked.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::SyncMode;
use crate::{Error, Result};

/// Wildcard topic matching every topic from a source
pub const TOPIC_WILDCARD: &str = "*";

/// Default topic when a mapping names none
pub const TOPIC_MAIN: &str = "main";

/// Flow-control participation of a source endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ephemerality {
    /// Full participant: handshakes and applies backpressure
    #[default]
    None,
    /// Joins without flow control; may lose frames (`?`)
    Ephemeral,
    /// Silent consumer upstream never learns about (`??`)
    DoublyEphemeral,
}

impl Ephemerality {
    /// Whether this consumer is exempt from backpressure
    pub fn is_ephemeral(&self) -> bool {
        !matches!(self, Ephemerality::None)
    }
}

/// A topic subscription or rewrite: `src>dst`, bare `dst`, or `*`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMap {
    /// Topic as published upstream (or produced locally, for outputs)
    pub src: String,
    /// Topic as seen by this filter (or published downstream)
    pub dst: String,
}

impl TopicMap {
    /// Identity mapping for a topic
    pub fn bare(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        TopicMap {
            src: topic.clone(),
            dst: topic,
        }
    }

    /// Whether this map consumes every topic
    pub fn is_wildcard(&self) -> bool {
        self.src == TOPIC_WILDCARD
    }

    /// Destination topic for an observed source topic, if matched
    pub fn apply(&self, topic: &str) -> Option<String> {
        if self.is_wildcard() {
            Some(topic.to_string())
        } else if self.src == topic {
            Some(self.dst.clone())
        } else {
            None
        }
    }
}

impl fmt::Display for TopicMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.src == self.dst {
            write!(f, "{}", self.dst)
        } else {
            write!(f, "{}>{}", self.src, self.dst)
        }
    }
}

/// A URI split into scheme and remainder.
///
/// Wire endpoints (`tcp://`) expose `host_port`; external schemes stay
/// opaque and are routed to collaborator plugins untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Full URI without markers or options
    pub uri: String,
    /// Lowercased scheme
    pub scheme: String,
    /// Everything after `://`
    pub rest: String,
}

impl Endpoint {
    /// Whether this endpoint is carried by the built-in wire transport
    pub fn is_wire(&self) -> bool {
        self.scheme == "tcp"
    }

    /// Host and port of a wire endpoint. `*` binds every interface.
    pub fn host_port(&self) -> Result<(String, u16)> {
        let (host, port) = self.rest.rsplit_once(':').ok_or_else(|| {
            Error::config(
                "malformed-endpoint",
                format!("{}: wire endpoint requires host:port", self.uri),
            )
        })?;
        let port: u16 = port.parse().map_err(|_| {
            Error::config(
                "malformed-endpoint",
                format!("{}: invalid port {port:?}", self.uri),
            )
        })?;
        let host = if host == "*" { "0.0.0.0" } else { host };
        Ok((host.to_string(), port))
    }
}

/// Per-endpoint options: recognized keys are typed, the rest preserved
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointOptions {
    /// Per-consumer outbox depth override
    pub outbox: Option<usize>,
    /// Synchronization mode override for this source
    pub sync: Option<SyncMode>,
    /// By-id expiry window override, milliseconds
    pub window_ms: Option<u64>,
    /// Whether end-of-stream from this source propagates filter exit
    pub propagate_eos: Option<bool>,
    /// Connect timeout override, milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Unrecognized keys, preserved for external collaborators
    pub extra: BTreeMap<String, Option<String>>,
}

/// An inbound endpoint declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Where to connect
    pub endpoint: Endpoint,
    /// Subscribed topics with optional remaps; never empty after parsing
    pub topics: Vec<TopicMap>,
    /// Flow-control participation
    pub ephemerality: Ephemerality,
    /// Per-source option overrides
    pub options: EndpointOptions,
}

/// An outbound endpoint declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    /// Where to bind
    pub endpoint: Endpoint,
    /// Published topics with optional rewrites; never empty after parsing
    pub topics: Vec<TopicMap>,
    /// Per-output option overrides
    pub options: EndpointOptions,
}

/// Parse a comma-separated source declaration string.
///
/// Order is preserved; duplicate URIs with different options are distinct
/// sources.
pub fn parse_sources(spec: &str) -> Result<Vec<Source>> {
    chunks(spec)
        .map(|(pos, chunk)| parse_source(chunk, pos))
        .collect()
}

/// Parse sources given as an explicit list
pub fn parse_sources_list<I, S>(specs: I) -> Result<Vec<Source>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for spec in specs {
        out.extend(parse_sources(spec.as_ref())?);
    }
    Ok(out)
}

/// Parse a comma-separated output declaration string
pub fn parse_outputs(spec: &str) -> Result<Vec<Output>> {
    chunks(spec)
        .map(|(pos, chunk)| parse_output(chunk, pos))
        .collect()
}

/// Parse outputs given as an explicit list
pub fn parse_outputs_list<I, S>(specs: I) -> Result<Vec<Output>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for spec in specs {
        out.extend(parse_outputs(spec.as_ref())?);
    }
    Ok(out)
}

/// Split on commas, tracking the byte offset of each chunk
fn chunks(spec: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0usize;
    spec.split(',').map(move |raw| {
        let start = offset;
        offset += raw.len() + 1;
        let trimmed = raw.trim();
        let lead = raw.len() - raw.trim_start().len();
        (start + lead, trimmed)
    })
}

fn parse_source(chunk: &str, pos: usize) -> Result<Source> {
    let parts = split_endpoint(chunk, pos)?;
    let (endpoint, ephemerality) = parse_uri(parts.uri, pos)?;
    let topics = parse_topic_specs(&parts.topic_specs, pos)?;
    let options = parse_options(&parts.options, pos)?;
    Ok(Source {
        endpoint,
        topics,
        ephemerality,
        options,
    })
}

fn parse_output(chunk: &str, pos: usize) -> Result<Output> {
    let parts = split_endpoint(chunk, pos)?;
    let (endpoint, ephemerality) = parse_uri(parts.uri, pos)?;
    if ephemerality != Ephemerality::None {
        return Err(Error::malformed_endpoint(
            pos,
            format!("{chunk}: ephemerality markers only apply to sources"),
        ));
    }
    let topics = parse_topic_specs(&parts.topic_specs, pos)?;
    let options = parse_options(&parts.options, pos)?;
    Ok(Output {
        endpoint,
        topics,
        options,
    })
}

struct EndpointParts<'a> {
    uri: &'a str,
    topic_specs: Vec<&'a str>,
    options: Vec<&'a str>,
}

fn split_endpoint(chunk: &str, pos: usize) -> Result<EndpointParts<'_>> {
    if chunk.is_empty() {
        return Err(Error::malformed_endpoint(pos, "empty endpoint"));
    }
    let mut bang = chunk.split('!');
    let head = bang.next().unwrap_or_default();
    let options: Vec<&str> = bang.collect();
    let mut semi = head.split(';');
    let uri = semi.next().unwrap_or_default().trim();
    let topic_specs: Vec<&str> = semi.map(str::trim).collect();
    if uri.is_empty() {
        return Err(Error::malformed_endpoint(pos, format!("{chunk}: missing URI")));
    }
    Ok(EndpointParts {
        uri,
        topic_specs,
        options,
    })
}

fn parse_uri(uri: &str, pos: usize) -> Result<(Endpoint, Ephemerality)> {
    let (core, ephemerality) = if let Some(stripped) = uri.strip_suffix("??") {
        (stripped, Ephemerality::DoublyEphemeral)
    } else if let Some(stripped) = uri.strip_suffix('?') {
        // a bare trailing '?' is a marker; '?key=value' queries keep theirs
        (stripped, Ephemerality::Ephemeral)
    } else {
        (uri, Ephemerality::None)
    };

    let (scheme, rest) = core.split_once("://").ok_or_else(|| {
        Error::malformed_endpoint(pos, format!("{uri}: expected scheme://authority"))
    })?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
        return Err(Error::malformed_endpoint(
            pos,
            format!("{uri}: invalid scheme {scheme:?}"),
        ));
    }
    if rest.is_empty() {
        return Err(Error::malformed_endpoint(
            pos,
            format!("{uri}: missing authority"),
        ));
    }
    let scheme = scheme.to_ascii_lowercase();
    Ok((
        Endpoint {
            uri: format!("{scheme}://{rest}"),
            scheme,
            rest: rest.to_string(),
        },
        ephemerality,
    ))
}

fn parse_topic_specs(specs: &[&str], pos: usize) -> Result<Vec<TopicMap>> {
    if specs.is_empty() {
        return Ok(vec![TopicMap::bare(TOPIC_MAIN)]);
    }
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        if *spec == TOPIC_WILDCARD {
            out.push(TopicMap {
                src: TOPIC_WILDCARD.into(),
                dst: TOPIC_WILDCARD.into(),
            });
            continue;
        }
        let (src, dst) = match spec.split_once('>') {
            Some((src, dst)) => (src.trim(), dst.trim()),
            None => (*spec, *spec),
        };
        for name in [src, dst] {
            if !is_valid_topic(name) {
                return Err(Error::malformed_endpoint(
                    pos,
                    format!("invalid topic name {name:?}"),
                ));
            }
        }
        out.push(TopicMap {
            src: src.to_string(),
            dst: dst.to_string(),
        });
    }
    Ok(out)
}

/// Topic name grammar: `[A-Za-z_][A-Za-z0-9_]*` or the literal `*`
pub fn is_valid_topic(name: &str) -> bool {
    if name == TOPIC_WILDCARD {
        return true;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_options(opts: &[&str], pos: usize) -> Result<EndpointOptions> {
    let mut out = EndpointOptions::default();
    for opt in opts {
        let (key, value) = match opt.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (opt.trim(), None),
        };
        if key.is_empty() {
            return Err(Error::malformed_endpoint(pos, "empty option key"));
        }
        match key {
            "outbox" => out.outbox = Some(typed_option(key, value, pos)?),
            "sync" => {
                let raw: String = typed_option(key, value, pos)?;
                out.sync = Some(SyncMode::parse(&raw).map_err(|e| option_error(key, pos, e))?);
            }
            "window_ms" => out.window_ms = Some(typed_option(key, value, pos)?),
            "propagate_eos" => {
                let raw = value.unwrap_or("true");
                out.propagate_eos =
                    Some(crate::config::coerce_bool(raw).map_err(|e| option_error(key, pos, e))?);
            }
            "connect_timeout_ms" => out.connect_timeout_ms = Some(typed_option(key, value, pos)?),
            _ => {
                out.extra
                    .insert(key.to_string(), value.map(str::to_string));
            }
        }
    }
    Ok(out)
}

fn typed_option<T: std::str::FromStr>(key: &str, value: Option<&str>, pos: usize) -> Result<T> {
    let raw = value.ok_or_else(|| {
        Error::malformed_endpoint(pos, format!("option {key:?} requires a value"))
    })?;
    raw.parse().map_err(|_| {
        Error::malformed_endpoint(pos, format!("option {key:?}: invalid value {raw:?}"))
    })
}

fn option_error(key: &str, pos: usize, cause: Error) -> Error {
    Error::malformed_endpoint(pos, format!("option {key:?}: {cause}"))
}
