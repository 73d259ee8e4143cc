//! Domain model for managed hosts, access lists and settings
//!
//! Locations and stream ports are persisted as loosely-typed JSON documents
//! embedded in the host row. Records written by older releases can lack fields
//! that were introduced later, so everything coming out of storage passes
//! through the `Raw*` shapes in this module and is normalized into fully
//! populated, typed values. Missing fields are defaulted, never rejected.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Balance method used when a record does not name one
pub const DEFAULT_BALANCE_METHOD: &str = "round_robin";
/// Scheme used by redirect locations that predate the field
pub const DEFAULT_FORWARD_SCHEME: &str = "https";
/// Target path used by redirect locations that predate the field
pub const DEFAULT_FORWARD_PATH: &str = "/";
/// Redirect status used by redirect locations that predate the field
pub const DEFAULT_STATUS_CODE: u16 = 301;
/// Match path used when a record has none
pub const DEFAULT_LOCATION_PATH: &str = "/";

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// One backend server targeted by a location or stream port.
///
/// Duplicates are allowed and kept in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawUpstream")]
pub struct Upstream {
    pub server: String,
    pub port: u16,
    pub weight: u32,
}

/// Upstream as persisted. Missing fields are filled in on read and left for
/// action-layer validation to reject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawUpstream {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub weight: Option<u32>,
}

impl From<RawUpstream> for Upstream {
    fn from(raw: RawUpstream) -> Self {
        Self {
            server: raw.server.unwrap_or_default(),
            port: raw.port.unwrap_or(0),
            weight: raw.weight.unwrap_or_else(default_weight),
        }
    }
}

impl Upstream {
    pub fn new(server: &str, port: u16) -> Self {
        Self {
            server: server.to_string(),
            port,
            weight: 1,
        }
    }
}

/// How a location's path is matched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    #[default]
    Prefix,
    Exact,
    Regex,
}

impl MatchType {
    /// Parse a stored value; anything unrecognised is treated as a prefix match
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("exact") => MatchType::Exact,
            Some(v) if v.eq_ignore_ascii_case("regex") => MatchType::Regex,
            _ => MatchType::Prefix,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Prefix => "prefix",
            MatchType::Exact => "exact",
            MatchType::Regex => "regex",
        }
    }
}

/// Discriminant of a location record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LocationKind {
    /// Locations created before static and redirect existed carry no type
    #[default]
    Proxy,
    Static,
    Redirect,
}

impl LocationKind {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("static") => LocationKind::Static,
            Some(v) if v.eq_ignore_ascii_case("redirect") => LocationKind::Redirect,
            _ => LocationKind::Proxy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LocationKind::Proxy => "proxy",
            LocationKind::Static => "static",
            LocationKind::Redirect => "redirect",
        }
    }
}

/// Variant-specific behaviour of a location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationAction {
    /// Forward to a pool of upstreams
    Proxy {
        upstreams: Vec<Upstream>,
        balance_method: String,
    },
    /// Serve files from a directory
    Static {
        static_dir: String,
        cache_expires: String,
    },
    /// Answer with an HTTP redirect
    Redirect {
        forward_scheme: String,
        forward_domain: String,
        forward_path: String,
        preserve_path: bool,
        status_code: u16,
    },
}

impl LocationAction {
    pub fn kind(&self) -> LocationKind {
        match self {
            LocationAction::Proxy { .. } => LocationKind::Proxy,
            LocationAction::Static { .. } => LocationKind::Static,
            LocationAction::Redirect { .. } => LocationKind::Redirect,
        }
    }
}

/// One routing rule of a host, identified by its position in the host's list.
///
/// Serializes to and deserializes from the loosely-typed storage shape
/// ([`RawLocation`]); deserialization always normalizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawLocation", into = "RawLocation")]
pub struct Location {
    pub path: String,
    pub match_type: MatchType,
    pub headers: BTreeMap<String, String>,
    pub access_list_id: Option<i64>,
    pub action: LocationAction,
}

impl Location {
    pub fn proxy(path: &str, upstreams: Vec<Upstream>) -> Self {
        Self::with_action(
            path,
            LocationAction::Proxy {
                upstreams,
                balance_method: DEFAULT_BALANCE_METHOD.to_string(),
            },
        )
    }

    pub fn static_dir(path: &str, dir: &str, cache_expires: &str) -> Self {
        Self::with_action(
            path,
            LocationAction::Static {
                static_dir: dir.to_string(),
                cache_expires: cache_expires.to_string(),
            },
        )
    }

    pub fn redirect(path: &str, forward_domain: &str) -> Self {
        Self::with_action(
            path,
            LocationAction::Redirect {
                forward_scheme: DEFAULT_FORWARD_SCHEME.to_string(),
                forward_domain: forward_domain.to_string(),
                forward_path: DEFAULT_FORWARD_PATH.to_string(),
                preserve_path: true,
                status_code: DEFAULT_STATUS_CODE,
            },
        )
    }

    fn with_action(path: &str, action: LocationAction) -> Self {
        Self {
            path: path.to_string(),
            match_type: MatchType::Prefix,
            headers: BTreeMap::new(),
            access_list_id: None,
            action,
        }
    }

    pub fn kind(&self) -> LocationKind {
        self.action.kind()
    }
}

/// Location as persisted. Every field is optional because older records lack
/// the ones added after they were written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLocation {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub match_type: Option<String>,
    #[serde(default)]
    pub upstreams: Option<Vec<Upstream>>,
    #[serde(default, alias = "balance_method")]
    pub balance_method: Option<String>,
    #[serde(default)]
    pub static_dir: Option<String>,
    #[serde(default)]
    pub cache_expires: Option<String>,
    #[serde(default)]
    pub forward_scheme: Option<String>,
    #[serde(default)]
    pub forward_domain: Option<String>,
    #[serde(default)]
    pub forward_path: Option<String>,
    #[serde(default)]
    pub preserve_path: Option<bool>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, alias = "access_list_id")]
    pub access_list_id: Option<i64>,
}

impl From<RawLocation> for Location {
    fn from(raw: RawLocation) -> Self {
        normalize_location(raw)
    }
}

impl From<Location> for RawLocation {
    fn from(location: Location) -> Self {
        let mut raw = RawLocation {
            kind: Some(location.kind().as_str().to_string()),
            path: Some(location.path),
            match_type: Some(location.match_type.as_str().to_string()),
            headers: Some(location.headers),
            access_list_id: location.access_list_id,
            ..RawLocation::default()
        };

        match location.action {
            LocationAction::Proxy {
                upstreams,
                balance_method,
            } => {
                raw.upstreams = Some(upstreams);
                raw.balance_method = Some(balance_method);
            }
            LocationAction::Static {
                static_dir,
                cache_expires,
            } => {
                raw.static_dir = Some(static_dir);
                raw.cache_expires = Some(cache_expires);
            }
            LocationAction::Redirect {
                forward_scheme,
                forward_domain,
                forward_path,
                preserve_path,
                status_code,
            } => {
                raw.forward_scheme = Some(forward_scheme);
                raw.forward_domain = Some(forward_domain);
                raw.forward_path = Some(forward_path);
                raw.preserve_path = Some(preserve_path);
                raw.status_code = Some(status_code);
            }
        }

        raw
    }
}

/// Fill in every field a stored location may be missing.
pub fn normalize_location(raw: RawLocation) -> Location {
    let action = match LocationKind::parse(raw.kind.as_deref()) {
        LocationKind::Proxy => LocationAction::Proxy {
            upstreams: raw.upstreams.unwrap_or_default(),
            balance_method: raw
                .balance_method
                .unwrap_or_else(|| DEFAULT_BALANCE_METHOD.to_string()),
        },
        LocationKind::Static => LocationAction::Static {
            static_dir: raw.static_dir.unwrap_or_default(),
            cache_expires: raw.cache_expires.unwrap_or_default(),
        },
        LocationKind::Redirect => LocationAction::Redirect {
            forward_scheme: raw
                .forward_scheme
                .unwrap_or_else(|| DEFAULT_FORWARD_SCHEME.to_string()),
            forward_domain: raw.forward_domain.unwrap_or_default(),
            forward_path: raw
                .forward_path
                .unwrap_or_else(|| DEFAULT_FORWARD_PATH.to_string()),
            preserve_path: raw.preserve_path.unwrap_or(true),
            status_code: raw.status_code.unwrap_or(DEFAULT_STATUS_CODE),
        },
    };

    Location {
        path: raw
            .path
            .unwrap_or_else(|| DEFAULT_LOCATION_PATH.to_string()),
        match_type: MatchType::parse(raw.match_type.as_deref()),
        headers: raw.headers.unwrap_or_default(),
        access_list_id: raw.access_list_id,
        action,
    }
}

/// Normalize a host's location list; a missing list is an empty list.
pub fn normalize_locations(raw: Option<Vec<RawLocation>>) -> Vec<Location> {
    raw.unwrap_or_default()
        .into_iter()
        .map(normalize_location)
        .collect()
}

/// Transport of a raw stream forward
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamProtocol {
    #[default]
    Tcp,
    Udp,
}

impl StreamProtocol {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("udp") => StreamProtocol::Udp,
            _ => StreamProtocol::Tcp,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProtocol::Tcp => "tcp",
            StreamProtocol::Udp => "udp",
        }
    }
}

/// Raw TCP/UDP forward embedded in a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawStreamPort", into = "RawStreamPort")]
pub struct StreamPort {
    pub port: u16,
    pub protocol: StreamProtocol,
    pub upstreams: Vec<Upstream>,
    pub balance_method: String,
}

impl StreamPort {
    pub fn new(port: u16, protocol: StreamProtocol, upstreams: Vec<Upstream>) -> Self {
        Self {
            port,
            protocol,
            upstreams,
            balance_method: DEFAULT_BALANCE_METHOD.to_string(),
        }
    }
}

/// Stream port as persisted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStreamPort {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub upstreams: Option<Vec<Upstream>>,
    #[serde(default, alias = "balance_method")]
    pub balance_method: Option<String>,
}

impl From<RawStreamPort> for StreamPort {
    fn from(raw: RawStreamPort) -> Self {
        normalize_stream_port(raw)
    }
}

impl From<StreamPort> for RawStreamPort {
    fn from(stream: StreamPort) -> Self {
        RawStreamPort {
            port: Some(stream.port),
            protocol: Some(stream.protocol.as_str().to_string()),
            upstreams: Some(stream.upstreams),
            balance_method: Some(stream.balance_method),
        }
    }
}

pub fn normalize_stream_port(raw: RawStreamPort) -> StreamPort {
    StreamPort {
        port: raw.port.unwrap_or(0),
        protocol: StreamProtocol::parse(raw.protocol.as_deref()),
        upstreams: raw.upstreams.unwrap_or_default(),
        balance_method: raw
            .balance_method
            .unwrap_or_else(|| DEFAULT_BALANCE_METHOD.to_string()),
    }
}

pub fn normalize_stream_ports(raw: Option<Vec<RawStreamPort>>) -> Vec<StreamPort> {
    raw.unwrap_or_default()
        .into_iter()
        .map(normalize_stream_port)
        .collect()
}

/// Certificate source of a host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    #[default]
    None,
    Letsencrypt,
    Custom,
}

impl SslMode {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            v if v.eq_ignore_ascii_case("letsencrypt") => SslMode::Letsencrypt,
            v if v.eq_ignore_ascii_case("custom") => SslMode::Custom,
            _ => SslMode::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::None => "none",
            SslMode::Letsencrypt => "letsencrypt",
            SslMode::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslSettings {
    #[serde(default, rename = "type")]
    pub mode: SslMode,
    #[serde(default)]
    pub force_https: bool,
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
}

/// A managed virtual host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Host {
    pub id: i64,
    pub domains: Vec<String>,
    pub group_id: Option<i64>,
    pub enabled: bool,
    pub ssl: SslSettings,
    pub hsts: bool,
    pub http2: bool,
    pub locations: Vec<Location>,
    pub stream_ports: Vec<StreamPort>,
    pub webhook_url: Option<String>,
    pub advanced_yaml: String,
}

/// Everything about a host except its identifier; the body of create and
/// update actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInput {
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub ssl: SslSettings,
    #[serde(default)]
    pub hsts: bool,
    #[serde(default)]
    pub http2: bool,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub stream_ports: Vec<StreamPort>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub advanced_yaml: String,
}

impl Default for HostInput {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            group_id: None,
            enabled: true,
            ssl: SslSettings::default(),
            hsts: false,
            http2: false,
            locations: Vec::new(),
            stream_ports: Vec::new(),
            webhook_url: None,
            advanced_yaml: String::new(),
        }
    }
}

impl HostInput {
    /// Attach an identifier
    pub fn into_host(self, id: i64) -> Host {
        Host {
            id,
            domains: self.domains,
            group_id: self.group_id,
            enabled: self.enabled,
            ssl: self.ssl,
            hsts: self.hsts,
            http2: self.http2,
            locations: self.locations,
            stream_ports: self.stream_ports,
            webhook_url: self.webhook_url,
            advanced_yaml: self.advanced_yaml,
        }
    }

    /// Structural checks applied by the action layer before a host is stored.
    ///
    /// String contents (domains, paths, override text) are not inspected.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !self.locations.is_empty() && self.domains.iter().all(|d| d.trim().is_empty()) {
            errors.push("a host with locations needs at least one domain".to_string());
        }

        if self.ssl.mode == SslMode::Custom
            && (self.ssl.cert_path.is_none() || self.ssl.key_path.is_none())
        {
            errors.push("custom SSL requires 'cert_path' and 'key_path'".to_string());
        }

        for (index, location) in self.locations.iter().enumerate() {
            match &location.action {
                LocationAction::Proxy { upstreams, .. } => {
                    if upstreams.is_empty() {
                        errors.push(format!(
                            "location {} ('{}'): proxy needs at least one upstream",
                            index, location.path
                        ));
                    }
                    for upstream in upstreams {
                        if let Err(e) = validate_upstream(upstream) {
                            errors.push(format!("location {} ('{}'): {}", index, location.path, e));
                        }
                    }
                }
                LocationAction::Static { static_dir, .. } => {
                    if static_dir.is_empty() {
                        errors.push(format!(
                            "location {} ('{}'): static needs 'staticDir'",
                            index, location.path
                        ));
                    }
                }
                LocationAction::Redirect { status_code, .. } => {
                    if *status_code != 301 && *status_code != 302 {
                        errors.push(format!(
                            "location {} ('{}'): redirect status must be 301 or 302, got {}",
                            index, location.path, status_code
                        ));
                    }
                }
            }
        }

        for (index, stream) in self.stream_ports.iter().enumerate() {
            if stream.port == 0 {
                errors.push(format!("stream {}: 'port' must be greater than 0", index));
            }
            for upstream in &stream.upstreams {
                if let Err(e) = validate_upstream(upstream) {
                    errors.push(format!("stream {} (port {}): {}", index, stream.port, e));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Invalid host:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn validate_upstream(upstream: &Upstream) -> Result<(), String> {
    if upstream.server.trim().is_empty() {
        return Err("upstream 'server' must not be empty".to_string());
    }
    if upstream.port == 0 {
        return Err(format!(
            "upstream '{}': 'port' must be greater than 0",
            upstream.server
        ));
    }
    if upstream.weight == 0 {
        return Err(format!(
            "upstream '{}': 'weight' must be at least 1",
            upstream.server
        ));
    }
    Ok(())
}

/// A host that only answers with a redirect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectionInput {
    pub domains: Vec<String>,
    #[serde(default = "default_forward_scheme")]
    pub forward_scheme: String,
    pub forward_domain: String,
    #[serde(default = "default_forward_path")]
    pub forward_path: String,
    #[serde(default = "default_true")]
    pub preserve_path: bool,
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default)]
    pub ssl: SslSettings,
    #[serde(default)]
    pub hsts: bool,
    #[serde(default)]
    pub http2: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_forward_scheme() -> String {
    DEFAULT_FORWARD_SCHEME.to_string()
}

fn default_forward_path() -> String {
    DEFAULT_FORWARD_PATH.to_string()
}

fn default_status_code() -> u16 {
    DEFAULT_STATUS_CODE
}

impl From<RedirectionInput> for HostInput {
    fn from(input: RedirectionInput) -> Self {
        let location = Location::with_action(
            DEFAULT_LOCATION_PATH,
            LocationAction::Redirect {
                forward_scheme: input.forward_scheme,
                forward_domain: input.forward_domain,
                forward_path: input.forward_path,
                preserve_path: input.preserve_path,
                status_code: input.status_code,
            },
        );

        HostInput {
            domains: input.domains,
            enabled: input.enabled,
            ssl: input.ssl,
            hsts: input.hsts,
            http2: input.http2,
            locations: vec![location],
            ..HostInput::default()
        }
    }
}

/// A host that only carries one raw TCP/UDP forward
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInput {
    pub incoming_port: u16,
    #[serde(default)]
    pub protocol: StreamProtocol,
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    #[serde(default = "default_balance_method")]
    pub balance_method: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_balance_method() -> String {
    DEFAULT_BALANCE_METHOD.to_string()
}

impl From<StreamInput> for HostInput {
    fn from(input: StreamInput) -> Self {
        HostInput {
            enabled: input.enabled,
            stream_ports: vec![StreamPort {
                port: input.incoming_port,
                protocol: input.protocol,
                upstreams: input.upstreams,
                balance_method: input.balance_method,
            }],
            ..HostInput::default()
        }
    }
}

/// Whether any or all access conditions must hold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Satisfy {
    #[default]
    Any,
    All,
}

impl Satisfy {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("all") {
            Satisfy::All
        } else {
            Satisfy::Any
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Satisfy::Any => "any",
            Satisfy::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Directive {
    Allow,
    Deny,
}

impl Directive {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            v if v.eq_ignore_ascii_case("allow") => Some(Directive::Allow),
            v if v.eq_ignore_ascii_case("deny") => Some(Directive::Deny),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Directive::Allow => "allow",
            Directive::Deny => "deny",
        }
    }
}

/// IP or CIDR client rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRule {
    pub address: String,
    pub directive: Directive,
}

/// Basic-auth credential, password kept exactly as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessList {
    pub id: i64,
    pub name: String,
    pub satisfy: Satisfy,
    pub clients: Vec<ClientRule>,
    pub auth: Vec<AuthEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessListInput {
    pub name: String,
    #[serde(default)]
    pub satisfy: Satisfy,
    #[serde(default)]
    pub clients: Vec<ClientRule>,
    #[serde(default)]
    pub auth: Vec<AuthEntry>,
}

impl AccessListInput {
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("'name' must not be empty".to_string());
        }
        for (index, client) in self.clients.iter().enumerate() {
            if client.address.trim().is_empty() {
                errors.push(format!("client {}: 'address' must not be empty", index));
            }
        }
        for (index, entry) in self.auth.iter().enumerate() {
            if entry.username.trim().is_empty() {
                errors.push(format!("auth {}: 'username' must not be empty", index));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Invalid access list:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }

    pub fn into_access_list(self, id: i64) -> AccessList {
        AccessList {
            id,
            name: self.name,
            satisfy: self.satisfy,
            clients: self.clients,
            auth: self.auth,
        }
    }
}

/// Named collection of hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostGroup {
    pub id: i64,
    pub name: String,
}

/// Complete state read from the store at one instant
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub hosts: Vec<Host>,
    pub access_lists: Vec<AccessList>,
    pub settings: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_location_gets_every_default() {
        let location = normalize_location(RawLocation::default());

        assert_eq!(location.path, "/");
        assert_eq!(location.match_type, MatchType::Prefix);
        assert!(location.headers.is_empty());
        assert_eq!(location.access_list_id, None);
        assert_eq!(
            location.action,
            LocationAction::Proxy {
                upstreams: Vec::new(),
                balance_method: "round_robin".to_string(),
            }
        );
    }

    #[test]
    fn test_redirect_defaults_backfilled() {
        let raw: RawLocation =
            serde_json::from_str(r#"{"type":"redirect","path":"/old"}"#).unwrap();
        let location = normalize_location(raw);

        assert_eq!(location.kind(), LocationKind::Redirect);
        assert_eq!(
            location.action,
            LocationAction::Redirect {
                forward_scheme: "https".to_string(),
                forward_domain: String::new(),
                forward_path: "/".to_string(),
                preserve_path: true,
                status_code: 301,
            }
        );
    }

    #[test]
    fn test_static_defaults_backfilled() {
        let raw: RawLocation = serde_json::from_str(r#"{"type":"static"}"#).unwrap();
        let location = normalize_location(raw);

        assert_eq!(
            location.action,
            LocationAction::Static {
                static_dir: String::new(),
                cache_expires: String::new(),
            }
        );
    }

    #[test]
    fn test_present_fields_are_kept() {
        let raw: RawLocation = serde_json::from_str(
            r#"{
                "type": "proxy",
                "path": "/api",
                "matchType": "exact",
                "upstreams": [{"server": "10.0.0.1", "port": 8080}],
                "balanceMethod": "least_conn",
                "headers": {"X-Frame-Options": "DENY"},
                "accessListId": 7
            }"#,
        )
        .unwrap();
        let location = normalize_location(raw);

        assert_eq!(location.path, "/api");
        assert_eq!(location.match_type, MatchType::Exact);
        assert_eq!(location.access_list_id, Some(7));
        assert_eq!(location.headers.get("X-Frame-Options").unwrap(), "DENY");
        match location.action {
            LocationAction::Proxy {
                upstreams,
                balance_method,
            } => {
                assert_eq!(upstreams, vec![Upstream::new("10.0.0.1", 8080)]);
                assert_eq!(balance_method, "least_conn");
            }
            other => panic!("expected proxy, got {:?}", other),
        }
    }

    #[test]
    fn test_null_fields_treated_as_missing() {
        let raw: RawLocation = serde_json::from_str(
            r#"{"type":"redirect","forwardPath":null,"statusCode":null,"headers":null}"#,
        )
        .unwrap();
        let location = normalize_location(raw);

        assert!(location.headers.is_empty());
        match location.action {
            LocationAction::Redirect {
                forward_path,
                status_code,
                ..
            } => {
                assert_eq!(forward_path, "/");
                assert_eq!(status_code, 301);
            }
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_and_match_fall_back() {
        let raw: RawLocation =
            serde_json::from_str(r#"{"type":"websocket","matchType":"glob"}"#).unwrap();
        let location = normalize_location(raw);

        assert_eq!(location.kind(), LocationKind::Proxy);
        assert_eq!(location.match_type, MatchType::Prefix);
    }

    #[test]
    fn test_missing_lists_normalize_to_empty() {
        assert!(normalize_locations(None).is_empty());
        assert!(normalize_stream_ports(None).is_empty());
    }

    #[test]
    fn test_stream_port_defaults() {
        let raw: RawStreamPort = serde_json::from_str(r#"{"port": 3306}"#).unwrap();
        let stream = normalize_stream_port(raw);

        assert_eq!(stream.port, 3306);
        assert_eq!(stream.protocol, StreamProtocol::Tcp);
        assert!(stream.upstreams.is_empty());
        assert_eq!(stream.balance_method, "round_robin");
    }

    #[test]
    fn test_stream_port_accepts_snake_case_balance_method() {
        let stream: StreamPort = serde_json::from_str(
            r#"{"port": 53, "protocol": "udp", "balance_method": "ip_hash"}"#,
        )
        .unwrap();

        assert_eq!(stream.protocol, StreamProtocol::Udp);
        assert_eq!(stream.balance_method, "ip_hash");
    }

    #[test]
    fn test_partial_upstreams_are_filled_in() {
        let location: Location = serde_json::from_str(
            r#"{"type": "proxy", "upstreams": [{"server": "10.0.0.1"}, {"port": 8080}]}"#,
        )
        .unwrap();

        match location.action {
            LocationAction::Proxy { upstreams, .. } => {
                assert_eq!(upstreams[0], Upstream { server: "10.0.0.1".to_string(), port: 0, weight: 1 });
                assert_eq!(upstreams[1], Upstream { server: String::new(), port: 8080, weight: 1 });
            }
            other => panic!("expected proxy, got {:?}", other),
        }

        let stream: StreamPort =
            serde_json::from_str(r#"{"port": 53, "upstreams": [{}]}"#).unwrap();
        assert_eq!(stream.upstreams[0], Upstream { server: String::new(), port: 0, weight: 1 });
    }

    #[test]
    fn test_partial_upstream_fails_validation() {
        let host: HostInput = serde_json::from_str(
            r#"{"domains": ["example.com"], "locations": [{"upstreams": [{"server": "10.0.0.1"}]}]}"#,
        )
        .unwrap();

        let err = host.validate().unwrap_err();
        assert!(err.to_string().contains("'port' must be greater than 0"));
    }

    #[test]
    fn test_upstream_weight_defaults_to_one() {
        let upstream: Upstream =
            serde_json::from_str(r#"{"server": "db.internal", "port": 5432}"#).unwrap();
        assert_eq!(upstream.weight, 1);
    }

    #[test]
    fn test_location_storage_shape_is_stable() {
        let mut location = Location::static_dir("/assets", "/var/www/static", "30d");
        location.headers.insert("Cache-Control".to_string(), "public".to_string());

        let json = serde_json::to_string(&location).unwrap();
        let restored: Location = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, location);
        assert!(json.contains(r#""type":"static""#));
        assert!(json.contains(r#""staticDir":"/var/www/static""#));
    }

    #[test]
    fn test_host_with_locations_requires_domain() {
        let input = HostInput {
            locations: vec![Location::proxy("/", vec![Upstream::new("10.0.0.1", 80)])],
            ..HostInput::default()
        };

        let err = input.validate().unwrap_err().to_string();
        assert!(err.contains("at least one domain"));
    }

    #[test]
    fn test_stream_only_host_needs_no_domain() {
        let input = HostInput::from(StreamInput {
            incoming_port: 3306,
            protocol: StreamProtocol::Tcp,
            upstreams: vec![Upstream::new("db.internal", 3306)],
            balance_method: "least_conn".to_string(),
            enabled: true,
        });

        assert!(input.validate().is_ok());
        assert!(input.locations.is_empty());
        assert_eq!(input.stream_ports[0].balance_method, "least_conn");
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut redirect = Location::redirect("/", "new.example.com");
        if let LocationAction::Redirect { status_code, .. } = &mut redirect.action {
            *status_code = 307;
        }
        let input = HostInput {
            domains: vec!["example.com".to_string()],
            ssl: SslSettings {
                mode: SslMode::Custom,
                ..SslSettings::default()
            },
            locations: vec![Location::proxy("/api", Vec::new()), redirect],
            stream_ports: vec![StreamPort::new(0, StreamProtocol::Udp, Vec::new())],
            ..HostInput::default()
        };

        let err = input.validate().unwrap_err().to_string();
        assert!(err.contains("custom SSL requires"));
        assert!(err.contains("proxy needs at least one upstream"));
        assert!(err.contains("must be 301 or 302, got 307"));
        assert!(err.contains("stream 0: 'port' must be greater than 0"));
    }

    #[test]
    fn test_validate_does_not_inspect_strings() {
        let input = HostInput {
            domains: vec!["<script>alert(1)</script>.com".to_string()],
            locations: vec![Location::proxy("/../..", vec![Upstream::new("10.0.0.1", 80)])],
            advanced_yaml: "$(rm -rf /)".to_string(),
            ..HostInput::default()
        };

        assert!(input.validate().is_ok());
    }

    #[test]
    fn test_redirection_input_becomes_single_location_host() {
        let input: RedirectionInput = serde_json::from_str(
            r#"{"domains": ["old.example.com"], "forward_domain": "new.example.com", "status_code": 302}"#,
        )
        .unwrap();
        let host = HostInput::from(input);

        assert_eq!(host.locations.len(), 1);
        assert_eq!(host.locations[0].path, "/");
        match &host.locations[0].action {
            LocationAction::Redirect {
                forward_scheme,
                forward_domain,
                status_code,
                preserve_path,
                ..
            } => {
                assert_eq!(forward_scheme, "https");
                assert_eq!(forward_domain, "new.example.com");
                assert_eq!(*status_code, 302);
                assert!(*preserve_path);
            }
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[test]
    fn test_access_list_validation() {
        let input = AccessListInput {
            name: " ".to_string(),
            satisfy: Satisfy::All,
            clients: vec![ClientRule {
                address: String::new(),
                directive: Directive::Deny,
            }],
            auth: Vec::new(),
        };

        let err = input.validate().unwrap_err().to_string();
        assert!(err.contains("'name' must not be empty"));
        assert!(err.contains("client 0"));
    }
}
