use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A service is identified by where its code lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub repository: String,
    pub branch: String,
}

impl Service {
    pub fn new(repository: impl Into<String>, branch: Option<String>) -> Self {
        Service {
            repository: repository.into(),
            branch: branch.filter(|b| !b.is_empty()).unwrap_or_else(default_branch),
        }
    }
}

pub fn default_branch() -> String {
    "master".to_string()
}

/// The settings a repository owner may declare in its descriptor file
/// (or pass as an explicit override).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicConfiguration {
    #[serde(default, rename = "type")]
    pub service_type: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub env: HashMap<String, serde_json::Value>,
    #[serde(default, rename = "webSocket")]
    pub web_socket: Option<WebSocket>,
    #[serde(default)]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocket {
    pub path: String,
}

/// The record persisted in the service registry, keyed by [`service_id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredService {
    pub repository: String,
    pub branch: String,
    #[serde(rename = "type")]
    pub service_type: String,
}

impl StoredService {
    pub fn service(&self) -> Service {
        Service {
            repository: self.repository.clone(),
            branch: self.branch.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServicePorts {
    pub port: u16,
    #[serde(rename = "hostPort")]
    pub host_port: u16,
    #[serde(rename = "webSocketPort")]
    pub web_socket_port: Option<u16>,
}

/// The fully computed configuration used to drive the container runtime
/// and the reverse proxy.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceConfiguration {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub repository: String,
    pub branch: String,
    pub domains: Vec<String>,
    pub env: HashMap<String, String>,
    pub memory: Option<String>,
    #[serde(rename = "webSocket")]
    pub web_socket: Option<WebSocket>,
    pub ports: ServicePorts,
}

impl ServiceConfiguration {
    /// Combine a service with its public configuration and the ports the
    /// coordinator allocated for it. `web_socket_port` is only given when
    /// the service declares a websocket path.
    pub fn resolve(
        service: &Service,
        public: &PublicConfiguration,
        service_type: &str,
        domain_suffix: &str,
        host_port: u16,
        web_socket_port: Option<u16>,
    ) -> Self {
        let id = service_id(service);
        let name = container_name(service);
        let port = public.port.unwrap_or(host_port);
        let domains = vec![
            public
                .domain
                .clone()
                .unwrap_or_else(|| format!("{}.{}", name, domain_suffix)),
        ];
        let web_socket = public
            .web_socket
            .clone()
            .filter(|ws| !ws.path.is_empty());
        let web_socket_port = web_socket.as_ref().and(web_socket_port);

        let mut env: HashMap<String, String> = public
            .env
            .iter()
            .map(|(k, v)| (k.clone(), env_value_to_string(v)))
            .collect();
        env.insert("PORT".to_string(), port.to_string());
        if let Some(ws_port) = web_socket_port {
            env.insert("WEBSOCKET_PORT".to_string(), ws_port.to_string());
        }

        ServiceConfiguration {
            id,
            name,
            service_type: service_type.to_string(),
            repository: service.repository.clone(),
            branch: service.branch.clone(),
            domains,
            env,
            memory: public.memory.clone(),
            web_socket,
            ports: ServicePorts {
                port,
                host_port,
                web_socket_port,
            },
        }
    }
}

fn env_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Deterministic identity digest of a `(repository, branch)` pair. A
/// separator byte keeps distinct pairs from ever concatenating to the
/// same input.
pub fn service_id(service: &Service) -> String {
    let mut hasher = Sha256::new();
    hasher.update(service.repository.as_bytes());
    hasher.update(b"\n");
    hasher.update(service.branch.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Filesystem- and runtime-safe container name: repository and branch
/// joined with an underscore, runs of other symbols collapsed to a dash.
pub fn container_name(service: &Service) -> String {
    let raw = format!("{}_{}", service.repository, service.branch);
    let mut name = String::with_capacity(raw.len());
    let mut last_was_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            name.push('-');
            last_was_dash = true;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn service(repository: &str, branch: &str) -> Service {
        Service {
            repository: repository.to_string(),
            branch: branch.to_string(),
        }
    }

    #[quickcheck]
    fn identity_is_deterministic(repository: String, branch: String) -> bool {
        let a = service(&repository, &branch);
        service_id(&a) == service_id(&a.clone())
    }

    #[quickcheck]
    fn identity_differs_for_distinct_pairs(
        r1: String,
        b1: String,
        r2: String,
        b2: String,
    ) -> quickcheck::TestResult {
        if [&r1, &b1, &r2, &b2].iter().any(|s| s.contains('\n')) {
            return quickcheck::TestResult::discard();
        }
        if (&r1, &b1) == (&r2, &b2) {
            return quickcheck::TestResult::discard();
        }
        quickcheck::TestResult::from_bool(
            service_id(&service(&r1, &b1)) != service_id(&service(&r2, &b2)),
        )
    }

    #[test]
    fn branches_of_one_repository_get_distinct_identities() {
        let master = service_id(&service("acme/app", "master"));
        let feature = service_id(&service("acme/app", "feature-x"));
        assert_ne!(master, feature);
    }

    #[test]
    fn branch_defaults_to_master() {
        assert_eq!(Service::new("acme/app", None).branch, "master");
        assert_eq!(Service::new("acme/app", Some(String::new())).branch, "master");
        assert_eq!(
            Service::new("acme/app", Some("dev".to_string())).branch,
            "dev"
        );
    }

    #[test]
    fn container_name_collapses_symbols() {
        assert_eq!(
            container_name(&service("acme/app", "master")),
            "acme-app_master"
        );
        assert_eq!(
            container_name(&service("acme/my.app", "feat/login")),
            "acme-my-app_feat-login"
        );
    }

    #[test]
    fn resolve_defaults_domain_and_port() {
        let svc = service("acme/app", "master");
        let config =
            ServiceConfiguration::resolve(&svc, &PublicConfiguration::default(), "node", "local", 4321, None);

        assert_eq!(config.domains, vec!["acme-app_master.local"]);
        assert_eq!(config.ports.port, 4321);
        assert_eq!(config.ports.host_port, 4321);
        assert_eq!(config.ports.web_socket_port, None);
        assert_eq!(config.env.get("PORT").map(String::as_str), Some("4321"));
        assert!(!config.env.contains_key("WEBSOCKET_PORT"));
    }

    #[test]
    fn resolve_honors_declared_port_and_websocket() {
        let svc = service("acme/app", "master");
        let public = PublicConfiguration {
            domain: Some("app.example.com".to_string()),
            port: Some(8080),
            web_socket: Some(WebSocket {
                path: "ws".to_string(),
            }),
            env: HashMap::from([
                ("GREETING".to_string(), serde_json::json!("hello")),
                ("WORKERS".to_string(), serde_json::json!(4)),
            ]),
            ..Default::default()
        };

        let config = ServiceConfiguration::resolve(&svc, &public, "node", "local", 4321, Some(5555));

        assert_eq!(config.domains, vec!["app.example.com"]);
        assert_eq!(config.ports.port, 8080);
        assert_eq!(config.ports.host_port, 4321);
        assert_eq!(config.ports.web_socket_port, Some(5555));
        assert_eq!(config.env.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(
            config.env.get("WEBSOCKET_PORT").map(String::as_str),
            Some("5555")
        );
        assert_eq!(config.env.get("GREETING").map(String::as_str), Some("hello"));
        assert_eq!(config.env.get("WORKERS").map(String::as_str), Some("4"));
    }

    #[test]
    fn empty_websocket_path_is_ignored() {
        let svc = service("acme/app", "master");
        let public = PublicConfiguration {
            web_socket: Some(WebSocket {
                path: String::new(),
            }),
            ..Default::default()
        };
        let config = ServiceConfiguration::resolve(&svc, &public, "node", "local", 4321, Some(5555));
        assert!(config.web_socket.is_none());
        assert_eq!(config.ports.web_socket_port, None);
    }
}
