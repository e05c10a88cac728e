use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which upstream group a backend belongs to.
///
/// The proxy serves two independent pools; weights are normalized to 100
/// within each pool separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pool {
    Incoming,
    Outgoing,
}

impl Pool {
    /// Name of the nginx upstream block for this pool.
    pub fn upstream_name(&self) -> &'static str {
        match self {
            Pool::Incoming => "upstream_incoming",
            Pool::Outgoing => "upstream_outgoing",
        }
    }

    /// First internal proxy port allocated to this pool.
    pub fn base_proxy_port(&self) -> u16 {
        match self {
            Pool::Incoming => 8081,
            Pool::Outgoing => 9081,
        }
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pool::Incoming => write!(f, "incoming"),
            Pool::Outgoing => write!(f, "outgoing"),
        }
    }
}

impl FromStr for Pool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Pool::Incoming),
            "outgoing" => Ok(Pool::Outgoing),
            other => Err(format!("unknown pool: {other}")),
        }
    }
}

/// Identity of a backend server as supplied by deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerDescriptor {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            host: host.into(),
            port: None,
            enabled: true,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// `host` if no port is configured, otherwise `host:port`.
    pub fn address(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_with_port() {
        let server = ServerDescriptor::new("s1", "api.example.com").with_port(8443);
        assert_eq!(server.address(), "api.example.com:8443");
    }

    #[test]
    fn test_address_without_port() {
        let server = ServerDescriptor::new("s1", "api.example.com/v2");
        assert_eq!(server.address(), "api.example.com/v2");
    }

    #[test]
    fn test_new_is_enabled_and_named_after_id() {
        let server = ServerDescriptor::new("s1", "host");
        assert!(server.enabled);
        assert_eq!(server.name, "s1");
    }

    #[test]
    fn test_pool_roundtrip() {
        assert_eq!("incoming".parse::<Pool>().unwrap(), Pool::Incoming);
        assert_eq!("outgoing".parse::<Pool>().unwrap(), Pool::Outgoing);
        assert!("sideways".parse::<Pool>().is_err());
        assert_eq!(Pool::Incoming.to_string(), "incoming");
    }

    #[test]
    fn test_pool_upstream_names() {
        assert_eq!(Pool::Incoming.upstream_name(), "upstream_incoming");
        assert_eq!(Pool::Outgoing.upstream_name(), "upstream_outgoing");
        assert_eq!(Pool::Incoming.base_proxy_port(), 8081);
        assert_eq!(Pool::Outgoing.base_proxy_port(), 9081);
    }

    #[test]
    fn test_descriptor_deserializes_with_defaults() {
        let json = r#"{"id": "s1", "host": "10.0.0.1"}"#;
        let server: ServerDescriptor = serde_json::from_str(json).unwrap();
        assert!(server.enabled);
        assert!(server.port.is_none());
    }
}
