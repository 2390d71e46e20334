//! Host specifications naming a broker to connect to
//!
//! ```text
//! [socket://][password@|user:password@]host[:port][/namespace]
//! shell://command
//! ```
//!
//! A bare name found in the alias table read from `NSBROKER_HOSTSPECS` (a JSON
//! object mapping names to host specs) is replaced by its target first.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::config::DEFAULT_PORT;
use crate::error::{BrokerError, Result};

/// Environment variable holding the alias table
pub const HOSTSPECS_ENV: &str = "NSBROKER_HOSTSPECS";

/// Namespace used when a host spec names none
pub const DEFAULT_NAMESPACE: &str = "default";

/// Where a broker is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Socket { host: String, port: u16 },
    /// A command whose stdin/stdout speak the protocol
    Shell { command: String },
}

/// A parsed host spec
#[derive(Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub endpoint: Endpoint,
    pub password: Option<String>,
    pub namespace: String,
}

impl HostSpec {
    /// Parse `spec`, resolving aliases from the environment
    pub fn resolve(spec: &str) -> Result<Self> {
        match env_aliases().get(spec) {
            Some(target) => target.parse(),
            None => spec.parse(),
        }
    }

    /// Parse `spec`, resolving aliases from `aliases`
    pub fn resolve_with(spec: &str, aliases: &HashMap<String, String>) -> Result<Self> {
        aliases.get(spec).map_or(spec, String::as_str).parse()
    }

    /// `host:port` to connect to, if this is a socket endpoint
    pub fn address(&self) -> Option<String> {
        match &self.endpoint {
            Endpoint::Socket { host, port } if host.contains(':') => {
                Some(format!("[{host}]:{port}"))
            }
            Endpoint::Socket { host, port } => Some(format!("{host}:{port}")),
            Endpoint::Shell { .. } => None,
        }
    }
}

fn invalid(spec: &str) -> BrokerError {
    BrokerError::InvalidHostSpec(spec.to_string())
}

impl FromStr for HostSpec {
    type Err = BrokerError;

    fn from_str(spec: &str) -> Result<Self> {
        let (scheme, rest) = spec.split_once("://").unwrap_or(("socket", spec));
        match scheme {
            "shell" if !rest.trim().is_empty() => Ok(Self {
                endpoint: Endpoint::Shell {
                    command: rest.to_string(),
                },
                password: None,
                namespace: DEFAULT_NAMESPACE.to_string(),
            }),
            "socket" => parse_socket(spec, rest),
            _ => Err(invalid(spec)),
        }
    }
}

fn parse_socket(spec: &str, rest: &str) -> Result<HostSpec> {
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    let (userinfo, hostport) = match authority.rsplit_once('@') {
        Some((userinfo, hostport)) => (Some(userinfo), hostport),
        None => (None, authority),
    };
    // `user:password` or just `password`
    let password = userinfo
        .filter(|info| !info.is_empty())
        .map(|info| info.split_once(':').map_or(info, |(_, pw)| pw).to_string());

    let (host, port) = split_host_port(hostport).ok_or_else(|| invalid(spec))?;
    if host.is_empty() {
        return Err(invalid(spec));
    }
    let namespace = match path.trim_end_matches('/') {
        "" => DEFAULT_NAMESPACE,
        ns => ns,
    };

    Ok(HostSpec {
        endpoint: Endpoint::Socket {
            host: host.to_string(),
            port,
        },
        password,
        namespace: namespace.to_string(),
    })
}

fn split_host_port(hostport: &str) -> Option<(&str, u16)> {
    // [v6]:port
    if let Some(inner) = hostport.strip_prefix('[') {
        let (host, after) = inner.split_once(']')?;
        return match after.strip_prefix(':') {
            Some(port) => Some((host, port.parse().ok()?)),
            None if after.is_empty() => Some((host, DEFAULT_PORT)),
            None => None,
        };
    }
    match hostport.split_once(':') {
        Some((host, port)) => Some((host, port.parse().ok()?)),
        None => Some((hostport, DEFAULT_PORT)),
    }
}

/// Alias table from the environment, read once
fn env_aliases() -> &'static HashMap<String, String> {
    static ALIASES: OnceLock<HashMap<String, String>> = OnceLock::new();
    ALIASES.get_or_init(|| match std::env::var(HOSTSPECS_ENV) {
        Ok(json) => parse_aliases(&json).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ignoring {HOSTSPECS_ENV}");
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    })
}

/// Parse an alias table: a JSON object mapping names to host specs
pub fn parse_aliases(json: &str) -> Result<HashMap<String, String>> {
    serde_json::from_str(json).map_err(|err| BrokerError::Config(format!("host spec aliases: {err}")))
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Shell { command } => write!(f, "shell://{command}"),
            Endpoint::Socket { .. } => {
                f.write_str("socket://")?;
                if self.password.is_some() {
                    f.write_str("***@")?;
                }
                let address = self.address().unwrap_or_default();
                write!(f, "{address}/{}", self.namespace)
            }
        }
    }
}

impl fmt::Debug for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostSpec({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket(host: &str, port: u16) -> Endpoint {
        Endpoint::Socket {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_defaults() {
        let spec: HostSpec = "example.org".parse().unwrap();
        assert_eq!(spec.endpoint, socket("example.org", 8089));
        assert_eq!(spec.password, None);
        assert_eq!(spec.namespace, "default");
        assert_eq!(spec.address().unwrap(), "example.org:8089");
    }

    #[test]
    fn test_full_socket_spec() {
        let spec: HostSpec = "socket://pw@host:9000/work".parse().unwrap();
        assert_eq!(spec.endpoint, socket("host", 9000));
        assert_eq!(spec.password.as_deref(), Some("pw"));
        assert_eq!(spec.namespace, "work");

        let spec: HostSpec = "user:s3cret@host/ns".parse().unwrap();
        assert_eq!(spec.password.as_deref(), Some("s3cret"));
        assert_eq!(spec.endpoint, socket("host", 8089));
        assert_eq!(spec.namespace, "ns");
    }

    #[test]
    fn test_ipv6_and_display() {
        let spec: HostSpec = "[::1]:7000".parse().unwrap();
        assert_eq!(spec.endpoint, socket("::1", 7000));
        assert_eq!(spec.address().unwrap(), "[::1]:7000");

        let spec: HostSpec = "secret@h/n".parse().unwrap();
        assert_eq!(spec.to_string(), "socket://***@h:8089/n");
    }

    #[test]
    fn test_shell_spec() {
        let spec: HostSpec = "shell://nsbroker serve --stdio".parse().unwrap();
        assert_eq!(
            spec.endpoint,
            Endpoint::Shell {
                command: "nsbroker serve --stdio".into()
            }
        );
        assert_eq!(spec.address(), None);
    }

    #[test]
    fn test_invalid_specs() {
        for bad in ["ftp://host", "host:notaport", "host:99999", ":8089", "shell://", "[::1"] {
            assert!(
                matches!(bad.parse::<HostSpec>(), Err(BrokerError::InvalidHostSpec(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_aliases() {
        let aliases = parse_aliases(r#"{"lab": "pw@lab.local:9001/tests"}"#).unwrap();
        let spec = HostSpec::resolve_with("lab", &aliases).unwrap();
        assert_eq!(spec.endpoint, socket("lab.local", 9001));
        assert_eq!(spec.namespace, "tests");

        let direct = HostSpec::resolve_with("other", &aliases).unwrap();
        assert_eq!(direct.endpoint, socket("other", 8089));

        assert!(matches!(parse_aliases("[1, 2]"), Err(BrokerError::Config(_))));
    }
}
