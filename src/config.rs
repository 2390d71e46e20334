use std::collections::BTreeSet;

use crate::server::Credential;

/// Default TCP port of a broker
pub const DEFAULT_PORT: u16 = 8089;

/// Default listen address
pub const DEFAULT_HOST: &str = "localhost";

/// Policy of one listening endpoint
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    credentials: Vec<Credential>,
    allow_new_namespaces: bool,
    namespace_whitelist: Option<BTreeSet<String>>,
    kill_server_on_close: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            allow_new_namespaces: true,
            namespace_whitelist: None,
            kill_server_on_close: false,
        }
    }
}

impl ListenerConfig {
    /// Create a new builder for listener configuration
    pub fn builder() -> ListenerConfigBuilder {
        ListenerConfigBuilder::default()
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// Whether connections must authenticate first
    pub fn requires_auth(&self) -> bool {
        !self.credentials.is_empty()
    }

    /// Whether a password matches any configured credential
    pub fn accepts(&self, password: &str) -> bool {
        self.credentials.iter().any(|c| c.matches(password))
    }

    pub fn allow_new_namespaces(&self) -> bool {
        self.allow_new_namespaces
    }

    pub fn namespace_whitelist(&self) -> Option<&BTreeSet<String>> {
        self.namespace_whitelist.as_ref()
    }

    /// Whether executing in unknown namespace `name` may create it
    pub fn may_create(&self, name: &str) -> bool {
        self.allow_new_namespaces
            && self
                .namespace_whitelist
                .as_ref()
                .is_none_or(|names| names.contains(name))
    }

    pub fn kill_server_on_close(&self) -> bool {
        self.kill_server_on_close
    }

    /// Same policy, but closing the connection shuts the broker down
    pub(crate) fn killing_on_close(mut self) -> Self {
        self.kill_server_on_close = true;
        self
    }
}

/// Builder for ListenerConfig
#[derive(Debug, Default)]
pub struct ListenerConfigBuilder {
    inner: ListenerConfig,
}

impl ListenerConfigBuilder {
    /// Accept a plaintext password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.inner.credentials.push(Credential::Plain(password.into()));
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.inner.credentials.push(credential);
        self
    }

    pub fn credentials(mut self, credentials: impl IntoIterator<Item = Credential>) -> Self {
        self.inner.credentials.extend(credentials);
        self
    }

    pub fn allow_new_namespaces(mut self, allow: bool) -> Self {
        self.inner.allow_new_namespaces = allow;
        self
    }

    /// Restrict automatic creation to these namespaces
    pub fn namespace_whitelist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.namespace_whitelist = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn kill_server_on_close(mut self, kill: bool) -> Self {
        self.inner.kill_server_on_close = kill;
        self
    }

    pub fn build(self) -> ListenerConfig {
        self.inner
    }
}

/// Work done before a broker starts accepting connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupTask {
    /// Create a namespace, optionally running code in it
    Init {
        namespace: String,
        code: Option<String>,
    },
    /// Offer a local namespace to the broker at `hostspec`
    Export { namespace: String, hostspec: String },
    /// Reach a namespace of the broker at `hostspec` as a remote namespace
    Import { namespace: String, hostspec: String },
}

/// Configuration of a broker process
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    host: String,
    port: u16,
    listen_stdin: bool,
    listener: ListenerConfig,
    tasks: Vec<StartupTask>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            listen_stdin: false,
            listener: ListenerConfig::default(),
            tasks: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Create a new builder for broker configuration
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::default()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` to bind
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Whether stdin is watched as a liveness signal of the parent process
    ///
    /// Lines read from stdin are only logged; end-of-file stops the watch
    /// without shutting the broker down.
    pub fn listen_stdin(&self) -> bool {
        self.listen_stdin
    }

    pub fn listener(&self) -> &ListenerConfig {
        &self.listener
    }

    pub fn tasks(&self) -> &[StartupTask] {
        &self.tasks
    }
}

/// Builder for BrokerConfig
#[derive(Debug, Default)]
pub struct BrokerConfigBuilder {
    inner: BrokerConfig,
}

impl BrokerConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.inner.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.inner.port = port;
        self
    }

    pub fn listen_stdin(mut self, listen: bool) -> Self {
        self.inner.listen_stdin = listen;
        self
    }

    pub fn listener(mut self, listener: ListenerConfig) -> Self {
        self.inner.listener = listener;
        self
    }

    pub fn task(mut self, task: StartupTask) -> Self {
        self.inner.tasks.push(task);
        self
    }

    pub fn tasks(mut self, tasks: impl IntoIterator<Item = StartupTask>) -> Self {
        self.inner.tasks.extend(tasks);
        self
    }

    pub fn build(self) -> BrokerConfig {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_defaults() {
        let config = ListenerConfig::default();
        assert!(!config.requires_auth());
        assert!(config.may_create("anything"));
        assert!(!config.kill_server_on_close());
    }

    #[test]
    fn test_whitelist_limits_creation() {
        let config = ListenerConfig::builder()
            .namespace_whitelist(["a", "b"])
            .build();
        assert!(config.may_create("a"));
        assert!(!config.may_create("c"));

        let closed = ListenerConfig::builder()
            .namespace_whitelist(["a"])
            .allow_new_namespaces(false)
            .build();
        assert!(!closed.may_create("a"));
    }

    #[test]
    fn test_passwords() {
        let config = ListenerConfig::builder().password("secret").build();
        assert!(config.requires_auth());
        assert!(config.accepts("secret"));
        assert!(!config.accepts("Secret"));
    }

    #[test]
    fn test_broker_address() {
        let config = BrokerConfig::builder().host("::1").port(9000).build();
        assert_eq!(config.address(), "[::1]:9000");
        assert_eq!(BrokerConfig::default().address(), "localhost:8089");
    }
}
