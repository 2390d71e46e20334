//! Client side of the broker protocol
//!
//! ```rust,ignore
//! # async fn demo() -> nsbroker::Result<()> {
//! let conn = nsbroker::Connection::connect("localhost:8089/work").await?;
//! conn.exec("total = 6 * 7").await?;
//! let total = conn.eval("total").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Reading deferred results, polling and the namespace listings are not
//! protocol messages: they evaluate `broker.*` expressions in a namespace.
//! They work against brokers running the built-in script contexts, or a
//! custom [`ContextFactory`](crate::ContextFactory) whose contexts expose the
//! same `broker` services.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_net::TcpStream;
use smol::process::{Command, Stdio};

use crate::channel::Channel;
use crate::error::{BrokerError, Result};
use crate::hostspec::{Endpoint, HostSpec};
use crate::value::Value;
use crate::wire::{AsyncHandle, ExecuteRequest, ExecuteResult, Message, RecvCaps, ServerCommand};

/// Interval between polls while waiting for a deferred result
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long [`Connection::read_async`] waits for a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Return [`ReadOutcome::Busy`] if the result is not ready
    Immediate,
    /// Poll until the result is ready
    Forever,
    /// Poll until the result is ready or the duration has passed
    Timeout(Duration),
}

/// Result of reading a deferred execution
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Ready(Value),
    Busy,
}

/// A connection to a broker
pub struct Connection {
    channel: Arc<Channel>,
    namespace: String,
}

impl Connection {
    /// Connect to the broker named by a host spec or alias
    pub async fn connect(hostspec: &str) -> Result<Self> {
        Self::connect_with(hostspec, None, None).await
    }

    /// Connect, overriding the host spec's password and default namespace
    pub async fn connect_with(
        hostspec: &str,
        password: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<Self> {
        let spec = HostSpec::resolve(hostspec)?;
        let channel = match &spec.endpoint {
            Endpoint::Socket { .. } => {
                let address = spec.address().unwrap_or_default();
                tracing::debug!(address = %address, "connecting");
                Channel::from_tcp(TcpStream::connect(address.as_str()).await?)
            }
            Endpoint::Shell { command } => {
                tracing::debug!(command = %command, "spawning broker");
                let child = shell(command)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;
                Channel::from_child(child, format!("shell://{command}"))?
            }
        };

        let connection = Self {
            channel: Arc::new(channel),
            namespace: namespace.unwrap_or(spec.namespace.as_str()).to_string(),
        };
        if let Some(password) = password.or(spec.password.as_deref()) {
            connection.authenticate(password).await?;
        }
        Ok(connection)
    }

    /// Wrap an already connected channel
    pub fn from_channel(channel: Channel, namespace: impl Into<String>) -> Self {
        Self {
            channel: Arc::new(channel),
            namespace: namespace.into(),
        }
    }

    async fn authenticate(&self, password: &str) -> Result<()> {
        let reply = self
            .call(&Message::Authenticate {
                password: password.to_string(),
            })
            .await?;
        match reply {
            Message::AuthResult { success: true } => Ok(()),
            _ => {
                tracing::warn!(peer = %self.channel.peer(), "authentication rejected");
                self.channel.close();
                Err(BrokerError::AuthenticationFailed)
            }
        }
    }

    /// Send one message and read its reply under both channel locks
    async fn call(&self, msg: &Message) -> Result<Message> {
        let mut rx = self.channel.lock_recv().await;
        self.channel.send(msg).await?;
        rx.receive_payload().await
    }

    /// Send an execution request and return the raw reply
    pub async fn execute(&self, request: ExecuteRequest) -> Result<Message> {
        self.call(&Message::Execute(request.caps(RecvCaps::ALL))).await
    }

    async fn run(&self, request: ExecuteRequest) -> Result<Value> {
        match self.execute(request).await? {
            Message::ExecuteResult(result) => into_value(result),
            other => Err(unexpected(&other)),
        }
    }

    /// Run code in a namespace
    pub async fn exec_in(&self, namespace: &str, code: &str) -> Result<()> {
        self.run(ExecuteRequest::new(namespace, code)).await.map(drop)
    }

    /// Evaluate an expression in a namespace
    pub async fn eval_in(&self, namespace: &str, expr: &str) -> Result<Value> {
        self.run(ExecuteRequest::new(namespace, "").expr(expr)).await
    }

    /// Run code, then evaluate an expression, without holding the namespace lock
    pub async fn eval_unlocked_in(&self, namespace: &str, expr: &str) -> Result<Value> {
        self.run(ExecuteRequest::new(namespace, "").expr(expr).lock(false))
            .await
    }

    pub async fn exec(&self, code: &str) -> Result<()> {
        self.exec_in(&self.namespace, code).await
    }

    pub async fn eval(&self, expr: &str) -> Result<Value> {
        self.eval_in(&self.namespace, expr).await
    }

    /// Start a deferred execution and return its ticket
    pub async fn submit_in(
        &self,
        namespace: &str,
        code: &str,
        expr: Option<&str>,
    ) -> Result<AsyncHandle> {
        let mut request = ExecuteRequest::new(namespace, code).asynchronous(true);
        request.expr = expr.map(str::to_string);
        match self.execute(request).await? {
            Message::AsyncHandle(handle) => Ok(handle),
            // a request that failed before it could be deferred
            Message::ExecuteResult(result) => {
                into_value(result)?;
                Err(BrokerError::InvalidProtocol(
                    "deferred execution returned a result".to_string(),
                ))
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Take the result of a deferred execution
    ///
    /// A result can be read once; reading it again fails with an invalid
    /// result id error. Evaluates `broker.read_result(id)` in the handle's
    /// namespace without taking its lock.
    pub async fn read_async(&self, handle: &AsyncHandle, wait: Wait) -> Result<ReadOutcome> {
        let expr = format!("broker.read_result({})", Value::from(handle.id.as_str()));
        let deadline = match wait {
            Wait::Timeout(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };
        loop {
            match self.eval_unlocked_in(&handle.namespace, &expr).await? {
                Value::InProgress => {}
                value => return Ok(ReadOutcome::Ready(value)),
            }
            let expired = match wait {
                Wait::Immediate => true,
                Wait::Forever => false,
                Wait::Timeout(_) => deadline.is_some_and(|deadline| Instant::now() >= deadline),
            };
            if expired {
                return Ok(ReadOutcome::Busy);
            }
            async_io::Timer::after(POLL_INTERVAL).await;
        }
    }

    /// Ids of finished deferred executions in `namespace` (default: this connection's)
    ///
    /// Evaluates `broker.poll_results()` there.
    pub async fn poll_async(&self, namespace: Option<&str>) -> Result<Vec<String>> {
        let namespace = namespace.unwrap_or(&self.namespace);
        strings(self.eval_unlocked_in(namespace, "broker.poll_results()").await?)
    }

    async fn namespace_op(&self, msg: Message) -> Result<()> {
        match self.call(&msg).await? {
            Message::NamespaceResult { ok: true, .. } => Ok(()),
            Message::NamespaceResult { error, .. } => Err(BrokerError::NamespaceOperation(
                error.unwrap_or_else(|| "unknown error".to_string()),
            )),
            other => Err(unexpected(&other)),
        }
    }

    /// Offer `namespace` to the broker
    ///
    /// On success the broker sends execution requests for the namespace over
    /// this connection; serve it with a dispatcher from then on.
    pub async fn export_ns(&self, namespace: &str) -> Result<()> {
        self.namespace_op(Message::RegisterNamespace {
            namespace: namespace.to_string(),
        })
        .await
    }

    /// Subscribe this connection to a namespace of the broker
    pub async fn import_ns(&self, namespace: &str) -> Result<()> {
        self.namespace_op(Message::RequestNamespace {
            namespace: namespace.to_string(),
        })
        .await
    }

    pub async fn drop_ns(&self, namespace: &str) -> Result<()> {
        self.namespace_op(Message::DropNamespace {
            namespace: namespace.to_string(),
        })
        .await
    }

    async fn control(&self, command: ServerCommand) -> Result<(i32, String)> {
        match self.call(&Message::ServerControl(command)).await? {
            Message::ServerControlResult { status, message } if status >= 0 => {
                Ok((status, message))
            }
            Message::ServerControlResult { message, .. } => {
                Err(BrokerError::NamespaceOperation(message))
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Force-release a namespace lock
    ///
    /// Returns the broker's status code and message: 0 released, 1 already
    /// released, 2 not locked.
    pub async fn unlock_ns(&self, namespace: &str) -> Result<(i32, String)> {
        self.control(ServerCommand::Unlock {
            namespace: namespace.to_string(),
        })
        .await
    }

    /// Shut down the broker owning the default namespace
    pub async fn kill_server(&self) -> Result<()> {
        self.kill_server_of(&self.namespace).await
    }

    /// Shut down the broker owning `namespace`
    pub async fn kill_server_of(&self, namespace: &str) -> Result<()> {
        let command = ServerCommand::Die {
            namespace: namespace.to_string(),
        };
        match self.control(command).await {
            Ok(_) => Ok(()),
            // the broker may close before its reply arrives
            Err(BrokerError::Disconnected) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Names of the broker's local namespaces
    ///
    /// This and the other listings evaluate `broker.*` expressions in the
    /// default namespace, creating it if the broker allows that.
    pub async fn ls_local(&self) -> Result<Vec<String>> {
        strings(self.eval("broker.local_namespaces()").await?)
    }

    /// Names of the broker's remote namespaces
    pub async fn ls_remote(&self) -> Result<Vec<String>> {
        strings(self.eval("broker.remote_namespaces()").await?)
    }

    /// Remote namespaces mapped to the peers serving them
    pub async fn ls_remote_origins(&self) -> Result<BTreeMap<String, String>> {
        match self.eval("broker.remote_namespaces(True)").await? {
            Value::Map(map) => Ok(map
                .into_iter()
                .map(|(name, origin)| (name, origin.to_text()))
                .collect()),
            other => Err(unexpected_value(&other)),
        }
    }

    /// `"local"`, `"remote"`, or `None` if the broker does not know the namespace
    ///
    /// Evaluates `broker.namespace_type(name)` in the default namespace.
    pub async fn ns_type(&self, namespace: &str) -> Result<Option<String>> {
        let expr = format!("broker.namespace_type({})", Value::from(namespace));
        match self.eval(&expr).await? {
            Value::None => Ok(None),
            Value::Str(kind) => Ok(Some(kind)),
            other => Err(unexpected_value(&other)),
        }
    }

    /// Default namespace of [`exec`](Self::exec) and [`eval`](Self::eval)
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = namespace.into();
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Give up the client role, keeping the channel open
    pub fn into_channel(self) -> Arc<Channel> {
        self.channel
    }

    pub fn close(self) {
        self.channel.close();
    }
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

fn into_value(result: ExecuteResult) -> Result<Value> {
    if let Some(err) = result.code_error {
        return Err(BrokerError::RemoteExec(err));
    }
    if let Some(err) = result.expr_error {
        return Err(BrokerError::RemoteEval(err));
    }
    Ok(result.value)
}

fn unexpected(msg: &Message) -> BrokerError {
    BrokerError::InvalidProtocol(format!("unexpected reply {msg}"))
}

fn unexpected_value(value: &Value) -> BrokerError {
    BrokerError::InvalidProtocol(format!("unexpected value {value}"))
}

fn strings(value: Value) -> Result<Vec<String>> {
    match value {
        Value::List(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Str(s) => Ok(s),
                other => Err(unexpected_value(&other)),
            })
            .collect(),
        other => Err(unexpected_value(&other)),
    }
}
