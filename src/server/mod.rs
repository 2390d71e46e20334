//! Broker server: accept loop, startup tasks and connection dispatch
//!
//! A [`Broker`] accepts TCP connections (or serves a single connection over
//! stdin/stdout) and runs one dispatcher task per connection. Accepted
//! connections, wake-ups and stdin activity all arrive through one event
//! queue; a wake-up or the loss of the listening socket ends the loop, after
//! which every namespace is dropped.

mod auth;
mod dispatch;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_net::{TcpListener, TcpStream};
use futures_lite::io::{AsyncBufReadExt, BufReader};
use smol::channel::{Receiver, Sender};

use crate::channel::Channel;
use crate::client::Connection;
use crate::config::{BrokerConfig, ListenerConfig, StartupTask};
use crate::context::{ContextFactory, script_contexts};
use crate::error::{BrokerError, Result};
use crate::registry::Registry;

pub use auth::Credential;
use dispatch::Dispatcher;

/// Something the accept loop reacts to
#[derive(Debug)]
enum Event {
    Accepted(TcpStream, SocketAddr),
    /// Shut down
    Wake,
    ListenerLost(io::Error),
    /// A line on stdin; only proves the parent is alive
    Stdin,
}

/// State shared by the accept loop and all dispatchers
pub(crate) struct Shared {
    pub(crate) registry: Arc<Registry>,
    events: Sender<Event>,
}

impl Shared {
    /// Ask the accept loop to shut down
    pub(crate) fn wake(&self) {
        let _ = self.events.try_send(Event::Wake);
    }
}

/// Handle that stops a running broker
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    events: Sender<Event>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.events.try_send(Event::Wake);
    }
}

/// A namespace broker
pub struct Broker {
    config: BrokerConfig,
    shared: Arc<Shared>,
    events: Receiver<Event>,
}

impl Broker {
    /// Create a broker whose namespaces run [`ScriptContext`](crate::ScriptContext)s
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_factory(config, script_contexts())
    }

    /// Create a broker with a custom execution context factory
    pub fn with_factory(config: BrokerConfig, factory: Arc<dyn ContextFactory>) -> Self {
        let (sender, events) = smol::channel::unbounded();
        Self {
            config,
            shared: Arc::new(Shared {
                registry: Registry::new(factory),
                events: sender,
            }),
            events,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            events: self.shared.events.clone(),
        }
    }

    /// Run the configured startup tasks in order
    pub async fn prepare(&self) -> Result<()> {
        for task in self.config.tasks() {
            match task {
                StartupTask::Init { namespace, code } => {
                    self.init_namespace(namespace, code.as_deref()).await?
                }
                StartupTask::Export {
                    namespace,
                    hostspec,
                } => self.export_namespace(namespace, hostspec).await?,
                StartupTask::Import {
                    namespace,
                    hostspec,
                } => self.import_namespace(namespace, hostspec).await?,
            }
        }
        Ok(())
    }

    /// Create a local namespace and run `code` in it
    pub async fn init_namespace(&self, namespace: &str, code: Option<&str>) -> Result<()> {
        self.shared.registry.init_namespace(namespace, code).await
    }

    /// Offer a local namespace to the broker at `hostspec`
    ///
    /// The connection is then served like an accepted one, except that its
    /// loss shuts this broker down.
    pub async fn export_namespace(&self, namespace: &str, hostspec: &str) -> Result<()> {
        let registry = &self.shared.registry;
        if registry.kind(namespace).is_none() {
            registry.init_namespace(namespace, None).await?;
        }
        tracing::info!(namespace, hostspec, "exporting namespace");

        let connection = Connection::connect(hostspec).await?;
        connection.export_ns(namespace).await?;
        let channel = connection.into_channel();
        registry.subscribe(namespace, channel.clone())?;
        self.spawn_dispatcher(channel, ListenerConfig::default().killing_on_close());
        Ok(())
    }

    /// Make a namespace of the broker at `hostspec` reachable here
    pub async fn import_namespace(&self, namespace: &str, hostspec: &str) -> Result<()> {
        let registry = &self.shared.registry;
        if registry.kind(namespace).is_some() {
            return Err(BrokerError::NamespaceAlreadyRegistered(namespace.to_string()));
        }
        tracing::info!(namespace, hostspec, "importing namespace");

        let connection = Connection::connect(hostspec).await?;
        connection.import_ns(namespace).await?;
        registry.register_remote(namespace, connection.into_channel())
    }

    fn spawn_dispatcher(&self, channel: Arc<Channel>, listener: ListenerConfig) {
        let dispatcher = Dispatcher::new(self.shared.clone(), channel, listener);
        smol::spawn(dispatcher.run()).detach();
    }

    /// Serve one connection over an existing channel, in the background
    pub fn serve_channel(&self, channel: Channel, listener: ListenerConfig) {
        self.spawn_dispatcher(Arc::new(channel), listener);
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let address = self.config.address();
        TcpListener::bind(address.as_str()).await.map_err(|err| {
            tracing::error!(address = %address, error = %err, "bind failed");
            BrokerError::Io(err)
        })
    }

    /// Run startup tasks, bind and serve until shut down
    pub async fn run(&self) -> Result<()> {
        self.prepare().await?;
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shut down, then drop all namespaces
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let address = listener.local_addr()?;
        tracing::info!(address = %address, pid = std::process::id(), "listening");

        let acceptor = smol::spawn(accept_events(listener, self.shared.events.clone()));
        let stdin_watch = self.config.listen_stdin().then(|| {
            tracing::info!("listening to stdin");
            smol::spawn(stdin_events(self.shared.events.clone()))
        });

        loop {
            match self.events.recv().await {
                Ok(Event::Accepted(stream, peer)) => {
                    tracing::debug!(peer = %peer, "accepted connection");
                    self.spawn_dispatcher(
                        Arc::new(Channel::from_tcp(stream)),
                        self.config.listener().clone(),
                    );
                }
                Ok(Event::Wake) => {
                    tracing::info!("shutting down");
                    break;
                }
                Ok(Event::ListenerLost(err)) => {
                    tracing::error!(error = %err, "listener lost");
                    break;
                }
                Ok(Event::Stdin) => tracing::trace!("stdin activity"),
                Err(_) => break,
            }
        }

        drop(acceptor);
        drop(stdin_watch);
        self.shared.registry.drain().await;
        Ok(())
    }

    /// Serve a single connection over this process's stdin and stdout
    pub async fn serve_stdio(&self) -> Result<()> {
        self.prepare().await?;
        tracing::info!("serving stdio");
        let dispatcher = Dispatcher::new(
            self.shared.clone(),
            Arc::new(Channel::stdio()),
            self.config.listener().clone(),
        );
        dispatcher.run().await;
        self.shared.registry.drain().await;
        Ok(())
    }
}

async fn accept_events(listener: TcpListener, events: Sender<Event>) {
    loop {
        let event = match listener.accept().await {
            Ok((stream, peer)) => Event::Accepted(stream, peer),
            Err(err) => Event::ListenerLost(err),
        };
        let lost = matches!(event, Event::ListenerLost(_));
        if events.send(event).await.is_err() || lost {
            return;
        }
    }
}

async fn stdin_events(events: Sender<Event>) {
    let mut lines = BufReader::new(blocking::Unblock::new(std::io::stdin())).lines();
    while let Some(Ok(_)) = futures_lite::StreamExt::next(&mut lines).await {
        if events.send(Event::Stdin).await.is_err() {
            return;
        }
    }
    tracing::debug!("stdin closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Connection, ReadOutcome, Wait};
    use crate::registry::NamespaceKind;
    use crate::value::Value;
    use crate::wire::{ExecuteRequest, ExecuteResult, MAX_FRAME_LEN, Message, RecvCaps};

    struct Running {
        address: String,
        handle: ShutdownHandle,
        task: smol::Task<Result<()>>,
        registry: Arc<Registry>,
    }

    impl Running {
        async fn stop(self) {
            self.handle.shutdown();
            self.task.await.unwrap();
        }
    }

    async fn start(config: BrokerConfig) -> Running {
        let broker = Broker::new(config);
        broker.prepare().await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = broker.shutdown_handle();
        let registry = broker.registry().clone();
        let task = smol::spawn(async move { broker.serve(listener).await });
        Running {
            address,
            handle,
            task,
            registry,
        }
    }

    async fn start_default() -> Running {
        start(BrokerConfig::default()).await
    }

    #[tokio::test]
    async fn test_eval_and_errors() {
        let server = start_default().await;
        let conn = Connection::connect(&server.address).await.unwrap();

        assert_eq!(conn.eval("6*7").await.unwrap(), Value::Int(42));
        let err = conn.eval("1/0").await.unwrap_err();
        assert!(matches!(
            &err,
            BrokerError::RemoteEval(text) if text == "ZeroDivisionError: division by zero"
        ));
        let err = conn.exec("fail('x')").await.unwrap_err();
        assert!(matches!(err, BrokerError::RemoteExec(_)));

        conn.exec_in("other", "y = 2").await.unwrap();
        let mut names = conn.ls_local().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["default".to_string(), "other".to_string()]);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_authentication() {
        let config = BrokerConfig::builder()
            .listener(ListenerConfig::builder().password("secret").build())
            .build();
        let server = start(config).await;

        let good = format!("secret@{}", server.address);
        let conn = Connection::connect(&good).await.unwrap();
        assert_eq!(conn.eval("1 + 1").await.unwrap(), Value::Int(2));

        let bad = format!("wrong@{}", server.address);
        assert!(matches!(
            Connection::connect(&bad).await,
            Err(BrokerError::AuthenticationFailed)
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unexpected_message_closes_connection() {
        let server = start_default().await;
        let stream = TcpStream::connect(server.address.as_str()).await.unwrap();
        let channel = Channel::from_tcp(stream);
        channel
            .send(&Message::AuthResult { success: true })
            .await
            .unwrap();
        assert_eq!(
            channel.receive().await.unwrap(),
            Message::AuthResult { success: false }
        );
        assert!(channel.receive().await.is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_creation_policy() {
        let config = BrokerConfig::builder()
            .listener(
                ListenerConfig::builder()
                    .namespace_whitelist(["allowed"])
                    .build(),
            )
            .task(StartupTask::Init {
                namespace: "existing".into(),
                code: Some("x = 3".into()),
            })
            .build();
        let server = start(config).await;
        let conn = Connection::connect(&server.address).await.unwrap();

        assert_eq!(conn.eval_in("existing", "x").await.unwrap(), Value::Int(3));
        conn.exec_in("allowed", "y = 1").await.unwrap();
        let err = conn.exec_in("denied", "y = 1").await.unwrap_err();
        assert!(err.to_string().contains("unknown namespace"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_async_read_once() {
        let server = start_default().await;
        let conn = Connection::connect(&server.address).await.unwrap();

        let handle = conn.submit_in("default", "sleep(0.3)", Some("6*7")).await.unwrap();
        assert!(matches!(
            conn.read_async(&handle, Wait::Immediate).await.unwrap(),
            ReadOutcome::Busy
        ));
        let value = conn.read_async(&handle, Wait::Forever).await.unwrap();
        assert_eq!(value, ReadOutcome::Ready(Value::Int(42)));
        let err = conn.read_async(&handle, Wait::Immediate).await.unwrap_err();
        assert!(err.to_string().contains("invalid result id"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_large_results_stream_with_and_without_compression() {
        let server = start_default().await;
        let conn = Connection::connect(&server.address).await.unwrap();
        conn.exec("big = 'xyz' * 200000").await.unwrap();

        let value = conn.eval("big").await.unwrap();
        assert_eq!(value, Value::Str("xyz".repeat(200_000)));

        // a raw caller without streaming still gets one ordinary frame
        let stream = TcpStream::connect(server.address.as_str()).await.unwrap();
        let raw = Channel::from_tcp(stream);
        let request = ExecuteRequest::new("default", "").expr("big").caps(RecvCaps::NONE);
        raw.send(&Message::Execute(request)).await.unwrap();
        match raw.receive().await.unwrap() {
            Message::ExecuteResult(result) => {
                assert_eq!(result.value, Value::Str("xyz".repeat(200_000)))
            }
            other => panic!("unexpected {other}"),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_oversize_result_is_replaced() {
        let server = start_default().await;
        let huge = format!("'x' * {}", MAX_FRAME_LEN + 1);

        let conn = Connection::connect(&server.address).await.unwrap();
        match conn.eval(&huge).await.unwrap() {
            Value::Unserializable(text) => assert!(text.starts_with("'xxx") && text.len() < 10_000),
            other => panic!("unexpected {other}"),
        }
        assert_eq!(conn.eval("6*7").await.unwrap(), Value::Int(42));

        let stream = TcpStream::connect(server.address.as_str()).await.unwrap();
        let raw = Channel::from_tcp(stream);
        let request = ExecuteRequest::new("default", "").expr(huge).caps(RecvCaps::NONE);
        raw.send(&Message::Execute(request)).await.unwrap();
        match raw.receive().await.unwrap() {
            Message::ExecuteResult(result) => {
                assert!(matches!(result.value, Value::Unserializable(_)))
            }
            other => panic!("unexpected {other}"),
        }
        let request = ExecuteRequest::new("default", "").expr("6*7").caps(RecvCaps::NONE);
        raw.send(&Message::Execute(request)).await.unwrap();
        assert_eq!(
            raw.receive().await.unwrap(),
            Message::ExecuteResult(ExecuteResult::value(Value::Int(42)))
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unloadable_remote_reply_fails_the_call() {
        let server = start_default().await;

        // a peer serving "far" that answers with a body nobody can decode
        let stream = TcpStream::connect(server.address.as_str()).await.unwrap();
        let peer = Channel::from_tcp(stream);
        peer.send(&Message::RegisterNamespace {
            namespace: "far".into(),
        })
        .await
        .unwrap();
        assert_eq!(peer.receive().await.unwrap(), Message::namespace_ok());
        let peer_task = smol::spawn(async move {
            assert!(matches!(peer.receive().await.unwrap(), Message::Execute(_)));
            let mut tx = peer.lock_send().await;
            tx.write_raw(&[0, 0, 0, 2, 0xc1, 0xc1]).await.unwrap();
            drop(tx);
            peer
        });

        let stream = TcpStream::connect(server.address.as_str()).await.unwrap();
        let raw = Channel::from_tcp(stream);
        let request = ExecuteRequest::new("far", "").expr("1").caps(RecvCaps::NONE);
        raw.send(&Message::Execute(request)).await.unwrap();
        match raw.receive().await.unwrap() {
            Message::ExecuteResult(result) => {
                let error = result.expr_error.unwrap();
                assert!(error.contains("could not be loaded"), "{error}");
            }
            other => panic!("unexpected {other}"),
        }
        let _peer = peer_task.await;

        // the caller is still served
        let request = ExecuteRequest::new("default", "").expr("6*7").caps(RecvCaps::NONE);
        raw.send(&Message::Execute(request)).await.unwrap();
        assert_eq!(
            raw.receive().await.unwrap(),
            Message::ExecuteResult(ExecuteResult::value(Value::Int(42)))
        );
        assert_eq!(server.registry.kind("far"), Some(NamespaceKind::Remote));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_die_stops_server_and_drains() {
        let server = start_default().await;
        let conn = Connection::connect(&server.address).await.unwrap();
        conn.exec("x = 1").await.unwrap();
        conn.kill_server().await.unwrap();
        server.task.await.unwrap();
        assert!(server.registry.local_names().is_empty());
    }

    #[tokio::test]
    async fn test_federation_through_import() {
        let origin = start_default().await;
        let direct = Connection::connect(&origin.address).await.unwrap();
        direct.exec_in("shared", "greeting = 'hi'").await.unwrap();

        let hostspec = format!("{}/shared", origin.address);
        let config = BrokerConfig::builder()
            .task(StartupTask::Import {
                namespace: "shared".into(),
                hostspec,
            })
            .build();
        let relay = start(config).await;

        let conn = Connection::connect(&relay.address).await.unwrap();
        assert_eq!(conn.eval_in("shared", "greeting").await.unwrap(), Value::from("hi"));
        assert_eq!(conn.ns_type("shared").await.unwrap().as_deref(), Some("remote"));

        let err = conn.eval_in("shared", "missing").await.unwrap_err();
        assert!(matches!(
            &err,
            BrokerError::RemoteEval(text) if text == "NameError: name 'missing' is not defined"
        ));

        // large values relay as streams through the middle broker
        conn.exec_in("shared", "blob = 'ab' * 300000").await.unwrap();
        let blob = conn.eval_in("shared", "blob").await.unwrap();
        assert_eq!(blob, Value::Str("ab".repeat(300_000)));

        // dropping on the origin closes the import; the next use tells the
        // caller, forgets the namespace and ends the caller's connection
        direct.drop_ns("shared").await.unwrap();
        let err = conn.eval_in("shared", "1").await.unwrap_err();
        assert!(matches!(
            &err,
            BrokerError::RemoteExec(text) if text == "no connection to namespace \"shared\""
        ));
        assert_eq!(relay.registry.kind("shared"), None);
        assert!(conn.eval("6*7").await.is_err());

        let fresh = Connection::connect(&relay.address).await.unwrap();
        assert_eq!(fresh.eval("6*7").await.unwrap(), Value::Int(42));
        assert_eq!(fresh.ns_type("shared").await.unwrap(), None);

        relay.stop().await;
        origin.stop().await;
    }

    #[tokio::test]
    async fn test_federation_through_export() {
        let hub = start_default().await;

        let hostspec = hub.address.clone();
        let config = BrokerConfig::builder()
            .task(StartupTask::Init {
                namespace: "worker".into(),
                code: Some("jobs = 7".into()),
            })
            .task(StartupTask::Export {
                namespace: "worker".into(),
                hostspec,
            })
            .build();
        let exporter = start(config).await;

        let conn = Connection::connect(&hub.address).await.unwrap();
        assert_eq!(conn.ls_remote().await.unwrap(), vec!["worker".to_string()]);
        assert_eq!(conn.eval_in("worker", "jobs * 6").await.unwrap(), Value::Int(42));
        let (status, _) = conn.unlock_ns("worker").await.unwrap();
        assert_eq!(status, 1);

        // the hub going away shuts the exporter down
        hub.stop().await;
        exporter.task.await.unwrap();
        assert!(exporter.registry.local_names().is_empty());
    }
}
