//! Namespace registry and execution engine
//!
//! The [`Registry`] tracks which namespaces are local and which are reached
//! through a remote connection, which connections subscribed to a namespace,
//! and which connections used which namespaces. It runs code in local
//! namespaces on the blocking thread pool.

mod namespace;
mod services;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::channel::{Channel, ChannelId};
use crate::context::{ContextFactory, ExecutionContext, Host};
use crate::error::{BrokerError, Result};
use crate::lock;
use crate::value::Value;
use crate::wire::{AsyncHandle, ExecuteRequest, ExecuteResult, Message};

pub use namespace::{DisconnectHook, LocalNamespace, NamespaceLock, NamespaceLockGuard, UnlockStatus};
pub use services::SERVICE_PREFIX;
use services::Services;

/// Where a namespace lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    Local,
    Remote,
}

impl NamespaceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// A namespace served by the peer at the other end of a channel
#[derive(Debug, Clone)]
pub struct RemoteNamespace {
    pub channel: Arc<Channel>,
    /// Peer description, for listings and logs
    pub origin: String,
}

/// All namespaces known to a broker
pub struct Registry {
    local: std::sync::Mutex<BTreeMap<String, Arc<LocalNamespace>>>,
    remote: std::sync::Mutex<BTreeMap<String, RemoteNamespace>>,
    exports: std::sync::Mutex<HashMap<String, Vec<Arc<Channel>>>>,
    users: std::sync::Mutex<HashMap<ChannelId, BTreeSet<String>>>,
    factory: Arc<dyn ContextFactory>,
    next_result: AtomicU64,
}

impl Registry {
    pub fn new(factory: Arc<dyn ContextFactory>) -> Arc<Self> {
        Arc::new(Self {
            local: Default::default(),
            remote: Default::default(),
            exports: Default::default(),
            users: Default::default(),
            factory,
            next_result: AtomicU64::new(0),
        })
    }

    pub fn kind(&self, name: &str) -> Option<NamespaceKind> {
        if lock(&self.local).contains_key(name) {
            Some(NamespaceKind::Local)
        } else if lock(&self.remote).contains_key(name) {
            Some(NamespaceKind::Remote)
        } else {
            None
        }
    }

    pub fn local(&self, name: &str) -> Option<Arc<LocalNamespace>> {
        lock(&self.local).get(name).cloned()
    }

    pub fn remote(&self, name: &str) -> Option<RemoteNamespace> {
        lock(&self.remote).get(name).cloned()
    }

    pub fn local_names(&self) -> Vec<String> {
        lock(&self.local).keys().cloned().collect()
    }

    pub fn remote_names(&self) -> Vec<String> {
        lock(&self.remote).keys().cloned().collect()
    }

    /// Remote namespace names with the peer each is reached through
    pub fn remote_origins(&self) -> Vec<(String, String)> {
        lock(&self.remote)
            .iter()
            .map(|(name, remote)| (name.clone(), remote.origin.clone()))
            .collect()
    }

    /// Look up a local namespace, creating it when allowed
    pub fn local_or_create(&self, name: &str, allow_create: bool) -> Result<Arc<LocalNamespace>> {
        let mut local = lock(&self.local);
        if let Some(namespace) = local.get(name) {
            return Ok(namespace.clone());
        }
        if !allow_create {
            return Err(BrokerError::NamespaceUnknown(name.to_string()));
        }
        if lock(&self.remote).contains_key(name) {
            return Err(BrokerError::NamespaceAlreadyRegistered(name.to_string()));
        }

        let namespace = Arc::new(LocalNamespace::new(name, self.factory.create(name)));
        local.insert(name.to_string(), namespace.clone());
        tracing::info!(namespace = name, "added local namespace");
        Ok(namespace)
    }

    /// Record that `channel` serves namespace `name`
    pub fn register_remote(&self, name: &str, channel: Arc<Channel>) -> Result<()> {
        let local = lock(&self.local);
        let mut remote = lock(&self.remote);
        if local.contains_key(name) || remote.contains_key(name) {
            return Err(BrokerError::NamespaceAlreadyRegistered(name.to_string()));
        }
        let origin = channel.peer().to_string();
        tracing::info!(namespace = name, origin = %origin, "added remote namespace");
        remote.insert(name.to_string(), RemoteNamespace { channel, origin });
        Ok(())
    }

    /// Forget a remote namespace whose channel died
    ///
    /// Only removes the registration if it still belongs to `channel`, so a
    /// namespace re-registered over a new channel survives late reports
    /// about the old one.
    pub fn lose_remote(&self, name: &str, channel: ChannelId) -> bool {
        let removed = {
            let mut remote = lock(&self.remote);
            match remote.get(name) {
                Some(entry) if entry.channel.id() == channel => remote.remove(name),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                tracing::warn!(namespace = name, origin = %entry.origin, "connection lost to remote namespace");
                entry.channel.close();
                self.notify_exports(name);
                true
            }
            None => false,
        }
    }

    /// Add `channel` to the connections told when `name` goes away
    pub fn subscribe(&self, name: &str, channel: Arc<Channel>) -> Result<()> {
        if self.kind(name).is_none() {
            return Err(BrokerError::NamespaceUnknown(name.to_string()));
        }
        tracing::debug!(namespace = name, channel = %channel.id(), "namespace subscribed");
        lock(&self.exports)
            .entry(name.to_string())
            .or_default()
            .push(channel);
        Ok(())
    }

    pub fn unsubscribe(&self, channel: ChannelId) {
        let mut exports = lock(&self.exports);
        for subscribers in exports.values_mut() {
            subscribers.retain(|c| c.id() != channel);
        }
        exports.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Close every channel subscribed to `name`
    fn notify_exports(&self, name: &str) {
        let subscribers = lock(&self.exports).remove(name).unwrap_or_default();
        for channel in subscribers {
            tracing::debug!(namespace = name, channel = %channel.id(), "closing subscriber");
            channel.close();
        }
    }

    fn next_result_id(&self) -> String {
        let counter = self.next_result.fetch_add(1, Ordering::Relaxed);
        format!("{counter:x}-{:08x}", rand::random::<u32>())
    }

    /// Execute a request in a local namespace
    ///
    /// Replies with `ExecuteResult`, or with `AsyncHandle` for asynchronous
    /// requests. Fails only when the namespace is unknown and may not be
    /// created.
    pub async fn execute(
        self: &Arc<Self>,
        request: ExecuteRequest,
        caller: Option<ChannelId>,
        allow_create: bool,
    ) -> Result<Message> {
        let namespace = self.local_or_create(&request.namespace, allow_create)?;
        if let Some(caller) = caller {
            lock(&self.users)
                .entry(caller)
                .or_default()
                .insert(request.namespace.clone());
        }

        if !request.is_async {
            let result = self
                .run_in(&namespace, request.code, request.expr, request.lock, caller)
                .await;
            return Ok(Message::ExecuteResult(result));
        }

        let id = self.next_result_id();
        namespace.begin_deferred(&id);
        let handle = AsyncHandle::new(request.namespace.clone(), id.clone());
        let registry = self.clone();
        smol::spawn(async move {
            let result = registry
                .run_in(&namespace, request.code, request.expr, request.lock, caller)
                .await;
            tracing::debug!(namespace = namespace.name(), id = %id, "deferred execution finished");
            namespace.complete_deferred(&id, result);
        })
        .detach();
        Ok(Message::AsyncHandle(handle))
    }

    /// Run code, then evaluate the expression, optionally under the namespace lock
    async fn run_in(
        self: &Arc<Self>,
        namespace: &Arc<LocalNamespace>,
        code: String,
        expr: Option<String>,
        locked: bool,
        caller: Option<ChannelId>,
    ) -> ExecuteResult {
        let _guard = if locked {
            match namespace.lock().acquire().await {
                Some(guard) => Some(guard),
                None => {
                    let err = BrokerError::LockAcquisitionFailed(namespace.name().to_string());
                    return ExecuteResult::failed(err.to_string());
                }
            }
        } else {
            None
        };

        let services = Services::new(self.clone(), namespace.clone(), caller);
        let context = namespace.context().clone();
        blocking::unblock(move || evaluate(&*context, &code, expr.as_deref(), &services)).await
    }

    /// Take the result of a deferred execution
    pub fn read_result(&self, namespace: &str, id: &str) -> Result<Value> {
        let namespace = self
            .local(namespace)
            .ok_or_else(|| BrokerError::NamespaceUnknown(namespace.to_string()))?;
        namespace
            .read_deferred(id)
            .ok_or_else(|| BrokerError::InvalidResultId(id.to_string()))
    }

    /// Force-release the lock of a local namespace
    pub fn unlock(&self, name: &str) -> (i32, String) {
        let Some(namespace) = self.local(name) else {
            return (-1, format!("unknown namespace '{name}'"));
        };
        let status = namespace.lock().force_unlock();
        let message = match status {
            UnlockStatus::Released => format!("'{name}' unlocked"),
            UnlockStatus::AlreadyUnlocked => format!("'{name}' already unlocked"),
            UnlockStatus::NotLocked => format!("namespace '{name}' is not locked"),
        };
        tracing::info!(namespace = name, status = status.code(), "unlock requested");
        (status.code(), message)
    }

    /// Drop a namespace
    ///
    /// A remote namespace is forgotten and its channel closed. A local one is
    /// removed first, then its on-drop hooks run, then its lock is closed,
    /// failing every execution still waiting for it. Subscribers are closed
    /// in both cases.
    pub async fn drop_namespace(self: &Arc<Self>, name: &str) -> Result<()> {
        let remote = lock(&self.remote).remove(name);
        if let Some(remote) = remote {
            tracing::info!(namespace = name, "drop remote namespace");
            remote.channel.close();
            self.notify_exports(name);
            return Ok(());
        }

        let namespace = lock(&self.local)
            .remove(name)
            .ok_or_else(|| BrokerError::NamespaceUnknown(name.to_string()))?;
        tracing::info!(namespace = name, "drop local namespace");
        for code in namespace.drop_hooks() {
            let result = self.run_in(&namespace, code, None, true, None).await;
            if !result.is_ok() {
                tracing::warn!(namespace = name, %result, "on-drop hook failed");
            }
        }
        namespace.lock().close();
        namespace.clear_deferred();
        for used in lock(&self.users).values_mut() {
            used.remove(name);
        }
        self.notify_exports(name);
        Ok(())
    }

    /// Run the on-disconnect hooks of every namespace `caller` used
    pub async fn disconnect(self: &Arc<Self>, caller: ChannelId) {
        let used = lock(&self.users).remove(&caller).unwrap_or_default();
        for name in used {
            let Some(namespace) = self.local(&name) else {
                continue;
            };
            for code in namespace.disconnect_hooks_for(caller) {
                let result = self.run_in(&namespace, code, None, true, None).await;
                tracing::debug!(namespace = %name, caller = %caller, %result, "on-disconnect hook");
            }
            namespace.remove_hooks_of(caller);
        }
        self.unsubscribe(caller);
    }

    /// Create a namespace regardless of listener policy and run its init code
    pub async fn init_namespace(self: &Arc<Self>, name: &str, code: Option<&str>) -> Result<()> {
        let namespace = self.local_or_create(name, true)?;
        if let Some(code) = code {
            let result = self.run_in(&namespace, code.to_string(), None, true, None).await;
            if let Some(err) = result.code_error {
                tracing::error!(namespace = name, error = %err, "namespace init code failed");
            }
        }
        Ok(())
    }

    /// Drop every remote, then every local namespace
    pub async fn drain(self: &Arc<Self>) {
        for name in self.remote_names().into_iter().chain(self.local_names()) {
            if let Err(err) = self.drop_namespace(&name).await {
                tracing::debug!(namespace = %name, error = %err, "drain skipped namespace");
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("local", &self.local_names())
            .field("remote", &self.remote_names())
            .finish_non_exhaustive()
    }
}

/// Run code then evaluate the expression; a nested result replaces the outer one
fn evaluate(
    context: &dyn ExecutionContext,
    code: &str,
    expr: Option<&str>,
    host: &dyn Host,
) -> ExecuteResult {
    let mut result = ExecuteResult::default();
    if !code.is_empty() {
        if let Err(err) = context.run(code, host) {
            result.code_error = Some(err.to_string());
        }
    }
    if let Some(expr) = expr.filter(|expr| !expr.is_empty()) {
        match context.eval(expr, host) {
            Ok(Value::Result(nested)) => return *nested,
            Ok(value) => result.value = value,
            Err(err) => result.expr_error = Some(err.to_string()),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{EvalError, script_contexts};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn registry() -> Arc<Registry> {
        Registry::new(script_contexts())
    }

    async fn run(registry: &Arc<Registry>, request: ExecuteRequest) -> ExecuteResult {
        match registry.execute(request, None, true).await.unwrap() {
            Message::ExecuteResult(result) => result,
            other => panic!("unexpected reply {other}"),
        }
    }

    async fn submit(registry: &Arc<Registry>, request: ExecuteRequest) -> AsyncHandle {
        match registry.execute(request.asynchronous(true), None, true).await.unwrap() {
            Message::AsyncHandle(handle) => handle,
            other => panic!("unexpected reply {other}"),
        }
    }

    #[tokio::test]
    async fn test_code_and_expression() {
        let registry = registry();
        let result = run(&registry, ExecuteRequest::new("n", "").expr("6*7")).await;
        assert_eq!(result, ExecuteResult::value(Value::Int(42)));

        let result = run(&registry, ExecuteRequest::new("n", "x = 1/0").expr("x")).await;
        assert_eq!(
            result.code_error.as_deref(),
            Some("ZeroDivisionError: division by zero")
        );
        assert_eq!(
            result.expr_error.as_deref(),
            Some("NameError: name 'x' is not defined")
        );
    }

    #[tokio::test]
    async fn test_unknown_namespace_without_creation() {
        let registry = registry();
        let err = registry
            .execute(ExecuteRequest::new("missing", "x = 1"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NamespaceUnknown(name) if name == "missing"));
        assert_eq!(registry.kind("missing"), None);
    }

    #[tokio::test]
    async fn test_async_result_is_read_once() {
        let registry = registry();
        let handle = submit(&registry, ExecuteRequest::new("n", "x = 5").expr("x * 2")).await;

        let value = loop {
            match registry.read_result("n", &handle.id).unwrap() {
                Value::InProgress => async_io::Timer::after(Duration::from_millis(5)).await,
                value => break value,
            };
        };
        assert_eq!(
            value,
            Value::Result(Box::new(ExecuteResult::value(Value::Int(10))))
        );
        assert!(matches!(
            registry.read_result("n", &handle.id),
            Err(BrokerError::InvalidResultId(_))
        ));
    }

    #[tokio::test]
    async fn test_read_result_service_returns_nested_result() {
        let registry = registry();
        let handle = submit(&registry, ExecuteRequest::new("n", "").expr("1/0")).await;
        let namespace = registry.local("n").unwrap();
        while namespace.completed_ids().is_empty() {
            async_io::Timer::after(Duration::from_millis(5)).await;
        }

        let polled = run(&registry, ExecuteRequest::new("n", "").expr("broker.poll_results()")).await;
        assert_eq!(polled.value, Value::from(vec![handle.id.clone()]));

        let expr = format!("broker.read_result('{}')", handle.id);
        let result = run(&registry, ExecuteRequest::new("n", "").expr(expr.clone()).lock(false)).await;
        assert_eq!(
            result.expr_error.as_deref(),
            Some("ZeroDivisionError: division by zero")
        );

        let again = run(&registry, ExecuteRequest::new("n", "").expr(expr)).await;
        assert!(again.expr_error.unwrap().contains("invalid result id"));
    }

    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ExecutionContext for Gauge {
        fn run(&self, _code: &str, _host: &dyn Host) -> std::result::Result<(), EvalError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn eval(&self, _expr: &str, _host: &dyn Host) -> std::result::Result<Value, EvalError> {
            Ok(Value::None)
        }
    }

    async fn peak_concurrency(locked: bool, asynchronous: bool) -> usize {
        let gauge = Arc::new(Gauge {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let shared = gauge.clone();
        let registry = Registry::new(Arc::new(move |_: &str| {
            shared.clone() as Arc<dyn ExecutionContext>
        }));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                smol::spawn(async move {
                    let request = ExecuteRequest::new("n", "work")
                        .lock(locked)
                        .asynchronous(asynchronous);
                    registry.execute(request, None, true).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        if asynchronous {
            let namespace = registry.local("n").unwrap();
            while namespace.completed_ids().len() < 8 {
                async_io::Timer::after(Duration::from_millis(5)).await;
            }
        }
        gauge.peak.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_locked_executions_never_overlap() {
        assert_eq!(peak_concurrency(true, false).await, 1);
        assert!(peak_concurrency(false, false).await > 1);
    }

    #[tokio::test]
    async fn test_deferred_locked_executions_run_serially() {
        assert_eq!(peak_concurrency(true, true).await, 1);
    }

    #[tokio::test]
    async fn test_long_flat_chain_is_a_syntax_error() {
        let registry = registry();
        let chain = vec!["1"; 300_000].join("+");
        let result = run(&registry, ExecuteRequest::new("n", "").expr(chain)).await;
        assert!(result.expr_error.unwrap().starts_with("SyntaxError"));

        let result = run(&registry, ExecuteRequest::new("n", "").expr("1+1+1")).await;
        assert_eq!(result.value, Value::Int(3));
    }

    #[tokio::test]
    async fn test_drop_fails_waiting_executions() {
        let registry = registry();
        registry.init_namespace("n", None).await.unwrap();
        let namespace = registry.local("n").unwrap();
        let held = namespace.lock().acquire().await.unwrap();

        let waiting = {
            let registry = registry.clone();
            smol::spawn(async move { run(&registry, ExecuteRequest::new("n", "x = 1")).await })
        };
        async_io::Timer::after(Duration::from_millis(20)).await;
        registry.drop_namespace("n").await.unwrap();
        drop(held);

        let result = waiting.await;
        assert_eq!(
            result.code_error.as_deref(),
            Some("locking namespace \"n\" failed")
        );
        assert_eq!(result.code_error, result.expr_error);
        assert!(matches!(
            registry.drop_namespace("n").await,
            Err(BrokerError::NamespaceUnknown(_))
        ));
    }

    #[tokio::test]
    async fn test_unlock_statuses() {
        let registry = registry();
        assert_eq!(registry.unlock("n").0, -1);
        registry.init_namespace("n", None).await.unwrap();
        assert_eq!(registry.unlock("n").0, 1);

        let namespace = registry.local("n").unwrap();
        let _held = namespace.lock().acquire().await.unwrap();
        assert_eq!(registry.unlock("n"), (0, "'n' unlocked".to_string()));
    }

    #[tokio::test]
    async fn test_disconnect_hooks() {
        let registry = registry();
        registry.init_namespace("log", Some("events = []")).await.unwrap();
        let (a, b) = (ChannelId::from_raw(101), ChannelId::from_raw(102));

        let hook = ExecuteRequest::new("log", "broker.on_disconnect('events += [1]')");
        registry.execute(hook, Some(a), false).await.unwrap();
        let hook = ExecuteRequest::new("log", "broker.on_disconnect_any('events += [2]')");
        registry.execute(hook, Some(b), false).await.unwrap();

        registry.disconnect(b).await;
        registry.disconnect(a).await;

        let events = run(&registry, ExecuteRequest::new("log", "").expr("events")).await;
        assert_eq!(events.value, Value::from(vec![2i64, 1, 2]));
        let hooks = run(&registry, ExecuteRequest::new("log", "").expr("broker.on_disconnect_hooks()")).await;
        assert_eq!(hooks.value, Value::from(vec!["events += [2]"]));
    }

    #[tokio::test]
    async fn test_drop_hooks_and_drain() {
        let shared = Arc::new(crate::context::ScriptContext::new());
        let context = shared.clone();
        let registry = Registry::new(Arc::new(move |_: &str| {
            context.clone() as Arc<dyn ExecutionContext>
        }));

        registry
            .init_namespace("a", Some("broker.on_drop('dropped = True')"))
            .await
            .unwrap();
        registry.init_namespace("b", None).await.unwrap();
        let hooks = run(&registry, ExecuteRequest::new("a", "").expr("broker.on_drop_hooks()")).await;
        assert_eq!(hooks.value, Value::from(vec!["dropped = True"]));

        registry.drain().await;
        assert!(registry.local_names().is_empty());
        assert_eq!(shared.get("dropped"), Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_remote_registration_conflicts() {
        let registry = registry();
        registry.init_namespace("local", None).await.unwrap();
        let channel = Arc::new(Channel::new(
            futures_lite::io::Cursor::new(Vec::new()),
            Vec::new(),
            "peer:1",
        ));

        assert!(matches!(
            registry.register_remote("local", channel.clone()),
            Err(BrokerError::NamespaceAlreadyRegistered(_))
        ));
        registry.register_remote("far", channel.clone()).unwrap();
        assert_eq!(registry.kind("far"), Some(NamespaceKind::Remote));
        assert!(matches!(
            registry.local_or_create("far", true),
            Err(BrokerError::NamespaceAlreadyRegistered(_))
        ));

        let types = run(&registry, ExecuteRequest::new("local", "").expr(
            "[broker.namespace_type('far'), broker.namespace_type('local'), broker.namespace_type('x')]",
        ))
        .await;
        assert_eq!(
            types.value,
            Value::from(vec![Value::from("remote"), Value::from("local"), Value::None])
        );

        let subscriber = Arc::new(Channel::new(
            futures_lite::io::Cursor::new(Vec::new()),
            Vec::new(),
            "sub",
        ));
        registry.subscribe("far", subscriber.clone()).unwrap();
        assert!(!registry.lose_remote("far", subscriber.id()));
        assert!(registry.lose_remote("far", channel.id()));
        assert!(channel.is_closed());
        assert!(subscriber.is_closed());
        assert_eq!(registry.kind("far"), None);
    }
}
