//! Local namespace state: context, lock, hooks and deferred results

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use smol::channel::{Receiver, Sender, TrySendError};

use crate::channel::ChannelId;
use crate::context::ExecutionContext;
use crate::lock;
use crate::value::Value;
use crate::wire::ExecuteResult;

/// Outcome of forcing a namespace lock open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStatus {
    Released,
    AlreadyUnlocked,
    /// The lock was torn down with its namespace
    NotLocked,
}

impl UnlockStatus {
    /// Status code carried in `ServerControlResult`
    pub fn code(self) -> i32 {
        match self {
            Self::Released => 0,
            Self::AlreadyUnlocked => 1,
            Self::NotLocked => 2,
        }
    }
}

/// Execution lock of a namespace
///
/// The lock is a single token in a one-slot channel. Acquiring takes the
/// token, releasing puts it back. Any party may put the token back, which
/// is how `unlock` forces a stuck namespace open. Closing the channel makes
/// every pending and future acquisition fail.
#[derive(Debug)]
pub struct NamespaceLock {
    release: Sender<()>,
    acquire: Receiver<()>,
}

impl NamespaceLock {
    pub fn new() -> Self {
        let (release, acquire) = smol::channel::bounded(1);
        let _ = release.try_send(());
        Self { release, acquire }
    }

    /// Wait for the token; `None` once the lock has been closed
    pub async fn acquire(&self) -> Option<NamespaceLockGuard<'_>> {
        if self.release.is_closed() {
            return None;
        }
        self.acquire
            .recv()
            .await
            .ok()
            .map(|()| NamespaceLockGuard { lock: self })
    }

    pub fn force_unlock(&self) -> UnlockStatus {
        match self.release.try_send(()) {
            Ok(()) => UnlockStatus::Released,
            Err(TrySendError::Full(())) => UnlockStatus::AlreadyUnlocked,
            Err(TrySendError::Closed(())) => UnlockStatus::NotLocked,
        }
    }

    pub fn close(&self) {
        self.release.close();
        while self.acquire.try_recv().is_ok() {}
    }
}

impl Default for NamespaceLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Held namespace lock; releases on drop unless it was forced open meanwhile
#[derive(Debug)]
pub struct NamespaceLockGuard<'a> {
    lock: &'a NamespaceLock,
}

impl Drop for NamespaceLockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.lock.release.try_send(());
    }
}

/// Code to run when a connection that used the namespace goes away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectHook {
    /// Connection the hook is bound to; `None` fires for every connection
    pub caller: Option<ChannelId>,
    pub code: String,
}

#[derive(Debug, Default)]
struct Hooks {
    on_disconnect: Vec<DisconnectHook>,
    on_drop: Vec<String>,
}

#[derive(Debug)]
enum Deferred {
    InProgress,
    Done(ExecuteResult),
}

/// A namespace whose context lives in this process
pub struct LocalNamespace {
    name: String,
    context: Arc<dyn ExecutionContext>,
    lock: NamespaceLock,
    hooks: Mutex<Hooks>,
    deferred: Mutex<HashMap<String, Deferred>>,
}

impl LocalNamespace {
    pub fn new(name: impl Into<String>, context: Arc<dyn ExecutionContext>) -> Self {
        Self {
            name: name.into(),
            context,
            lock: NamespaceLock::new(),
            hooks: Mutex::default(),
            deferred: Mutex::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<dyn ExecutionContext> {
        &self.context
    }

    pub fn lock(&self) -> &NamespaceLock {
        &self.lock
    }

    pub fn add_disconnect_hook(&self, caller: Option<ChannelId>, code: impl Into<String>) {
        lock(&self.hooks).on_disconnect.push(DisconnectHook {
            caller,
            code: code.into(),
        });
    }

    pub fn set_disconnect_hooks(&self, hooks: Vec<DisconnectHook>) {
        lock(&self.hooks).on_disconnect = hooks;
    }

    pub fn disconnect_hooks(&self) -> Vec<DisconnectHook> {
        lock(&self.hooks).on_disconnect.clone()
    }

    /// Hooks that fire when `caller` disconnects
    pub fn disconnect_hooks_for(&self, caller: ChannelId) -> Vec<String> {
        lock(&self.hooks)
            .on_disconnect
            .iter()
            .filter(|hook| hook.caller.is_none_or(|c| c == caller))
            .map(|hook| hook.code.clone())
            .collect()
    }

    /// Forget the hooks bound to `caller`
    pub fn remove_hooks_of(&self, caller: ChannelId) {
        lock(&self.hooks)
            .on_disconnect
            .retain(|hook| hook.caller != Some(caller));
    }

    pub fn add_drop_hook(&self, code: impl Into<String>) {
        lock(&self.hooks).on_drop.push(code.into());
    }

    pub fn set_drop_hooks(&self, hooks: Vec<String>) {
        lock(&self.hooks).on_drop = hooks;
    }

    pub fn drop_hooks(&self) -> Vec<String> {
        lock(&self.hooks).on_drop.clone()
    }

    pub(crate) fn begin_deferred(&self, id: &str) {
        lock(&self.deferred).insert(id.to_string(), Deferred::InProgress);
    }

    pub(crate) fn complete_deferred(&self, id: &str, result: ExecuteResult) {
        lock(&self.deferred).insert(id.to_string(), Deferred::Done(result));
    }

    /// Take a finished result, or peek at one still running
    ///
    /// `None` if the id is unknown, including ids that were already read.
    pub fn read_deferred(&self, id: &str) -> Option<Value> {
        let mut deferred = lock(&self.deferred);
        match deferred.get(id)? {
            Deferred::InProgress => Some(Value::InProgress),
            Deferred::Done(_) => match deferred.remove(id) {
                Some(Deferred::Done(result)) => Some(Value::Result(Box::new(result))),
                _ => None,
            },
        }
    }

    /// Ids of finished results waiting to be read
    pub fn completed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.deferred)
            .iter()
            .filter(|(_, state)| matches!(state, Deferred::Done(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn clear_deferred(&self) {
        lock(&self.deferred).clear();
    }
}

impl std::fmt::Debug for LocalNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNamespace")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ScriptContext;
    use std::time::Duration;

    fn namespace() -> LocalNamespace {
        LocalNamespace::new("n", Arc::new(ScriptContext::new()))
    }

    #[tokio::test]
    async fn test_lock_release_and_force_unlock() {
        let lock = NamespaceLock::new();
        assert_eq!(lock.force_unlock(), UnlockStatus::AlreadyUnlocked);

        let guard = lock.acquire().await.unwrap();
        assert_eq!(lock.force_unlock(), UnlockStatus::Released);
        // the stale guard must not add a second token
        drop(guard);
        assert_eq!(lock.force_unlock(), UnlockStatus::AlreadyUnlocked);
    }

    #[tokio::test]
    async fn test_closed_lock_fails_waiters() {
        let lock = Arc::new(NamespaceLock::new());
        let held = lock.acquire().await.unwrap();
        let waiter = {
            let lock = lock.clone();
            smol::spawn(async move { lock.acquire().await.is_some() })
        };
        async_io::Timer::after(Duration::from_millis(20)).await;
        lock.close();
        drop(held);
        assert!(!waiter.await);
        assert!(lock.acquire().await.is_none());
        assert_eq!(lock.force_unlock(), UnlockStatus::NotLocked);
    }

    #[test]
    fn test_deferred_results_are_read_once() {
        let ns = namespace();
        ns.begin_deferred("a");
        assert_eq!(ns.read_deferred("a"), Some(Value::InProgress));
        assert!(ns.completed_ids().is_empty());

        ns.complete_deferred("a", ExecuteResult::value(Value::Int(1)));
        assert_eq!(ns.completed_ids(), vec!["a".to_string()]);
        assert_eq!(
            ns.read_deferred("a"),
            Some(Value::Result(Box::new(ExecuteResult::value(Value::Int(1)))))
        );
        assert_eq!(ns.read_deferred("a"), None);
    }

    #[test]
    fn test_disconnect_hooks_by_caller() {
        let ns = namespace();
        let (a, b) = (ChannelId::from_raw(1), ChannelId::from_raw(2));
        ns.add_disconnect_hook(Some(a), "x = 1");
        ns.add_disconnect_hook(None, "y = 1");

        assert_eq!(ns.disconnect_hooks_for(a), vec!["x = 1", "y = 1"]);
        assert_eq!(ns.disconnect_hooks_for(b), vec!["y = 1"]);

        ns.remove_hooks_of(a);
        assert_eq!(ns.disconnect_hooks().len(), 1);
    }
}
