//! nsbroker - shared-namespace remote execution broker
//!
//! A broker keeps named execution contexts ("namespaces") alive across
//! client connections. Peers run code and evaluate expressions inside a
//! namespace, synchronously or as deferred executions whose results are
//! collected later, and brokers federate namespaces by forwarding requests
//! and relaying results for namespaces served by another broker.
//!
//! # Example
//!
//! ```rust,ignore
//! use nsbroker::{Broker, BrokerConfig, Connection};
//!
//! async fn demo() -> nsbroker::Result<()> {
//!     let broker = Broker::new(BrokerConfig::builder().port(8089).build());
//!     smol::spawn(async move { broker.run().await }).detach();
//!
//!     let conn = Connection::connect("localhost:8089/work").await?;
//!     conn.exec("answer = 6 * 7").await?;
//!     println!("{}", conn.eval("answer").await?);
//!     Ok(())
//! }
//! ```
//!
//! # Federation
//!
//! A broker can export one of its namespaces to another broker, or import a
//! namespace from one:
//!
//! ```rust,ignore
//! use nsbroker::{BrokerConfig, StartupTask};
//!
//! let config = BrokerConfig::builder()
//!     .task(StartupTask::Import {
//!         namespace: "lab".into(),
//!         hostspec: "secret@lab-host/lab".into(),
//!     })
//!     .build();
//! ```

pub mod channel;
mod client;
mod config;
pub mod context;
mod error;
pub mod hostspec;
pub mod proxy;
pub mod registry;
mod server;
mod value;
pub mod wire;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export public types
pub use channel::{Channel, ChannelId};
pub use client::{Connection, ReadOutcome, Wait};
pub use config::{
    BrokerConfig, BrokerConfigBuilder, DEFAULT_HOST, DEFAULT_PORT, ListenerConfig,
    ListenerConfigBuilder, StartupTask,
};
pub use context::{ContextFactory, EvalError, ExecutionContext, Host, ScriptContext};
pub use error::{BrokerError, Result};
pub use hostspec::HostSpec;
pub use registry::{NamespaceKind, Registry};
pub use server::{Broker, Credential, ShutdownHandle};
pub use value::Value;
pub use wire::{AsyncHandle, ExecuteRequest, ExecuteResult, Message, RecvCaps};

/// Lock a registry map, ignoring poisoning
///
/// The maps hold plain data and stay consistent even if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
