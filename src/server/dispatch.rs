//! Per-connection request dispatch

use std::sync::Arc;

use super::Shared;
use crate::channel::Channel;
use crate::config::ListenerConfig;
use crate::error::BrokerError;
use crate::proxy::{self, ForwardOutcome};
use crate::wire::{ExecuteRequest, ExecuteResult, Message, RecvCaps, ServerCommand};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unauthenticated,
    Authenticated,
    Dispatching,
    /// The connection now serves a remote namespace and is no longer read here
    Detached,
    Closed,
}

/// What a handled message leaves the connection in
enum Step {
    Continue,
    Detach,
    Close,
    Shutdown,
}

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    channel: Arc<Channel>,
    listener: ListenerConfig,
    shutdown: bool,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, channel: Arc<Channel>, listener: ListenerConfig) -> Self {
        Self {
            shared,
            channel,
            listener,
            shutdown: false,
        }
    }

    /// Serve the connection until it closes or detaches
    pub(crate) async fn run(mut self) {
        tracing::debug!(channel = %self.channel.id(), peer = %self.channel.peer(), "connected");
        let mut state = if self.listener.requires_auth() {
            State::Unauthenticated
        } else {
            State::Dispatching
        };

        loop {
            state = match state {
                State::Unauthenticated => self.authenticate().await,
                State::Authenticated => self.confirm().await,
                State::Dispatching => self.dispatch_next().await,
                State::Detached => {
                    tracing::debug!(channel = %self.channel.id(), "connection detached");
                    return;
                }
                State::Closed => break,
            };
        }
        self.close().await;
    }

    async fn authenticate(&self) -> State {
        match self.channel.receive().await {
            Ok(Message::Authenticate { password }) if self.listener.accepts(&password) => {
                tracing::debug!(peer = %self.channel.peer(), "authentication ok");
                State::Authenticated
            }
            Ok(msg) => {
                tracing::warn!(peer = %self.channel.peer(), kind = msg.kind(), "authentication failed");
                let _ = self.channel.send(&Message::AuthResult { success: false }).await;
                State::Closed
            }
            Err(err) => {
                tracing::warn!(peer = %self.channel.peer(), error = %err, "error receiving password");
                State::Closed
            }
        }
    }

    async fn confirm(&self) -> State {
        match self.channel.send(&Message::AuthResult { success: true }).await {
            Ok(()) => State::Dispatching,
            Err(_) => State::Closed,
        }
    }

    async fn dispatch_next(&mut self) -> State {
        let msg = match self.channel.receive().await {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(channel = %self.channel.id(), error = %err, "connection ended");
                return State::Closed;
            }
        };
        tracing::debug!(peer = %self.channel.peer(), message = %msg, "received");

        match self.handle(msg).await {
            Step::Continue => State::Dispatching,
            Step::Detach => State::Detached,
            Step::Close => State::Closed,
            Step::Shutdown => {
                self.shutdown = true;
                State::Closed
            }
        }
    }

    async fn handle(&self, msg: Message) -> Step {
        let registry = &self.shared.registry;
        match msg {
            Message::Execute(request) => self.execute(request).await,
            Message::RegisterNamespace { namespace } => {
                // replies to the registering peer go out before anything forwarded to it
                let mut tx = self.channel.lock_send().await;
                match registry.register_remote(&namespace, self.channel.clone()) {
                    Ok(()) => match tx.send(&Message::namespace_ok()).await {
                        Ok(()) => Step::Detach,
                        Err(_) => {
                            drop(tx);
                            registry.lose_remote(&namespace, self.channel.id());
                            Step::Close
                        }
                    },
                    Err(err) => self.reply_with(&mut tx, &Message::namespace_failed(err)).await,
                }
            }
            Message::RequestNamespace { namespace } => {
                let reply = match registry.subscribe(&namespace, self.channel.clone()) {
                    Ok(()) => Message::namespace_ok(),
                    Err(err) => Message::namespace_failed(err),
                };
                self.reply(&reply).await
            }
            Message::DropNamespace { namespace } => {
                let reply = match registry.drop_namespace(&namespace).await {
                    Ok(()) => Message::namespace_ok(),
                    Err(err) => Message::namespace_failed(err),
                };
                self.reply(&reply).await
            }
            Message::ServerControl(command) => self.control(command).await,
            Message::Authenticate { password }
                if !self.listener.requires_auth() || self.listener.accepts(&password) =>
            {
                self.reply(&Message::AuthResult { success: true }).await
            }
            other => {
                tracing::warn!(peer = %self.channel.peer(), message = %other, "unexpected message");
                let _ = self.channel.send(&Message::AuthResult { success: false }).await;
                Step::Close
            }
        }
    }

    async fn reply(&self, msg: &Message) -> Step {
        let mut tx = self.channel.lock_send().await;
        self.reply_with(&mut tx, msg).await
    }

    async fn reply_with(&self, tx: &mut crate::channel::SendGuard<'_>, msg: &Message) -> Step {
        match tx.send(msg).await {
            Ok(()) => Step::Continue,
            Err(_) => Step::Close,
        }
    }

    async fn execute(&self, request: ExecuteRequest) -> Step {
        let registry = &self.shared.registry;
        let caps = request.caps;
        let namespace = request.namespace.clone();

        if registry.remote(&namespace).is_some() {
            return match proxy::execute_remote(registry, request, &self.channel).await {
                Ok(ForwardOutcome::Reply(Message::Unloadable(reason))) => {
                    tracing::warn!(namespace = %namespace, reason = %reason, "remote reply could not be loaded");
                    let message = format!("reply from remote namespace {namespace:?} could not be loaded: {reason}");
                    self.send_result(ExecuteResult::failed(message), caps).await
                }
                Ok(ForwardOutcome::Reply(reply)) => self.reply(&reply).await,
                Ok(ForwardOutcome::Forwarded { bytes }) => {
                    tracing::debug!(namespace = %namespace, bytes, "forwarded");
                    Step::Continue
                }
                Ok(ForwardOutcome::Broken { forwarded, expected }) => {
                    tracing::warn!(namespace = %namespace, forwarded, expected, "error after forwarding");
                    Step::Close
                }
                Err(err) if self.channel.is_closed() => {
                    tracing::debug!(namespace = %namespace, error = %err, "caller lost during forward");
                    Step::Close
                }
                Err(err) if err.is_disconnect() => {
                    // the namespace is gone; the caller is told and then dropped
                    tracing::warn!(namespace = %namespace, error = %err, "remote namespace lost");
                    let _ = self.send_result(ExecuteResult::failed(err.to_string()), caps).await;
                    Step::Close
                }
                Err(err) => self.send_result(ExecuteResult::failed(err.to_string()), caps).await,
            };
        }

        let allow_create = self.listener.may_create(&namespace);
        match registry
            .execute(request, Some(self.channel.id()), allow_create)
            .await
        {
            Ok(Message::ExecuteResult(result)) => self.send_result(result, caps).await,
            Ok(reply) => self.reply(&reply).await,
            Err(err) => self.send_result(ExecuteResult::failed(err.to_string()), caps).await,
        }
    }

    /// Send a result, streaming it if the caller allows it
    ///
    /// A result that cannot be encoded or exceeds the frame limit fails
    /// before anything is written, and is replaced by a shortened stand-in.
    async fn send_result(&self, result: ExecuteResult, caps: RecvCaps) -> Step {
        let mut tx = self.channel.lock_send().await;
        let msg = Message::ExecuteResult(result);
        match tx.send_payload(&msg, caps).await {
            Ok(header) => {
                if let Some(header) = header {
                    tracing::debug!(bytes = header.length, compression = ?header.format.compression, "sent stream");
                }
                Step::Continue
            }
            Err(err @ (BrokerError::Serialization(_) | BrokerError::InvalidProtocol(_))) => {
                let Message::ExecuteResult(result) = msg else {
                    return Step::Close;
                };
                tracing::warn!(error = %err, "result not sendable, replacing its value");
                self.reply_with(&mut tx, &Message::ExecuteResult(result.unsendable()))
                    .await
            }
            Err(_) => Step::Close,
        }
    }

    async fn control(&self, command: ServerCommand) -> Step {
        let registry = &self.shared.registry;
        let namespace = command.namespace().to_string();

        if registry.remote(&namespace).is_some() {
            let msg = Message::ServerControl(command);
            return match proxy::call_remote(registry, &namespace, &msg).await {
                Ok(Message::Unloadable(reason)) => {
                    tracing::warn!(namespace = %namespace, reason = %reason, "remote reply could not be loaded");
                    self.reply(&Message::ServerControlResult {
                        status: -1,
                        message: format!("reply from remote namespace {namespace:?} could not be loaded: {reason}"),
                    })
                    .await
                }
                Ok(reply) => self.reply(&reply).await,
                Err(err) => {
                    let step = self
                        .reply(&Message::ServerControlResult {
                            status: -1,
                            message: err.to_string(),
                        })
                        .await;
                    if err.is_disconnect() {
                        tracing::warn!(namespace = %namespace, error = %err, "remote namespace lost");
                        Step::Close
                    } else {
                        step
                    }
                }
            };
        }

        match command {
            ServerCommand::Die { .. } => {
                tracing::info!(peer = %self.channel.peer(), "shutdown requested");
                let _ = self
                    .channel
                    .send(&Message::ServerControlResult {
                        status: 0,
                        message: "shutting down".to_string(),
                    })
                    .await;
                Step::Shutdown
            }
            ServerCommand::Unlock { namespace } => {
                let (status, message) = registry.unlock(&namespace);
                self.reply(&Message::ServerControlResult { status, message }).await
            }
        }
    }

    async fn close(&self) {
        self.shared.registry.disconnect(self.channel.id()).await;
        self.channel.close();
        tracing::debug!(channel = %self.channel.id(), peer = %self.channel.peer(), "disconnected");
        if self.shutdown || self.listener.kill_server_on_close() {
            self.shared.wake();
        }
    }
}
