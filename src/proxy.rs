//! Forwarding of requests to namespaces served by a remote peer
//!
//! The peer's reply is relayed to the calling connection. Large replies
//! arrive as a stream header and a raw body which is copied through without
//! decoding it.

use crate::channel::{Channel, forward_locked};
use crate::error::{BrokerError, Result};
use crate::registry::{Registry, RemoteNamespace};
use crate::wire::codec::frame_prefix;
use crate::wire::{ExecuteRequest, Message, RecvCaps, StreamHeader};

/// What happened to a forwarded request
#[derive(Debug)]
pub enum ForwardOutcome {
    /// The peer replied with an ordinary message for the caller to send
    Reply(Message),
    /// A streamed reply was relayed to the caller completely
    Forwarded { bytes: u64 },
    /// The caller's connection failed during the relay; the peer was drained
    Broken { forwarded: u64, expected: u64 },
}

/// Capabilities to request from the peer on behalf of a caller
///
/// Streaming is always requested so the body can be relayed without
/// decoding; compression only if the caller can handle it.
fn upstream_caps(caller: RecvCaps) -> RecvCaps {
    if caller.contains(RecvCaps::STREAM | RecvCaps::COMPRESSION) {
        RecvCaps::ALL
    } else {
        RecvCaps::STREAM
    }
}

fn remote_for(registry: &Registry, namespace: &str) -> Result<RemoteNamespace> {
    registry
        .remote(namespace)
        .ok_or_else(|| BrokerError::NamespaceUnknown(namespace.to_string()))
}

/// Forget `namespace` after its peer failed
fn lost(registry: &Registry, namespace: &str, remote: &RemoteNamespace) -> BrokerError {
    registry.lose_remote(namespace, remote.channel.id());
    BrokerError::RemoteUnavailable(namespace.to_string())
}

/// What a caller without streaming gets in place of the stream header
fn plain_prefix(header: &StreamHeader) -> Result<[u8; 4]> {
    let len = usize::try_from(header.length)
        .map_err(|_| BrokerError::InvalidProtocol(format!("stream length {}", header.length)))?;
    frame_prefix(len)
}

/// Run `request` in a remote namespace, relaying streamed replies to `caller`
pub async fn execute_remote(
    registry: &Registry,
    request: ExecuteRequest,
    caller: &Channel,
) -> Result<ForwardOutcome> {
    let namespace = request.namespace.clone();
    let remote = remote_for(registry, &namespace)?;
    let caller_caps = request.caps;
    let request = request.caps(upstream_caps(caller_caps));

    // the peer's receive side stays ours until its reply is fully consumed
    let mut upstream = remote.channel.lock_recv().await;
    if let Err(err) = remote.channel.send(&Message::Execute(request)).await {
        tracing::debug!(namespace = %namespace, error = %err, "sending to remote failed");
        return Err(lost(registry, &namespace, &remote));
    }

    let header = match upstream.receive().await {
        Ok(Message::StreamHeader(header)) => header,
        Ok(reply) => return Ok(ForwardOutcome::Reply(reply)),
        Err(err) => {
            tracing::debug!(namespace = %namespace, error = %err, "receiving from remote failed");
            return Err(lost(registry, &namespace, &remote));
        }
    };

    let mut downstream = caller.lock_send().await;
    let announced = if caller_caps.contains(RecvCaps::STREAM) {
        downstream.send(&Message::StreamHeader(header.clone())).await
    } else {
        // the body then reads as one ordinary frame
        match plain_prefix(&header) {
            Ok(prefix) => downstream.write_raw(&prefix).await,
            Err(err) => Err(err),
        }
    };
    if let Err(err) = announced {
        tracing::debug!(namespace = %namespace, error = %err, "caller gone before relay");
        // a closed caller turns the forward into a plain drain of the peer
        caller.close();
    }

    let report = forward_locked(&mut upstream, &mut downstream, header.length).await;
    drop(downstream);
    drop(upstream);

    if report.source_lost() {
        tracing::warn!(
            namespace = %namespace,
            forwarded = report.forwarded,
            expected = report.expected,
            "remote lost during forward"
        );
        // the caller holds a partial body it cannot resynchronize from
        caller.close();
        return Err(lost(registry, &namespace, &remote));
    }
    if !report.is_complete() {
        return Ok(ForwardOutcome::Broken {
            forwarded: report.forwarded,
            expected: report.expected,
        });
    }
    tracing::trace!(namespace = %namespace, bytes = report.forwarded, "stream relayed");
    Ok(ForwardOutcome::Forwarded {
        bytes: report.forwarded,
    })
}

/// Send one message to a remote namespace's peer and wait for its reply
pub async fn call_remote(registry: &Registry, namespace: &str, message: &Message) -> Result<Message> {
    let remote = remote_for(registry, namespace)?;
    let mut upstream = remote.channel.lock_recv().await;
    if remote.channel.send(message).await.is_err() {
        return Err(lost(registry, namespace, &remote));
    }
    match upstream.receive_payload().await {
        Ok(reply) => Ok(reply),
        Err(_) => Err(lost(registry, namespace, &remote)),
    }
}
