//! Protocol message types

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Longest code or expression excerpt shown in message summaries
const SUMMARY_TEXT_LIMIT: usize = 80;
/// Characters kept from a result that had to be replaced
const FALLBACK_TEXT_LIMIT: usize = 4096;

/// Optional wire features a receiver understands
///
/// A receiver advertises its capabilities in each request; the sender of
/// the reply must not use a feature that was not advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecvCaps(u8);

impl RecvCaps {
    pub const NONE: Self = Self(0);
    /// Large replies may arrive as a stream header followed by a raw blob
    pub const STREAM: Self = Self(0b01);
    /// Streamed blobs may be zlib-compressed
    pub const COMPRESSION: Self = Self(0b10);
    pub const ALL: Self = Self(0b11);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for RecvCaps {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

/// Request to run code and evaluate an expression in a namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub namespace: String,
    pub code: String,
    pub expr: Option<String>,
    pub is_async: bool,
    pub lock: bool,
    pub caps: RecvCaps,
}

impl ExecuteRequest {
    /// Create a synchronous, locking request without an expression
    pub fn new(namespace: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            code: code.into(),
            expr: None,
            is_async: false,
            lock: true,
            caps: RecvCaps::NONE,
        }
    }

    pub fn expr(mut self, expr: impl Into<String>) -> Self {
        self.expr = Some(expr.into());
        self
    }

    pub fn asynchronous(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    pub fn caps(mut self, caps: RecvCaps) -> Self {
        self.caps = caps;
        self
    }
}

/// Outcome of an execution
///
/// Code and expression faults are data, never protocol errors.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub code_error: Option<String>,
    pub expr_error: Option<String>,
    pub value: Value,
}

impl ExecuteResult {
    pub fn value(value: Value) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    /// A result that failed before anything ran, with the same message on both sides
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code_error: Some(message.clone()),
            expr_error: Some(message),
            value: Value::None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code_error.is_none() && self.expr_error.is_none()
    }

    /// Stand-in for a result that could not be encoded or was too large to send
    ///
    /// The value is replaced by a shortened repr; error texts are shortened
    /// the same way.
    pub fn unsendable(self) -> Self {
        Self {
            code_error: self.code_error.map(|e| clip(&e, FALLBACK_TEXT_LIMIT)),
            expr_error: self.expr_error.map(|e| clip(&e, FALLBACK_TEXT_LIMIT)),
            value: Value::Unserializable(clip(&self.value.to_string(), FALLBACK_TEXT_LIMIT)),
        }
    }
}

impl fmt::Display for ExecuteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExecuteResult(code_error={:?}, expr_error={:?}, value={})",
            self.code_error.as_deref().map(|e| clip(e, SUMMARY_TEXT_LIMIT)),
            self.expr_error.as_deref().map(|e| clip(e, SUMMARY_TEXT_LIMIT)),
            clip(&self.value.to_string(), SUMMARY_TEXT_LIMIT)
        )
    }
}

/// Ticket for retrieving a deferred execution's result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AsyncHandle {
    pub namespace: String,
    pub id: String,
}

impl AsyncHandle {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for AsyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(namespace={:?}, id={:?})", self.namespace, self.id)
    }
}

/// Compression applied to a streamed blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamCompression {
    None,
    Zlib { uncompressed_len: u64 },
}

/// Serialization of the message inside a streamed blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEncoding {
    MsgPack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub compression: StreamCompression,
    pub encoding: StreamEncoding,
}

/// Announces a raw blob of `length` bytes following on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    /// Kind of the message carried in the blob
    pub kind: String,
    pub length: u64,
    pub format: StreamFormat,
}

/// Broker control commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerCommand {
    /// Shut down the broker that owns the namespace
    Die { namespace: String },
    /// Force-release the namespace lock
    Unlock { namespace: String },
}

impl ServerCommand {
    pub fn namespace(&self) -> &str {
        match self {
            Self::Die { namespace } | Self::Unlock { namespace } => namespace,
        }
    }
}

/// A protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Authenticate { password: String },
    AuthResult { success: bool },
    Execute(ExecuteRequest),
    ExecuteResult(ExecuteResult),
    AsyncHandle(AsyncHandle),
    /// Claim the sending connection as owner of a namespace
    RegisterNamespace { namespace: String },
    /// Subscribe the sending connection to executions of a namespace
    RequestNamespace { namespace: String },
    DropNamespace { namespace: String },
    NamespaceResult { ok: bool, error: Option<String> },
    ServerControl(ServerCommand),
    ServerControlResult { status: i32, message: String },
    StreamHeader(StreamHeader),
    /// A frame whose body could not be decoded; never sent
    #[serde(skip)]
    Unloadable(String),
}

impl Message {
    /// Name of the message variant
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "Authenticate",
            Self::AuthResult { .. } => "AuthResult",
            Self::Execute(_) => "Execute",
            Self::ExecuteResult(_) => "ExecuteResult",
            Self::AsyncHandle(_) => "AsyncHandle",
            Self::RegisterNamespace { .. } => "RegisterNamespace",
            Self::RequestNamespace { .. } => "RequestNamespace",
            Self::DropNamespace { .. } => "DropNamespace",
            Self::NamespaceResult { .. } => "NamespaceResult",
            Self::ServerControl(_) => "ServerControl",
            Self::ServerControlResult { .. } => "ServerControlResult",
            Self::StreamHeader(_) => "StreamHeader",
            Self::Unloadable(_) => "Unloadable",
        }
    }

    pub fn namespace_ok() -> Self {
        Self::NamespaceResult {
            ok: true,
            error: None,
        }
    }

    pub fn namespace_failed(error: impl ToString) -> Self {
        Self::NamespaceResult {
            ok: false,
            error: Some(error.to_string()),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // never log credentials
            Self::Authenticate { .. } => f.write_str("Authenticate(***)"),
            Self::Execute(req) => write!(
                f,
                "Execute(namespace={:?}, code={:?}, expr={:?}, async={}, lock={}, caps={:#04b})",
                req.namespace,
                clip(&req.code, SUMMARY_TEXT_LIMIT),
                req.expr.as_deref().map(|e| clip(e, SUMMARY_TEXT_LIMIT)),
                req.is_async,
                req.lock,
                req.caps.bits()
            ),
            Self::ExecuteResult(result) => write!(f, "{result}"),
            Self::AsyncHandle(handle) => write!(f, "{handle}"),
            Self::StreamHeader(header) => write!(
                f,
                "StreamHeader(kind={}, length={}, compression={:?})",
                header.kind, header.length, header.format.compression
            ),
            Self::Unloadable(reason) => {
                write!(f, "Unloadable({})", clip(reason, SUMMARY_TEXT_LIMIT))
            }
            other => write!(f, "{other:?}"),
        }
    }
}

/// Shorten text for log output, keeping both ends
fn clip(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    let half = limit / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(count - half).collect();
    format!("{head}...[{count} chars]...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_operations() {
        let caps = RecvCaps::STREAM | RecvCaps::COMPRESSION;
        assert_eq!(caps, RecvCaps::ALL);
        assert!(caps.contains(RecvCaps::STREAM));
        assert!(!caps.without(RecvCaps::STREAM).contains(RecvCaps::STREAM));
        assert!(RecvCaps::NONE.contains(RecvCaps::NONE));
    }

    #[test]
    fn test_request_builder_defaults() {
        let req = ExecuteRequest::new("n", "x = 1");
        assert!(req.lock);
        assert!(!req.is_async);
        assert_eq!(req.expr, None);

        let req = req.expr("x").asynchronous(true).lock(false);
        assert_eq!(req.expr.as_deref(), Some("x"));
        assert!(req.is_async);
        assert!(!req.lock);
    }

    #[test]
    fn test_summary_hides_password_and_clips_code() {
        let msg = Message::Authenticate {
            password: "secret".to_string(),
        };
        assert!(!msg.to_string().contains("secret"));

        let code = "x = 1\n".repeat(100);
        let summary = Message::Execute(ExecuteRequest::new("n", code)).to_string();
        assert!(summary.contains("600 chars"));
    }
}
