//! Execution contexts
//!
//! The registry runs code through the [`ExecutionContext`] trait only. Each
//! namespace owns one context, created by a [`ContextFactory`]. Contexts
//! take `&self` and synchronize their own state, so that executions that
//! skip the namespace lock may run concurrently.
//!
//! [`ScriptContext`] is the built-in implementation, a small
//! expression-and-assignment language.

mod lexer;
mod parser;
mod script;

use std::sync::Arc;

use thiserror::Error;

use crate::value::Value;

pub use script::ScriptContext;

/// A fault raised by code or an expression
///
/// Rendered as `<Kind>Error: <message>`; this text is what ends up in
/// [`ExecuteResult`](crate::ExecuteResult) error fields.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("SyntaxError: {0}")]
    Syntax(String),

    #[error("NameError: name '{0}' is not defined")]
    Name(String),

    #[error("TypeError: {0}")]
    Type(String),

    #[error("ValueError: {0}")]
    Value(String),

    #[error("ZeroDivisionError: {0}")]
    ZeroDivision(&'static str),

    #[error("IndexError: {0}")]
    Index(String),

    #[error("KeyError: {0}")]
    Key(String),

    #[error("OverflowError: {0}")]
    Overflow(String),

    /// Raised explicitly by the code
    #[error("Exception: {0}")]
    Raised(String),

    /// Raised by a host function
    #[error("BrokerError: {0}")]
    Host(String),
}

/// Functions the embedding process offers to code
pub trait Host: Send + Sync {
    /// Call host function `name`; `None` if no such function exists
    fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, EvalError>>;
}

/// A host without functions
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHost;

impl Host for NoHost {
    fn call(&self, _name: &str, _args: &[Value]) -> Option<Result<Value, EvalError>> {
        None
    }
}

/// A persistent environment that runs code and evaluates expressions
pub trait ExecutionContext: Send + Sync {
    /// Run statements for their effect on the environment
    fn run(&self, code: &str, host: &dyn Host) -> Result<(), EvalError>;

    /// Evaluate one expression
    fn eval(&self, expr: &str, host: &dyn Host) -> Result<Value, EvalError>;
}

/// Creates the context of a new namespace
pub trait ContextFactory: Send + Sync {
    fn create(&self, namespace: &str) -> Arc<dyn ExecutionContext>;
}

impl<F> ContextFactory for F
where
    F: Fn(&str) -> Arc<dyn ExecutionContext> + Send + Sync,
{
    fn create(&self, namespace: &str) -> Arc<dyn ExecutionContext> {
        self(namespace)
    }
}

/// Factory handing every namespace a fresh [`ScriptContext`]
pub fn script_contexts() -> Arc<dyn ContextFactory> {
    Arc::new(|_: &str| Arc::new(ScriptContext::new()) as Arc<dyn ExecutionContext>)
}
