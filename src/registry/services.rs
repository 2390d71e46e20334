//! Broker services callable from code running in a namespace

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{LocalNamespace, Registry};
use crate::channel::ChannelId;
use crate::context::{EvalError, Host};
use crate::value::Value;

/// Prefix of host function names
pub const SERVICE_PREFIX: &str = "broker.";

/// Host functions bound to one namespace and the connection running code in it
pub(crate) struct Services {
    registry: Arc<Registry>,
    namespace: Arc<LocalNamespace>,
    caller: Option<ChannelId>,
}

impl Services {
    pub(crate) fn new(
        registry: Arc<Registry>,
        namespace: Arc<LocalNamespace>,
        caller: Option<ChannelId>,
    ) -> Self {
        Self {
            registry,
            namespace,
            caller,
        }
    }

    fn read_result(&self, args: &[Value]) -> Result<Value, EvalError> {
        let id = match args {
            [Value::Str(id)] => id.clone(),
            [Value::Handle(handle)] if handle.namespace == self.namespace.name() => {
                handle.id.clone()
            }
            [Value::Handle(handle)] => {
                return Err(EvalError::Value(format!(
                    "handle of namespace '{}' read in '{}'",
                    handle.namespace,
                    self.namespace.name()
                )));
            }
            _ => return Err(signature("read_result(id)")),
        };
        self.registry
            .read_result(self.namespace.name(), &id)
            .map_err(|err| EvalError::Host(err.to_string()))
    }
}

fn signature(expected: &str) -> EvalError {
    EvalError::Type(format!("expected {SERVICE_PREFIX}{expected}"))
}

fn strings(items: impl IntoIterator<Item = String>) -> Value {
    Value::List(items.into_iter().map(Value::Str).collect())
}

fn code_list(value: &Value, expected: &str) -> Result<Vec<String>, EvalError> {
    match value {
        Value::List(items) => items
            .iter()
            .map(|item| match item {
                Value::Str(code) => Ok(code.clone()),
                _ => Err(signature(expected)),
            })
            .collect(),
        _ => Err(signature(expected)),
    }
}

impl Host for Services {
    fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, EvalError>> {
        let method = name.strip_prefix(SERVICE_PREFIX)?;
        let result = match (method, args) {
            ("namespace", []) => Ok(Value::Str(self.namespace.name().to_string())),
            ("read_result", args) => self.read_result(args),
            ("poll_results", []) => Ok(strings(self.namespace.completed_ids())),
            ("local_namespaces", []) => Ok(strings(self.registry.local_names())),
            ("remote_namespaces", []) => Ok(strings(self.registry.remote_names())),
            ("remote_namespaces", [with_origin]) if with_origin.is_truthy() => Ok(Value::Map(
                self.registry
                    .remote_origins()
                    .into_iter()
                    .map(|(name, origin)| (name, Value::Str(origin)))
                    .collect::<BTreeMap<_, _>>(),
            )),
            ("remote_namespaces", [_]) => Ok(strings(self.registry.remote_names())),
            ("namespace_type", [Value::Str(other)]) => Ok(self
                .registry
                .kind(other)
                .map_or(Value::None, |kind| Value::Str(kind.as_str().to_string()))),
            ("on_disconnect", [Value::Str(code)]) => {
                self.namespace.add_disconnect_hook(self.caller, code.clone());
                Ok(Value::None)
            }
            ("on_disconnect_any", [Value::Str(code)]) => {
                self.namespace.add_disconnect_hook(None, code.clone());
                Ok(Value::None)
            }
            ("on_drop", [Value::Str(code)]) => {
                self.namespace.add_drop_hook(code.clone());
                Ok(Value::None)
            }
            ("on_disconnect_hooks", []) => Ok(strings(
                self.namespace
                    .disconnect_hooks()
                    .into_iter()
                    .map(|hook| hook.code),
            )),
            ("on_drop_hooks", []) => Ok(strings(self.namespace.drop_hooks())),
            ("set_on_disconnect", [codes]) => {
                code_list(codes, "set_on_disconnect(list)").map(|codes| {
                    self.namespace.set_disconnect_hooks(
                        codes
                            .into_iter()
                            .map(|code| super::DisconnectHook { caller: None, code })
                            .collect(),
                    );
                    Value::None
                })
            }
            ("set_on_drop", [codes]) => code_list(codes, "set_on_drop(list)").map(|codes| {
                self.namespace.set_drop_hooks(codes);
                Value::None
            }),
            (
                "namespace" | "poll_results" | "local_namespaces" | "remote_namespaces"
                | "namespace_type" | "on_disconnect" | "on_disconnect_any" | "on_drop"
                | "on_disconnect_hooks" | "on_drop_hooks" | "set_on_disconnect" | "set_on_drop",
                _,
            ) => Err(EvalError::Type(format!(
                "{name}() called with {} unsupported argument(s)",
                args.len()
            ))),
            _ => return None,
        };
        Some(result)
    }
}
