use std::panic::{self, AssertUnwindSafe};

use hashbrown::HashMap;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use tracing::{error, warn};

use tether::envelope::{CallEnvelope, CallError, CallResult};

use crate::panic_message;

/// Name of the operation every call surface provides.
pub const PING: &str = "ping";

type Handler = Box<dyn Fn(&[Value], &Map<String, Value>) -> CallResult + Send + Sync>;

/// The operations a server exposes to remote callers.
///
/// A call naming an operation which has not been registered is rejected
/// with an unknown operation error: nothing outside this allow-list can be
/// reached remotely.
pub struct CallSurface {
    operations: HashMap<String, Handler>,
}

impl Default for CallSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSurface")
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CallSurface {
    /// Creates a [`CallSurface`] exposing only the [`PING`] operation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
        .register(PING, |_, _| Ok(Value::from("pong")))
    }

    /// Registers an operation.
    ///
    /// An operation registered twice keeps the last handler.
    #[must_use]
    pub fn register<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[Value], &Map<String, Value>) -> CallResult + Send + Sync + 'static,
    {
        let name = name.into();
        if self
            .operations
            .insert(name.clone(), Box::new(handler))
            .is_some()
        {
            warn!("Operation `{name}` registered twice, keeping the last handler");
        }
        self
    }

    /// Whether an operation is part of the surface.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Returns an iterator over the operation names.
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    /// Executes a call.
    ///
    /// A panicking handler produces a failed result.
    #[must_use]
    pub fn call(&self, call: &CallEnvelope) -> CallResult {
        let Some(handler) = self.operations.get(&call.func) else {
            warn!("Rejected call to unknown operation `{}`", call.func);
            return Err(CallError::unknown_operation(&call.func));
        };

        panic::catch_unwind(AssertUnwindSafe(|| handler(&call.args, &call.kwargs))).unwrap_or_else(
            |panic| {
                let message = panic_message(panic.as_ref());
                error!("Operation `{}` panicked: {message}", call.func);
                Err(CallError::failed(format!("`{}` panicked: {message}", call.func)))
            },
        )
    }
}

/// Extracts an argument of an operation, looking it up by name among the
/// keyword arguments first and by position among the positional ones then.
///
/// # Errors
///
/// The argument is missing or has not the expected type.
pub fn argument<T: DeserializeOwned>(
    args: &[Value],
    kwargs: &Map<String, Value>,
    position: usize,
    name: &str,
) -> Result<T, CallError> {
    let value = kwargs
        .get(name)
        .or_else(|| args.get(position))
        .ok_or_else(|| CallError::invalid_arguments(format!("Missing argument `{name}`")))?;

    T::deserialize(value)
        .map_err(|e| CallError::invalid_arguments(format!("Invalid argument `{name}`: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, Value, json};

    use tether::envelope::{CallEnvelope, CallError, CallErrorKind};

    use super::{CallSurface, PING, argument};

    fn surface() -> CallSurface {
        CallSurface::new()
            .register("get_value", |args, kwargs| {
                let node: u64 = argument(args, kwargs, 0, "node")?;
                if node == 42 {
                    Ok(json!(17))
                } else {
                    Err(CallError::failed(format!("No node {node}")))
                }
            })
            .register("nothing", |_, _| Ok(Value::Null))
            .register("explode", |_, _| panic!("boom"))
    }

    fn call(func: &str, args: Vec<Value>) -> CallEnvelope {
        CallEnvelope::new(func, args, Map::new())
    }

    #[test]
    fn ping_is_always_available() {
        let surface = CallSurface::new();
        assert!(surface.contains(PING));
        assert_eq!(surface.call(&call(PING, Vec::new())), Ok(json!("pong")));
    }

    #[test]
    fn registered_operations() {
        let surface = surface();

        assert_eq!(surface.call(&call("get_value", vec![json!(42)])), Ok(json!(17)));
        assert_eq!(surface.call(&call("nothing", Vec::new())), Ok(Value::Null));

        let mut kwargs = Map::new();
        let _ = kwargs.insert("node".into(), json!(42));
        assert_eq!(
            surface.call(&CallEnvelope::new("get_value", Vec::new(), kwargs)),
            Ok(json!(17))
        );

        let mut names: Vec<&str> = surface.operations().collect();
        names.sort_unstable();
        assert_eq!(names, ["explode", "get_value", "nothing", "ping"]);
    }

    #[test]
    fn failures() {
        let surface = surface();

        let error = surface.call(&call("reboot", Vec::new())).unwrap_err();
        assert_eq!(error.kind, CallErrorKind::UnknownOperation);

        let error = surface.call(&call("get_value", Vec::new())).unwrap_err();
        assert_eq!(error.kind, CallErrorKind::InvalidArguments);

        let error = surface
            .call(&call("get_value", vec![json!("forty-two")]))
            .unwrap_err();
        assert_eq!(error.kind, CallErrorKind::InvalidArguments);

        let error = surface.call(&call("get_value", vec![json!(1)])).unwrap_err();
        assert_eq!(error.kind, CallErrorKind::Failed);
    }

    #[test]
    fn panicking_operation() {
        let error = surface().call(&call("explode", Vec::new())).unwrap_err();
        assert_eq!(error.kind, CallErrorKind::Failed);
        assert!(error.message.contains("boom"));
    }
}
