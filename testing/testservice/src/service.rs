//! The demo procedures: an echo/sleep/error trio, a math object and a
//! streaming yielder.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;
use zrpc_core::registry::{self, IterGenerator};
use zrpc_core::{Generator, MethodSet, ProcError, Procedure, Service, Value};

/// Basic arithmetic exposed as an object; all four methods land in the
/// procedure table unnamespaced.
struct Math;

impl Math {
    fn binop(
        name: &'static str,
        apply: fn(f64, f64) -> Result<f64, ProcError>,
    ) -> (String, Arc<dyn Procedure>) {
        (
            name.to_string(),
            registry::from_fn(move |args: Vec<Value>, _kwargs| {
                let a = number(&args, 0)?;
                let b = number(&args, 1)?;
                let result = apply(a, b)?;
                info!(name, a, b, result);
                Ok(json!(result))
            }),
        )
    }
}

impl MethodSet for Math {
    fn rpc_methods(&self) -> Vec<(String, Arc<dyn Procedure>)> {
        vec![
            Math::binop("add", |a, b| Ok(a + b)),
            Math::binop("subtract", |a, b| Ok(a - b)),
            Math::binop("multiply", |a, b| Ok(a * b)),
            Math::binop("divide", |a, b| {
                if b == 0.0 {
                    Err(ProcError::new("ZeroDivisionError", "division by zero"))
                } else {
                    Ok(a / b)
                }
            }),
        ]
    }
}

fn number(args: &[Value], index: usize) -> Result<f64, ProcError> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| ProcError::new("TypeError", format!("argument {index} must be a number")))
}

/// Register every demo procedure on the service.
pub fn register_all(service: &Service) -> zrpc_core::Result<()> {
    service.register_fn("echo", |mut args, _kwargs| {
        let value = args.pop().unwrap_or(Value::Null);
        info!(?value, "echo");
        Ok(value)
    })?;

    service.register_async_fn("sleep", |args, _kwargs| async move {
        let secs = number(&args, 0)?;
        info!(secs, "sleep");
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        Ok(json!(secs))
    })?;

    service.register_fn("error", |_args, _kwargs| -> Result<Value, ProcError> {
        Err(ProcError::new("ValueError", "raising ValueError for fun!"))
    })?;

    service.register_generator_fn("yielder", |args, _kwargs| {
        let count = args.first().and_then(Value::as_u64).unwrap_or(10);
        info!(count, "yielder");
        Ok(Box::new(IterGenerator::new((0..count).map(|i| json!(i)))) as Box<dyn Generator>)
    })?;

    service.register_object(&Math, None, &[]);
    Ok(())
}
