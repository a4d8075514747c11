#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;

use serde_json::json;
use zrpc_core::zmq;
use zrpc_core::{
    registry, Client, ClientConfig, Kwargs, MethodSet, ProcError, Procedure, Serializer, Service,
    ServiceConfig, Value,
};

/// Install a tracing subscriber once for the whole test binary. Controlled
/// through RUST_LOG; silent by default.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A connected service/client pair on an ephemeral tcp endpoint.
pub struct Rig {
    pub context: zmq::Context,
    pub service: Service,
    pub client: Client,
    pub url: String,
}

impl Rig {
    pub async fn shutdown(self) {
        self.client.shutdown();
        self.service.shutdown().await;
    }
}

/// Bind a fresh service on an ephemeral port, start it, and connect a
/// client to it.
pub async fn start_pair() -> Rig {
    start_pair_with(None).await
}

/// Same as [`start_pair`] but with an explicit serializer on both sides.
pub async fn start_pair_with(serializer: Option<Arc<dyn Serializer>>) -> Rig {
    init_logging();
    let context = zmq::Context::new();

    let service = Service::new(
        context.clone(),
        ServiceConfig {
            serializer: serializer.clone(),
            service_id: None,
        },
    );
    let url = service
        .bind("tcp://127.0.0.1:0")
        .await
        .expect("service bind failed");
    service.start();

    let client = Client::new(context.clone(), ClientConfig { serializer });
    client.connect(&url).await.expect("client connect failed");

    Rig {
        context,
        service,
        client,
        url,
    }
}

/// The toy object from the base RPC scenarios: one public method, one
/// restricted, one private.
pub struct Toy {
    pub value: i64,
}

impl MethodSet for Toy {
    fn rpc_methods(&self) -> Vec<(String, Arc<dyn Procedure>)> {
        let value = self.value;
        vec![
            (
                "value".into(),
                registry::from_fn(move |_args, _kwargs| Ok(json!(value))),
            ),
            (
                "restricted".into(),
                registry::from_fn(|_args, _kwargs| Ok(Value::Null)),
            ),
            (
                "_private".into(),
                registry::from_fn(|_args, _kwargs| Ok(Value::Null)),
            ),
        ]
    }
}

/// Register the `echo` procedure used by many scenarios.
pub fn register_echo(service: &Service) {
    service
        .register_fn("echo", |mut args, _kwargs| {
            Ok(args.pop().unwrap_or(Value::Null))
        })
        .expect("echo registration failed");
}

/// Register a `sleep` procedure blocking for its argument in seconds.
pub fn register_sleep(service: &Service) {
    service
        .register_async_fn("sleep", |args, _kwargs| async move {
            let secs = args.first().and_then(Value::as_f64).unwrap_or(0.0);
            tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
            Ok(Value::Null)
        })
        .expect("sleep registration failed");
}

/// Pull the first positional argument as an f64 or fail like a bad remote
/// call would.
pub fn arg_f64(args: &[Value], index: usize) -> Result<f64, ProcError> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| ProcError::new("TypeError", format!("argument {index} must be a number")))
}

pub fn kwargs_of(pairs: &[(&str, Value)]) -> Kwargs {
    let mut kwargs = Kwargs::new();
    for (key, value) in pairs {
        kwargs.insert((*key).to_string(), value.clone());
    }
    kwargs
}
