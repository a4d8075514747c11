//! zrpc-core: a lightweight RPC framework over ZeroMQ ROUTER/DEALER sockets.
//!
//! A process exposes named procedures (and iterator-style generators)
//! through a [`Service`]; peers invoke them through a [`Client`] with
//! at-most-once delivery, optional timeouts, optional fire-and-forget, and
//! automatic load-balancing across connected endpoints courtesy of DEALER
//! fair-queuing.
//!
//! ```no_run
//! use serde_json::json;
//! use zrpc_core::{Client, ClientConfig, Service, ServiceConfig};
//!
//! # async fn demo() -> zrpc_core::Result<()> {
//! let context = zmq::Context::new();
//!
//! let service = Service::new(context.clone(), ServiceConfig::default());
//! service.register_fn("echo", |mut args, _kwargs| {
//!     Ok(args.pop().unwrap_or(serde_json::Value::Null))
//! })?;
//! let url = service.bind("tcp://127.0.0.1:0").await?;
//! service.start();
//!
//! let client = Client::new(context, ClientConfig::default());
//! client.connect(&url).await?;
//! let reply = client.invoke("echo", vec![json!("Hi there")]).await?;
//! assert_eq!(reply, json!("Hi there"));
//! # Ok(())
//! # }
//! ```
//!
//! Both sides must agree on a serializer out-of-band; JSON is the default
//! and [`CborSerializer`] is the native binary alternative.

// re-exported so callers can build the context they inject at construction
pub use zmq;

pub mod codec;
mod error;
pub mod registry;
mod serializer;
mod socket;

mod client;
mod proxy;
mod service;

pub use client::{CallOptions, CallReply, Client, ClientConfig, RpcStream};
pub use error::{RemoteError, Result, RpcError};
pub use proxy::RemoteProxy;
pub use registry::{
    GenStep, Generator, IterGenerator, MethodSet, Outcome, ProcError, Procedure, Registry,
    RESERVED_NAMES,
};
pub use serializer::{CborSerializer, JsonSerializer, Kwargs, Serializer, Value};
pub use service::{Service, ServiceConfig};
pub use socket::{SocketHandle, SocketKind};
