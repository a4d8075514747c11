//! RPC service.
//!
//! Requests arrive on a ROUTER socket, so every message carries the learned
//! return route. One accept task owns the receive side and hands each
//! request to a fresh worker task; replies funnel through the socket actor,
//! which serializes them onto the send side. Route and req_id travel only
//! inside the request descriptor, never as service state, so concurrent
//! dispatch cannot mix up return paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{self, Frame, ReplyTag, RequestOp};
use crate::error::{RemoteError, Result};
use crate::registry::{
    from_async_fn, from_fn, from_generator_fn, GenStep, Generator, MethodSet, Outcome, ProcError,
    Procedure, Registry,
};
use crate::serializer::{JsonSerializer, Kwargs, Serializer, Value};
use crate::socket::{SocketHandle, SocketKind};

/// Service construction options.
#[derive(Default)]
pub struct ServiceConfig {
    /// Serializer for arguments and results. Defaults to JSON.
    pub serializer: Option<Arc<dyn Serializer>>,
    /// Identity echoed in ACK replies. Defaults to a fresh UUID.
    pub service_id: Option<Vec<u8>>,
}

enum StreamOp {
    Send(Vec<Frame>),
    Throw(String, String),
    Close,
}

struct ServiceInner {
    socket: SocketHandle,
    serializer: Arc<dyn Serializer>,
    registry: Registry,
    generators: Mutex<HashMap<Vec<u8>, mpsc::Sender<StreamOp>>>,
    service_id: Vec<u8>,
    started: watch::Sender<bool>,
}

/// An RPC service over a ROUTER socket.
pub struct Service {
    inner: Arc<ServiceInner>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl Service {
    /// Create a service on an explicitly supplied zmq context.
    ///
    /// Spawns the accept loop, so this must run inside a tokio runtime.
    pub fn new(context: zmq::Context, config: ServiceConfig) -> Self {
        let (socket, in_rx) = SocketHandle::spawn(context, SocketKind::Router);
        let (started, started_rx) = watch::channel(false);

        let inner = Arc::new(ServiceInner {
            socket,
            serializer: config
                .serializer
                .unwrap_or_else(|| Arc::new(JsonSerializer)),
            registry: Registry::new(),
            generators: Mutex::new(HashMap::new()),
            service_id: config
                .service_id
                .unwrap_or_else(|| Uuid::new_v4().into_bytes().to_vec()),
            started,
        });

        let accept = tokio::spawn(accept_loop(Arc::clone(&inner), in_rx, started_rx));

        Service {
            inner,
            accept: Mutex::new(Some(accept)),
        }
    }

    /// Register a callable under `name`. Fails for reserved names.
    pub fn register(&self, name: &str, procedure: Arc<dyn Procedure>) -> Result<()> {
        self.inner.registry.register(name, procedure)
    }

    /// Register a plain function.
    pub fn register_fn<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Vec<Value>, Kwargs) -> std::result::Result<Value, ProcError> + Send + Sync + 'static,
    {
        self.register(name, from_fn(f))
    }

    /// Register an async function.
    pub fn register_async_fn<F, Fut>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Vec<Value>, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<Value, ProcError>> + Send + 'static,
    {
        self.register(name, from_async_fn(f))
    }

    /// Register a streaming procedure from a generator constructor.
    pub fn register_generator_fn<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Vec<Value>, Kwargs) -> std::result::Result<Box<dyn Generator>, ProcError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, from_generator_fn(f))
    }

    /// Register every public method an object advertises, optionally under
    /// a dotted namespace and minus the `restricted` names.
    pub fn register_object(
        &self,
        object: &dyn MethodSet,
        namespace: Option<&str>,
        restricted: &[&str],
    ) {
        self.inner.registry.register_object(object, namespace, restricted);
    }

    /// The underlying procedure table.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Bind to a URL; returns the resolved endpoint (port 0 picks an
    /// ephemeral port).
    pub async fn bind(&self, url: &str) -> Result<String> {
        self.inner.socket.bind(url).await
    }

    /// Bind each of `ports` on `ip`; returns the resolved endpoints.
    pub async fn bind_ports(&self, ip: &str, ports: &[u16]) -> Result<Vec<String>> {
        let mut resolved = Vec::with_capacity(ports.len());
        for port in ports {
            resolved.push(self.bind(&format!("tcp://{ip}:{port}")).await?);
        }
        Ok(resolved)
    }

    /// Connect out to a peer (a service may dial into a client-side bind).
    pub async fn connect(&self, url: &str) -> Result<()> {
        self.inner.socket.connect(url).await
    }

    /// Close and recreate the socket, keeping its binds and connections.
    pub async fn reset(&self) -> Result<()> {
        self.inner.socket.reset().await
    }

    /// The currently bound and connected URLs, in that order.
    pub async fn endpoints(&self) -> Result<(Vec<String>, Vec<String>)> {
        self.inner.socket.endpoints().await
    }

    /// Enter listen mode (non-blocking). Idempotent.
    pub fn start(&self) {
        self.inner.started.send_replace(true);
    }

    /// Leave listen mode, letting in-flight handlers finish. Idempotent.
    pub fn stop(&self) {
        self.inner.started.send_replace(false);
    }

    /// Block until the accept loop exits (i.e. until shutdown).
    pub async fn serve(&self) -> Result<()> {
        self.start();
        let accept = self.accept.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(accept) = accept {
            let _ = accept.await;
        }
        Ok(())
    }

    /// Stop, close the socket and wait for the accept loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        self.inner.socket.close();
        let accept = self.accept.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(accept) = accept {
            let _ = accept.await;
        }
    }

    /// Number of live generators (one pinned worker each).
    pub fn active_generators(&self) -> usize {
        self.inner.lock_generators().len()
    }

    /// The identity echoed in ACK replies.
    pub fn service_id(&self) -> &[u8] {
        &self.inner.service_id
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.inner.socket.close();
    }
}

async fn accept_loop(
    inner: Arc<ServiceInner>,
    mut in_rx: mpsc::UnboundedReceiver<Vec<Frame>>,
    mut started: watch::Receiver<bool>,
) {
    loop {
        if !*started.borrow() {
            if started.changed().await.is_err() {
                break;
            }
            continue;
        }
        tokio::select! {
            msg = in_rx.recv() => match msg {
                Some(frames) => {
                    tokio::spawn(handle_request(Arc::clone(&inner), frames));
                }
                None => break,
            },
            _ = started.changed() => {}
        }
    }

    // dropping the command slots releases any parked generator drivers
    inner.lock_generators().clear();
    debug!("accept loop exited");
}

async fn handle_request(inner: Arc<ServiceInner>, frames: Vec<Frame>) {
    let Some(request) = codec::parse_request(&frames) else {
        // nothing to address a reply to
        warn!("dropping unparseable request");
        return;
    };
    let route = request.route;
    let req_id = request.req_id;

    // receipt acknowledgement, always first for this req_id
    inner.send_frames(codec::build_ack(&route, &req_id, &inner.service_id));

    match request.op {
        RequestOp::Call {
            name,
            payload,
            ignore,
        } => {
            inner.handle_call(&route, &req_id, &name, payload, ignore).await;
        }
        RequestOp::StreamSend { payload } => {
            inner
                .forward_stream_op(&route, &req_id, StreamOp::Send(payload))
                .await;
        }
        RequestOp::StreamThrow { ename, evalue } => {
            inner
                .forward_stream_op(&route, &req_id, StreamOp::Throw(ename, evalue))
                .await;
        }
        RequestOp::StreamClose => {
            inner.forward_stream_op(&route, &req_id, StreamOp::Close).await;
        }
    }
}

fn error_descriptor(err: ProcError) -> RemoteError {
    let traceback = format!("{err}");
    RemoteError {
        ename: err.ename,
        evalue: err.evalue,
        traceback,
    }
}

impl ServiceInner {
    fn lock_generators(&self) -> MutexGuard<'_, HashMap<Vec<u8>, mpsc::Sender<StreamOp>>> {
        self.generators.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_frames(&self, frames: Vec<Frame>) {
        if let Err(err) = self.socket.send(frames) {
            warn!(%err, "could not send reply");
        }
    }

    fn send_reply(&self, route: &[Frame], req_id: &[u8], tag: ReplyTag, payload: Vec<Frame>) {
        self.send_frames(codec::build_reply(route, req_id, tag, payload));
    }

    fn send_fail(&self, route: &[Frame], req_id: &[u8], error: RemoteError) {
        match serde_json::to_vec(&error) {
            Ok(body) => self.send_reply(route, req_id, ReplyTag::Fail, vec![body]),
            Err(err) => warn!(%err, "could not encode error descriptor"),
        }
    }

    async fn handle_call(
        &self,
        route: &[Frame],
        req_id: &[u8],
        name: &str,
        payload: Vec<Frame>,
        ignore: bool,
    ) {
        let Some(procedure) = self.registry.lookup(name) else {
            if !ignore {
                self.send_fail(
                    route,
                    req_id,
                    RemoteError::new(
                        "NotImplementedError",
                        format!("Unregistered procedure '{name}'"),
                    ),
                );
            }
            return;
        };

        // replay a payload decode failure as a FAIL: the req_id is known,
        // so the caller can be told
        let (args, kwargs) = match self.serializer.deserialize_args_kwargs(&payload) {
            Ok(pair) => pair,
            Err(err) => {
                if !ignore {
                    self.send_fail(route, req_id, RemoteError::new("DecodeError", err.to_string()));
                }
                return;
            }
        };

        match procedure.invoke(args, kwargs).await {
            Err(err) => {
                if !ignore {
                    self.send_fail(route, req_id, error_descriptor(err));
                }
            }
            Ok(Outcome::Value(value)) => {
                if ignore {
                    return;
                }
                match self.serializer.serialize_result(&value) {
                    Ok(frames) => self.send_reply(route, req_id, ReplyTag::Ok, frames),
                    Err(err) => self.send_fail(
                        route,
                        req_id,
                        RemoteError::new("SerializationError", err.to_string()),
                    ),
                }
            }
            Ok(Outcome::Stream(generator)) => {
                if ignore {
                    // nobody will drive it
                    return;
                }
                self.drive_generator(route, req_id, generator).await;
            }
        }
    }

    /// Hand a stream command to the generator driver owning `req_id`.
    async fn forward_stream_op(&self, route: &[Frame], req_id: &[u8], op: StreamOp) {
        let slot = self.lock_generators().get(req_id).cloned();
        let delivered = match slot {
            Some(tx) => tx.send(op).await.is_ok(),
            None => false,
        };
        if !delivered {
            self.send_fail(
                route,
                req_id,
                RemoteError::new("ValueError", "req_id does not refer to a known generator"),
            );
        }
    }

    /// Drive one generator until it terminates, pinning this worker.
    ///
    /// The one-slot command channel hands successive client commands to the
    /// generator; the driver answers each with YIELD, or terminates the
    /// stream with OK (normal end) or FAIL.
    async fn drive_generator(&self, route: &[Frame], req_id: &[u8], mut generator: Box<dyn Generator>) {
        let (tx, mut rx) = mpsc::channel::<StreamOp>(1);
        self.lock_generators().insert(req_id.to_vec(), tx);

        // stream handshake: an empty YIELD; the client's first command must
        // be a plain send
        self.send_reply(route, req_id, ReplyTag::Yield, Vec::new());

        while let Some(op) = rx.recv().await {
            let step = match op {
                StreamOp::Send(payload) => match self.serializer.deserialize_result(&payload) {
                    Ok(value) => generator.send(value).await,
                    Err(err) => GenStep::Failed(ProcError::new("DecodeError", err.to_string())),
                },
                StreamOp::Throw(ename, evalue) => generator.throw(&ename, &evalue).await,
                StreamOp::Close => {
                    match generator.close().await {
                        GenStep::Done => self.send_reply(route, req_id, ReplyTag::Ok, Vec::new()),
                        GenStep::Failed(err) => self.send_fail(route, req_id, error_descriptor(err)),
                        GenStep::Yielded(_) => self.send_fail(
                            route,
                            req_id,
                            error_descriptor(ProcError::new(
                                "RuntimeError",
                                "generator ignored close",
                            )),
                        ),
                    }
                    break;
                }
            };

            match step {
                GenStep::Yielded(value) => match self.serializer.serialize_result(&value) {
                    Ok(frames) => self.send_reply(route, req_id, ReplyTag::Yield, frames),
                    Err(err) => {
                        self.send_fail(
                            route,
                            req_id,
                            RemoteError::new("SerializationError", err.to_string()),
                        );
                        break;
                    }
                },
                GenStep::Done => {
                    self.send_reply(route, req_id, ReplyTag::Ok, Vec::new());
                    break;
                }
                GenStep::Failed(err) => {
                    self.send_fail(route, req_id, error_descriptor(err));
                    break;
                }
            }
        }

        self.lock_generators().remove(req_id);
        debug!("generator released");
    }
}
