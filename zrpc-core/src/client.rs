//! RPC client.
//!
//! Requests go out over a DEALER socket; when several endpoints are
//! connected the socket fair-queues requests across them, which is the whole
//! load-balancing story. A single router task owns the receive side and
//! resolves pending results by req_id; many callers may `call` concurrently,
//! each parked on its own pending result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::codec::{self, Frame, ReplyBody, StreamCommand};
use crate::error::{RemoteError, Result, RpcError};
use crate::proxy::RemoteProxy;
use crate::serializer::{JsonSerializer, Kwargs, Serializer, Value};
use crate::socket::{SocketHandle, SocketKind};

/// Client construction options.
#[derive(Default)]
pub struct ClientConfig {
    /// Serializer for arguments and results. Defaults to JSON.
    pub serializer: Option<Arc<dyn Serializer>>,
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Fire-and-forget: return immediately, never await any reply.
    pub ignore: bool,
    /// How long to wait for a terminal reply. `None` or zero disables the
    /// timer.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn ignore() -> Self {
        CallOptions {
            ignore: true,
            timeout: None,
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        CallOptions {
            ignore: false,
            timeout: Some(timeout),
        }
    }
}

/// The terminal outcome of a non-ignored call.
pub enum CallReply {
    /// The procedure returned a single value.
    Value(Value),
    /// The procedure is a generator; drive it through the stream.
    Stream(RpcStream),
}

impl std::fmt::Debug for CallReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallReply::Value(v) => f.debug_tuple("Value").field(v).finish(),
            CallReply::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

impl CallReply {
    pub fn into_value(self) -> Result<Value> {
        match self {
            CallReply::Value(value) => Ok(value),
            CallReply::Stream(_) => Err(RpcError::Decode(
                "procedure replied with a stream, not a value".into(),
            )),
        }
    }

    pub fn into_stream(self) -> Result<RpcStream> {
        match self {
            CallReply::Stream(stream) => Ok(stream),
            CallReply::Value(_) => Err(RpcError::Decode(
                "procedure replied with a value, not a stream".into(),
            )),
        }
    }
}

enum ReplyEvent {
    Return(Vec<Frame>),
    Failure(RemoteError),
    StreamStart,
    Yielded(Vec<Frame>),
    Closed,
}

struct PendingEntry {
    tx: mpsc::Sender<ReplyEvent>,
    streaming: bool,
}

type PendingMap = Arc<Mutex<HashMap<Vec<u8>, PendingEntry>>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<Vec<u8>, PendingEntry>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

struct ClientInner {
    socket: SocketHandle,
    serializer: Arc<dyn Serializer>,
    pending: PendingMap,
    ready: AtomicBool,
}

/// An RPC client over a DEALER socket.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client on an explicitly supplied zmq context.
    ///
    /// Spawns the reply router, so this must run inside a tokio runtime.
    pub fn new(context: zmq::Context, config: ClientConfig) -> Self {
        let (socket, in_rx) = SocketHandle::spawn(context, SocketKind::Dealer);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(reply_router(in_rx, Arc::clone(&pending)));

        Client {
            inner: Arc::new(ClientInner {
                socket,
                serializer: config
                    .serializer
                    .unwrap_or_else(|| Arc::new(JsonSerializer)),
                pending,
                ready: AtomicBool::new(false),
            }),
        }
    }

    /// Bind to a URL; returns the resolved endpoint (port 0 picks an
    /// ephemeral port).
    pub async fn bind(&self, url: &str) -> Result<String> {
        let resolved = self.inner.socket.bind(url).await?;
        self.inner.ready.store(true, Ordering::SeqCst);
        Ok(resolved)
    }

    /// Bind each of `ports` on `ip`; returns the resolved endpoints.
    pub async fn bind_ports(&self, ip: &str, ports: &[u16]) -> Result<Vec<String>> {
        let mut resolved = Vec::with_capacity(ports.len());
        for port in ports {
            resolved.push(self.bind(&format!("tcp://{ip}:{port}")).await?);
        }
        Ok(resolved)
    }

    /// Connect to a service endpoint. Connecting to several endpoints
    /// load-balances calls across them.
    pub async fn connect(&self, url: &str) -> Result<()> {
        self.inner.socket.connect(url).await?;
        self.inner.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Close and recreate the socket, keeping its binds and connections.
    pub async fn reset(&self) -> Result<()> {
        self.inner.socket.reset().await
    }

    /// The currently bound and connected URLs, in that order.
    pub async fn endpoints(&self) -> Result<(Vec<String>, Vec<String>)> {
        self.inner.socket.endpoints().await
    }

    /// Call a remote procedure.
    ///
    /// With `ignore` set this returns `CallReply::Value(Value::Null)`
    /// immediately and no pending result is created. Otherwise the caller is
    /// suspended until a terminal OK, FAIL or timeout, or until the first
    /// YIELD turns the reply into a stream.
    pub async fn call(
        &self,
        proc_name: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<CallReply> {
        let inner = &self.inner;
        if !inner.ready.load(Ordering::SeqCst) {
            return Err(RpcError::not_ready());
        }

        let req_id = Uuid::new_v4().into_bytes().to_vec();
        let payload = inner.serializer.serialize_args_kwargs(&args, &kwargs)?;
        let frames = codec::build_request(&req_id, proc_name, payload, options.ignore);

        if options.ignore {
            inner.socket.send(frames)?;
            return Ok(CallReply::Value(Value::Null));
        }

        let (tx, mut rx) = mpsc::channel(1);
        lock_pending(&inner.pending).insert(
            req_id.clone(),
            PendingEntry {
                tx,
                streaming: false,
            },
        );

        if let Err(err) = inner.socket.send(frames) {
            lock_pending(&inner.pending).remove(&req_id);
            return Err(err);
        }

        let event = match options.timeout {
            Some(timeout) if timeout > Duration::ZERO => {
                match tokio::time::timeout(timeout, rx.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        // expire the pending entry; a late reply becomes an
                        // orphan and is dropped by the router
                        lock_pending(&inner.pending).remove(&req_id);
                        return Err(RpcError::Timeout(timeout));
                    }
                }
            }
            _ => rx.recv().await,
        };

        match event {
            Some(ReplyEvent::Return(frames)) => {
                Ok(CallReply::Value(inner.serializer.deserialize_result(&frames)?))
            }
            Some(ReplyEvent::Failure(err)) => Err(RpcError::Remote(err)),
            Some(ReplyEvent::StreamStart) => Ok(CallReply::Stream(RpcStream {
                inner: Arc::clone(inner),
                req_id,
                rx,
                done: false,
            })),
            Some(ReplyEvent::Yielded(_)) | Some(ReplyEvent::Closed) | None => {
                Err(RpcError::closed())
            }
        }
    }

    /// Convenience wrapper for the common unary case: positional arguments,
    /// no keywords, wait for the value.
    pub async fn invoke(&self, proc_name: &str, args: Vec<Value>) -> Result<Value> {
        self.call(proc_name, args, Kwargs::new(), CallOptions::default())
            .await?
            .into_value()
    }

    /// Root proxy for dotted-path call sugar.
    pub fn proxy(&self) -> RemoteProxy<'_> {
        RemoteProxy::root(self)
    }

    /// Proxy for a dotted procedure path, e.g. `client.proc("a.b.value")`.
    pub fn proc(&self, path: &str) -> RemoteProxy<'_> {
        RemoteProxy::at(self, path)
    }

    /// Mark the client not ready, close the socket and join the I/O thread.
    /// Pending callers wake with a transport error. Idempotent.
    pub fn shutdown(&self) {
        self.inner.ready.store(false, Ordering::SeqCst);
        self.inner.socket.close();
    }
}

/// Routes inbound replies to their pending results. The single reader of
/// the socket's inbound channel.
async fn reply_router(mut in_rx: mpsc::UnboundedReceiver<Vec<Frame>>, pending: PendingMap) {
    while let Some(frames) = in_rx.recv().await {
        let Some(reply) = codec::parse_reply(&frames) else {
            debug!("skipping invalid reply");
            continue;
        };
        let req_id = reply.req_id;

        match reply.body {
            ReplyBody::Ack => {
                debug!("skipping ACK");
            }
            ReplyBody::Ok(payload) => {
                let entry = lock_pending(&pending).remove(&req_id);
                match entry {
                    Some(entry) => {
                        let _ = entry.tx.send(ReplyEvent::Return(payload)).await;
                    }
                    None => debug!("orphan OK reply dropped"),
                }
            }
            ReplyBody::Fail(error) => {
                let entry = lock_pending(&pending).remove(&req_id);
                match entry {
                    Some(entry) => {
                        let _ = entry.tx.send(ReplyEvent::Failure(error)).await;
                    }
                    None => debug!("orphan FAIL reply dropped"),
                }
            }
            ReplyBody::Yield(payload) => {
                let event = {
                    let mut map = lock_pending(&pending);
                    match map.get_mut(&req_id) {
                        Some(entry) if !entry.streaming => {
                            // first YIELD: the empty-payload handshake that
                            // flips the pending result into stream mode
                            entry.streaming = true;
                            Some((entry.tx.clone(), ReplyEvent::StreamStart))
                        }
                        Some(entry) => Some((entry.tx.clone(), ReplyEvent::Yielded(payload))),
                        None => None,
                    }
                };
                match event {
                    // the one-slot buffer backpressures the router until the
                    // stream consumer catches up
                    Some((tx, event)) => {
                        let _ = tx.send(event).await;
                    }
                    None => debug!("orphan YIELD reply dropped"),
                }
            }
        }
    }

    // socket closed: wake every pending caller with a transport error
    let entries: Vec<PendingEntry> = {
        let mut map = lock_pending(&pending);
        map.drain().map(|(_, entry)| entry).collect()
    };
    for entry in entries {
        let _ = entry.tx.try_send(ReplyEvent::Closed);
    }
    debug!("reply router exited");
}

/// Client handle over a remote generator.
///
/// Every operation sends a stream command reusing the originating req_id and
/// suspends until the next YIELD, OK or FAIL. A terminal OK, or a FAIL whose
/// `ename` is `StopIteration`, ends the iteration cleanly.
pub struct RpcStream {
    inner: Arc<ClientInner>,
    req_id: Vec<u8>,
    rx: mpsc::Receiver<ReplyEvent>,
    done: bool,
}

impl RpcStream {
    /// Fetch the next value. Sugar for `send(Value::Null)`, which is also
    /// the mandatory first command after the stream handshake.
    pub async fn next(&mut self) -> Result<Option<Value>> {
        self.send(Value::Null).await
    }

    /// Send a value into the generator and fetch what it yields back.
    pub async fn send(&mut self, value: Value) -> Result<Option<Value>> {
        if self.done {
            return Ok(None);
        }
        let payload = self.inner.serializer.serialize_result(&value)?;
        self.command(StreamCommand::Send(payload)).await
    }

    /// Inject an error into the generator. A generator that catches it
    /// yields its answer; one that does not terminates the stream with the
    /// error.
    pub async fn throw(&mut self, ename: &str, evalue: &str) -> Result<Option<Value>> {
        if self.done {
            return Ok(None);
        }
        self.command(StreamCommand::Throw(ename.to_string(), evalue.to_string()))
            .await
    }

    /// Close the generator and release its service worker. Safe to call on
    /// a finished stream.
    pub async fn close(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        match self.command(StreamCommand::Close).await {
            Ok(_) => Ok(()),
            // the driver may have gone away concurrently; that is a close
            Err(RpcError::Remote(err)) if err.ename == "ValueError" => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn command(&mut self, command: StreamCommand) -> Result<Option<Value>> {
        let frames = codec::build_stream_command(&self.req_id, command);
        self.inner.socket.send(frames)?;

        match self.rx.recv().await {
            Some(ReplyEvent::Yielded(payload)) => {
                Ok(Some(self.inner.serializer.deserialize_result(&payload)?))
            }
            Some(ReplyEvent::Return(_)) => {
                self.done = true;
                Ok(None)
            }
            Some(ReplyEvent::Failure(err)) => {
                self.done = true;
                if err.is_stop_iteration() {
                    Ok(None)
                } else {
                    Err(RpcError::Remote(err))
                }
            }
            Some(ReplyEvent::StreamStart) | Some(ReplyEvent::Closed) | None => {
                self.done = true;
                Err(RpcError::closed())
            }
        }
    }

    /// Drain the remaining values into a vector.
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await? {
            values.push(value);
        }
        Ok(values)
    }
}

impl Drop for RpcStream {
    fn drop(&mut self) {
        if !self.done {
            // best effort: release the service worker pinned by this stream
            let frames = codec::build_stream_command(&self.req_id, StreamCommand::Close);
            let _ = self.inner.socket.send(frames);
            lock_pending(&self.inner.pending).remove(&self.req_id);
        }
    }
}
