//! Socket endpoint actor.
//!
//! zmq sockets are not `Sync`, so each endpoint is owned by a dedicated OS
//! thread that is the only reader and the only writer of its socket. The
//! thread polls the socket and a command channel; async code talks to it
//! through [`SocketHandle`]. Because every outbound message funnels through
//! the one channel, complete multipart messages are sent atomically and in
//! order without any further locking.

use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::codec::Frame;
use crate::error::{Result, RpcError};

/// How long the actor blocks in `poll` before draining commands again.
const POLL_INTERVAL_MS: i64 = 10;

/// Socket flavour for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Client side: fair-queues outbound requests across connected peers.
    Dealer,
    /// Service side: learns peer identities and routes replies back.
    Router,
}

impl SocketKind {
    fn to_zmq(self) -> zmq::SocketType {
        match self {
            SocketKind::Dealer => zmq::DEALER,
            SocketKind::Router => zmq::ROUTER,
        }
    }
}

enum Command {
    Bind(String, oneshot::Sender<Result<String>>),
    Connect(String, oneshot::Sender<Result<()>>),
    Reset(oneshot::Sender<Result<()>>),
    Endpoints(oneshot::Sender<(Vec<String>, Vec<String>)>),
    Send(Vec<Frame>),
    Close,
}

/// Handle to a socket actor thread.
///
/// Dropping the handle closes the socket and stops the thread.
pub struct SocketHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    join: std::sync::Mutex<Option<thread::JoinHandle<()>>>,
}

impl SocketHandle {
    /// Spawn the actor thread for a fresh socket of the given kind.
    ///
    /// Returns the handle and the channel on which inbound multipart
    /// messages arrive. The channel closes when the socket does.
    pub fn spawn(
        context: zmq::Context,
        kind: SocketKind,
    ) -> (SocketHandle, mpsc::UnboundedReceiver<Vec<Frame>>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let join = thread::spawn(move || {
            let mut actor = Actor {
                context,
                kind,
                bound: Vec::new(),
                connected: Vec::new(),
            };
            actor.run(cmd_rx, in_tx);
        });

        let handle = SocketHandle {
            cmd_tx,
            join: std::sync::Mutex::new(Some(join)),
        };
        (handle, in_rx)
    }

    /// Bind to a URL and return the resolved endpoint (port 0 reports the
    /// ephemeral port the OS picked).
    pub async fn bind(&self, url: &str) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Bind(url.to_string(), tx))?;
        rx.await.map_err(|_| RpcError::closed())?
    }

    /// Connect to a URL. May be called repeatedly to add endpoints.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(url.to_string(), tx))?;
        rx.await.map_err(|_| RpcError::closed())?
    }

    /// Close the socket, recreate it and re-establish every recorded bind
    /// and connection.
    pub async fn reset(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Reset(tx))?;
        rx.await.map_err(|_| RpcError::closed())?
    }

    /// The currently bound and connected URLs, in that order.
    pub async fn endpoints(&self) -> Result<(Vec<String>, Vec<String>)> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Endpoints(tx))?;
        rx.await.map_err(|_| RpcError::closed())
    }

    /// Enqueue one complete multipart message for sending.
    pub fn send(&self, frames: Vec<Frame>) -> Result<()> {
        self.command(Command::Send(frames))
    }

    /// Ask the actor to close the socket and exit, then wait for the thread.
    /// Safe to call more than once.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
        let join = self.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| RpcError::closed())
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

struct Actor {
    context: zmq::Context,
    kind: SocketKind,
    bound: Vec<String>,
    connected: Vec<String>,
}

impl Actor {
    fn run(
        &mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        in_tx: mpsc::UnboundedSender<Vec<Frame>>,
    ) {
        let mut socket = match self.create_socket() {
            Ok(socket) => socket,
            Err(err) => {
                warn!(%err, "could not create socket");
                return;
            }
        };

        'outer: loop {
            // drain pending commands without blocking
            loop {
                match cmd_rx.try_recv() {
                    Ok(Command::Close) => break 'outer,
                    Ok(cmd) => {
                        if let Err(err) = self.handle(&mut socket, cmd) {
                            warn!(%err, "socket command failed");
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => break 'outer,
                }
            }

            match socket.poll(zmq::POLLIN, POLL_INTERVAL_MS) {
                Ok(0) => {}
                Ok(_) => {
                    // drain every message that is already queued
                    loop {
                        match socket.recv_multipart(zmq::DONTWAIT) {
                            Ok(frames) => {
                                if in_tx.send(frames).is_err() {
                                    break 'outer;
                                }
                            }
                            Err(zmq::Error::EAGAIN) => break,
                            Err(err) => {
                                warn!(%err, "receive failed, closing socket");
                                break 'outer;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, "poll failed, closing socket");
                    break;
                }
            }
        }

        let _ = socket.set_linger(0);
        debug!(kind = ?self.kind, "socket actor exited");
    }

    fn create_socket(&self) -> Result<zmq::Socket> {
        let socket = self.context.socket(self.kind.to_zmq())?;
        socket.set_linger(0)?;
        Ok(socket)
    }

    fn handle(&mut self, socket: &mut zmq::Socket, cmd: Command) -> Result<()> {
        match cmd {
            Command::Bind(url, reply) => {
                let result = self.bind(socket, &url);
                if let Ok(resolved) = &result {
                    self.bound.push(resolved.clone());
                }
                let _ = reply.send(result);
            }
            Command::Connect(url, reply) => {
                let result = socket.connect(&url).map_err(RpcError::from);
                if result.is_ok() {
                    self.connected.push(url);
                }
                let _ = reply.send(result);
            }
            Command::Reset(reply) => {
                let _ = reply.send(self.reset(socket));
            }
            Command::Endpoints(reply) => {
                let _ = reply.send((self.bound.clone(), self.connected.clone()));
            }
            Command::Send(frames) => {
                socket.send_multipart(frames, 0)?;
            }
            Command::Close => unreachable!("handled by the run loop"),
        }
        Ok(())
    }

    fn bind(&self, socket: &zmq::Socket, url: &str) -> Result<String> {
        // zmq spells "pick an ephemeral port" as a * wildcard
        let url = match url.strip_suffix(":0") {
            Some(base) if url.starts_with("tcp://") => format!("{base}:*"),
            _ => url.to_string(),
        };
        socket.bind(&url)?;
        match socket.get_last_endpoint() {
            Ok(Ok(resolved)) => Ok(resolved),
            _ => Ok(url),
        }
    }

    fn reset(&mut self, socket: &mut zmq::Socket) -> Result<()> {
        let fresh = self.create_socket()?;
        let old = std::mem::replace(socket, fresh);
        let _ = old.set_linger(0);
        drop(old);

        for url in &self.bound {
            socket.bind(url)?;
        }
        for url in &self.connected {
            socket.connect(url)?;
        }
        Ok(())
    }
}
