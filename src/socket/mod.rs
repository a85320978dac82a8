//! The contract this engine requires from the multipath transport layer.
//!
//! The engine never opens raw network sockets itself. It asks a
//! [`Multipath`] provider for listeners and peer sockets, drives the
//! per-path [`Conn`]s it gets back, and reacts to [`ConnEvent`]s when the
//! underlying connection set changes. The path-aware SCION implementation
//! of this contract lives in a collaborator crate; the in-process
//! [`mem`] implementation backs the tests.

pub mod mem;

use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll, Waker},
};

use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc::UnboundedReceiver,
};

use crate::{
    conf::PathSelectionResponsibility,
    error::*,
    pathselection::{Path, PathSet},
};

/// Selects the subset of available paths a socket should dial over.
///
/// Implementations are supplied by the user of the socket: the leech client
/// dials over a couple of short paths, the seeder either takes the
/// configured number of shortest paths or consults the path deconfliction
/// store.
pub trait PathSelector: Send + Sync {
    fn select(&self, available: &PathSet) -> PathSet;
}

/// Takes the `n` paths with the smallest hop count.
pub struct ShortestPaths {
    pub num_paths: usize,
}

impl PathSelector for ShortestPaths {
    fn select(&self, available: &PathSet) -> PathSet {
        available.shortest(self.num_paths)
    }
}

/// The transport flavor a socket rides on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Quic,
    Plain,
}

/// Options for creating a peer socket.
#[derive(Clone, Debug)]
pub struct SocketOptions {
    pub transport: Transport,
    pub responsibility: PathSelectionResponsibility,
    /// Whether each path gets its own local port.
    pub multiport: bool,
}

/// Options for [`PeerSocket::connect`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectOptions {
    /// Announce our socket address to the remote so it can dial back.
    pub send_addr_packet: bool,
    /// Return right after dialing instead of waiting for the remote to
    /// establish connections towards us.
    pub dont_wait_for_incoming: bool,
    pub no_periodic_path_selection: bool,
    pub no_metrics_collection: bool,
}

/// Byte counters shared with the transport; cheap to clone and safe to
/// read from another task.
#[derive(Clone, Debug, Default)]
pub struct ConnMetrics {
    read_bytes: Arc<AtomicU64>,
    written_bytes: Arc<AtomicU64>,
}

impl ConnMetrics {
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Relaxed)
    }

    fn add_read(&self, n: u64) {
        self.read_bytes.fetch_add(n, Ordering::Relaxed);
    }

    fn add_written(&self, n: u64) {
        self.written_bytes.fetch_add(n, Ordering::Relaxed);
    }
}

/// The byte stream a connection rides on.
pub trait ConnStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ConnStream for T {}

/// Lets the transport fail a connection's pending IO when its path is
/// withdrawn, without owning the stream.
#[derive(Debug, Default)]
pub(crate) struct CloseSignal {
    closed: AtomicBool,
    /// The waker of the one task driving this connection.
    waker: Mutex<Option<Waker>>,
}

impl CloseSignal {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(waker) = self.waker.lock().unwrap().take() {
            waker.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn register(&self, waker: &Waker) {
        *self.waker.lock().unwrap() = Some(waker.clone());
    }
}

/// One established connection over one path.
///
/// A connection is owned by exactly one worker at a time; reads and writes
/// go through the worker's framed codec. The transport keeps a handle on
/// the closed flag to signal path withdrawals.
pub struct Conn {
    id: String,
    remote: String,
    path: Option<Path>,
    stream: Box<dyn ConnStream>,
    metrics: ConnMetrics,
    close: Arc<CloseSignal>,
}

impl Conn {
    pub fn new(
        id: impl Into<String>,
        remote: impl Into<String>,
        path: Option<Path>,
        stream: Box<dyn ConnStream>,
    ) -> Self {
        Self {
            id: id.into(),
            remote: remote.into(),
            path,
            stream,
            metrics: ConnMetrics::default(),
            close: Arc::new(CloseSignal::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The remote peer socket address this connection leads to.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_ref()
    }

    pub fn metrics(&self) -> ConnMetrics {
        self.metrics.clone()
    }

    pub fn is_open(&self) -> bool {
        !self.close.is_closed()
    }

    /// The signal the transport fires when the connection's path is
    /// withdrawn.
    pub(crate) fn close_signal(&self) -> Arc<CloseSignal> {
        Arc::clone(&self.close)
    }

    fn check_closed(&self, cx: &mut Context<'_>) -> Option<std::io::Error> {
        if self.close.is_closed() {
            return Some(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection path withdrawn",
            ));
        }
        // register before delegating so a close after a pending IO still
        // wakes the task
        self.close.register(cx.waker());
        None
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("path", &self.path)
            .finish()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.check_closed(cx) {
            return Poll::Ready(Err(e));
        }
        let before = buf.filled().len();
        let res = Pin::new(&mut this.stream).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            this.metrics.add_read((buf.filled().len() - before) as u64);
        }
        res
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if let Some(e) = this.check_closed(cx) {
            return Poll::Ready(Err(e));
        }
        let res = Pin::new(&mut this.stream).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            this.metrics.add_written(n as u64);
        }
        res
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// A change in a socket's connection set.
#[derive(Debug)]
pub enum ConnEvent {
    /// A new per-path connection was established towards us.
    Opened(Conn),
    /// The connection with the given id lost its path; the owner should
    /// stop using it.
    Closed(String),
}

/// A multipath socket bound to one local port and associated with one
/// remote peer.
pub trait PeerSocket: Send {
    fn local_addr(&self) -> &str;

    fn remote_addr(&self) -> &str;

    /// Binds the socket so the remote can reach it.
    fn listen(&mut self) -> Result<()>;

    /// Dials the remote. Depending on the options this either waits for
    /// the remote to connect back (leech side) or actively opens one
    /// connection per selected path (dial-back side). Returns the
    /// established data connections.
    fn connect(
        &mut self,
        selector: Arc<dyn PathSelector>,
        opts: ConnectOptions,
    ) -> BoxFuture<'_, Result<Vec<Conn>>>;

    /// The paths currently known towards the remote.
    fn available_paths(&self) -> PathSet;

    /// Takes the connection change stream. Yields `None` on repeat calls.
    fn connection_events(&mut self) -> Option<UnboundedReceiver<ConnEvent>>;

    /// Re-runs the path selector against the current availability and
    /// opens/withdraws connections to match. Used by the seeder when the
    /// deconfliction store shifts assignments.
    fn force_path_selection(&mut self);

    fn disconnect(&mut self);
}

/// Accepts peer socket connects on a local address.
pub trait Listener: Send {
    /// Waits for the next remote peer socket to dial us; returns its
    /// address for the dial-back.
    fn accept(&mut self) -> BoxFuture<'_, Result<String>>;
}

/// The factory the engine uses to create listeners and peer sockets.
pub trait Multipath: Send + Sync {
    fn listener(&self, local: &str) -> Result<Box<dyn Listener>>;

    fn peer_socket(
        &self,
        local: &str,
        remote: &str,
        opts: SocketOptions,
    ) -> Result<Box<dyn PeerSocket>>;
}
