//! An in-process implementation of the multipath transport contract.
//!
//! Hosts are keyed by their endpoint strings; every socket sees the same
//! configured path topology. Per-path connections are tokio duplex pipes,
//! so a seeder and its leechers can run inside one process, which is what
//! the engine tests do. Dialing a listener only transfers the caller's
//! socket address (the addr packet); data connections are always opened by
//! the dial-back side, one per selected path.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use futures::future::BoxFuture;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{
    CloseSignal, Conn, ConnEvent, ConnectOptions, Listener, Multipath,
    PathSelector, PeerSocket, SocketOptions,
};
use crate::{
    error::*,
    pathselection::{Path, PathSet},
};

/// The buffer of one direction of an in-memory connection.
const PIPE_CAPACITY: usize = 256 * 1024;

/// A process wide fake network. Clones share the same state.
#[derive(Clone)]
pub struct MemNetwork {
    inner: Arc<Inner>,
}

struct Inner {
    /// The paths every socket pair can use.
    paths: Vec<Path>,
    next_conn_id: AtomicU64,
    state: Mutex<NetState>,
}

#[derive(Default)]
struct NetState {
    /// Accept queues of bound listeners, keyed by address.
    listeners: HashMap<String, UnboundedSender<String>>,
    /// Event queues of bound peer sockets, keyed by address.
    socks: HashMap<String, UnboundedSender<ConnEvent>>,
}

impl MemNetwork {
    pub fn new(paths: Vec<Path>) -> Self {
        Self {
            inner: Arc::new(Inner {
                paths,
                next_conn_id: AtomicU64::new(0),
                state: Mutex::new(NetState::default()),
            }),
        }
    }

    fn next_conn_id(&self) -> String {
        format!(
            "conn-{}",
            self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed)
        )
    }
}

impl Multipath for MemNetwork {
    fn listener(&self, local: &str) -> Result<Box<dyn Listener>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock().unwrap();
        state.listeners.insert(local.to_string(), tx);
        Ok(Box::new(MemListener { accepts: rx }))
    }

    fn peer_socket(
        &self,
        local: &str,
        remote: &str,
        _opts: SocketOptions,
    ) -> Result<Box<dyn PeerSocket>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Box::new(MemPeerSock {
            net: self.clone(),
            local: local.to_string(),
            remote: remote.to_string(),
            events_tx,
            events_rx: Some(events_rx),
            selector: None,
            dialed: Vec::new(),
        }))
    }
}

struct MemListener {
    accepts: UnboundedReceiver<String>,
}

impl Listener for MemListener {
    fn accept(&mut self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.accepts.recv().await.ok_or_else(|| {
                Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "listener closed",
                ))
            })
        })
    }
}

/// Bookkeeping for one connection this socket dialed.
struct DialedConn {
    id: String,
    path: Path,
    // close signals of our end and the remote end
    signals: [Arc<CloseSignal>; 2],
}

struct MemPeerSock {
    net: MemNetwork,
    local: String,
    remote: String,
    events_tx: UnboundedSender<ConnEvent>,
    events_rx: Option<UnboundedReceiver<ConnEvent>>,
    selector: Option<Arc<dyn PathSelector>>,
    dialed: Vec<DialedConn>,
}

impl MemPeerSock {
    /// Opens one connection over the given path, delivering the far end to
    /// the remote socket's event queue. Must be called with the net state
    /// lock held via `state`.
    fn open_conn(&mut self, state: &mut NetState, path: &Path) -> Option<Conn> {
        let remote_events = match state.socks.get(&self.remote) {
            Some(tx) => tx,
            None => return None,
        };

        let id = self.net.next_conn_id();
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let our_end = Conn::new(
            id.clone(),
            self.remote.clone(),
            Some(path.clone()),
            Box::new(near),
        );
        let their_end = Conn::new(
            id.clone(),
            self.local.clone(),
            Some(path.clone()),
            Box::new(far),
        );

        self.dialed.push(DialedConn {
            id,
            path: path.clone(),
            signals: [our_end.close_signal(), their_end.close_signal()],
        });
        // the remote may have gone away concurrently; the closed flag
        // takes care of the half open conn then
        let _ = remote_events.send(ConnEvent::Opened(their_end));
        Some(our_end)
    }

    fn withdraw_conn(&mut self, state: &mut NetState, pos: usize) {
        let dialed = self.dialed.remove(pos);
        for signal in dialed.signals.iter() {
            signal.close();
        }
        if let Some(remote_events) = state.socks.get(&self.remote) {
            let _ = remote_events.send(ConnEvent::Closed(dialed.id.clone()));
        }
        let _ = self.events_tx.send(ConnEvent::Closed(dialed.id));
    }
}

impl PeerSocket for MemPeerSock {
    fn local_addr(&self) -> &str {
        &self.local
    }

    fn remote_addr(&self) -> &str {
        &self.remote
    }

    fn listen(&mut self) -> Result<()> {
        let mut state = self.net.inner.state.lock().unwrap();
        state.socks.insert(self.local.clone(), self.events_tx.clone());
        Ok(())
    }

    fn connect(
        &mut self,
        selector: Arc<dyn PathSelector>,
        opts: ConnectOptions,
    ) -> BoxFuture<'_, Result<Vec<Conn>>> {
        Box::pin(async move {
            self.selector = Some(Arc::clone(&selector));

            if opts.dont_wait_for_incoming {
                // dial-back side: open one connection per selected path
                let selected =
                    selector.select(&PathSet::new(self.net.inner.paths.clone()));
                let state = Arc::clone(&self.net.inner);
                let mut state = state.state.lock().unwrap();
                let mut conns = Vec::with_capacity(selected.len());
                for path in &selected.paths {
                    match self.open_conn(&mut state, path) {
                        Some(conn) => conns.push(conn),
                        None => {
                            return Err(Error::Transport(std::io::Error::new(
                                std::io::ErrorKind::NotConnected,
                                format!("no socket bound at {}", self.remote),
                            )))
                        }
                    }
                }
                Ok(conns)
            } else {
                // leech side: announce ourselves to the remote listener,
                // then wait for it to dial back
                if opts.send_addr_packet {
                    let state = self.net.inner.state.lock().unwrap();
                    let listener =
                        state.listeners.get(&self.remote).ok_or_else(|| {
                            Error::Transport(std::io::Error::new(
                                std::io::ErrorKind::ConnectionRefused,
                                format!("no listener at {}", self.remote),
                            ))
                        })?;
                    let _ = listener.send(self.local.clone());
                }

                let events = self.events_rx.as_mut().expect(
                    "connect called after connection_events was taken",
                );
                let mut conns = Vec::new();
                match events.recv().await {
                    Some(ConnEvent::Opened(conn)) => conns.push(conn),
                    _ => return Err(Error::Transport(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "remote never dialed back",
                    ))),
                }
                // absorb the rest of the initial dial-back wave
                while let Ok(event) = events.try_recv() {
                    if let ConnEvent::Opened(conn) = event {
                        conns.push(conn);
                    }
                }
                Ok(conns)
            }
        })
    }

    fn available_paths(&self) -> PathSet {
        PathSet::new(self.net.inner.paths.clone())
    }

    fn connection_events(&mut self) -> Option<UnboundedReceiver<ConnEvent>> {
        self.events_rx.take()
    }

    fn force_path_selection(&mut self) {
        let selector = match &self.selector {
            Some(selector) => Arc::clone(selector),
            // not connected yet, nothing to reconcile
            None => return,
        };
        let target = selector.select(&self.available_paths());

        let inner = Arc::clone(&self.net.inner);
        let mut state = inner.state.lock().unwrap();

        // withdraw connections whose path fell out of the selection
        let mut pos = 0;
        while pos < self.dialed.len() {
            if target.contains(&self.dialed[pos].path) {
                pos += 1;
            } else {
                log::debug!(
                    "Withdrawing conn {} from {} (path deselected)",
                    self.dialed[pos].id,
                    self.local
                );
                self.withdraw_conn(&mut state, pos);
            }
        }

        // open connections for newly selected paths
        for path in target.paths.clone() {
            if !self.dialed.iter().any(|d| d.path == path) {
                if let Some(conn) = self.open_conn(&mut state, &path) {
                    let _ = self.events_tx.send(ConnEvent::Opened(conn));
                }
            }
        }
    }

    fn disconnect(&mut self) {
        let inner = Arc::clone(&self.net.inner);
        let mut state = inner.state.lock().unwrap();
        while !self.dialed.is_empty() {
            self.withdraw_conn(&mut state, 0);
        }
        state.socks.remove(&self.local);
    }
}
