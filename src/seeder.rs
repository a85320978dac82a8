//! The seeder: accepts leechers, dials back over path diverse connections,
//! and serves piece requests.
//!
//! Path selection is server steered. A leecher only ever dials in once;
//! the seeder then opens the actual data connections outbound from a fresh
//! local port, one per path the deconfliction store assigned to that
//! leecher. Admitting a new leecher may shift the assignments of the
//! existing ones, in which case their sockets are forced to re-select
//! paths.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinSet, time::timeout};
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;

use crate::{
    addr::ScionAddr,
    client::HANDSHAKE_TIMEOUT,
    conf::{DiscoveryConf, PathSelectionResponsibility},
    dht::{DhtBackend, DhtNode},
    error::*,
    metainfo::Metainfo,
    pathselection::{PathSet, PathSelectionStore, PeerPathEntry, SharedPathStore},
    peer::{
        codec::{HandshakeCodec, Message, PeerCodec},
        PeerSet,
    },
    piece_len,
    socket::{
        Conn, ConnEvent, ConnMetrics, ConnectOptions, Multipath, PathSelector,
        PeerSocket, ShortestPaths, SocketOptions, Transport,
    },
    torrent::State,
    Bitfield, PieceIndex, Sha1Hash, MAX_BLOCK_LEN,
};

/// Dial back ports advance by this much per accepted leecher, skipping the
/// heavily used port neighborhoods.
const PORT_STRIDE: u32 = 101;
const PORT_MIN: u32 = 1025;
const PORT_MAX: u32 = 65000;

/// Hands out local ports for dial back sockets. The underlying dispatcher
/// does not allow rebinding a closed port, so ports are one-shot for the
/// life of the process.
pub(crate) struct PortRegistry {
    state: Mutex<PortRegistryState>,
}

struct PortRegistryState {
    next: u32,
    used: HashSet<u16>,
}

impl PortRegistry {
    pub fn new(start_port: u16) -> Self {
        Self {
            state: Mutex::new(PortRegistryState {
                next: start_port as u32,
                used: HashSet::new(),
            }),
        }
    }

    /// Allocates the next free port in `[1025, 65000]`.
    pub fn alloc(&self) -> u16 {
        let mut state = self.state.lock().unwrap();
        loop {
            let mut next = state.next + PORT_STRIDE;
            if !(PORT_MIN..=PORT_MAX).contains(&next) {
                next = PORT_MIN + next % (PORT_MAX - PORT_MIN + 1);
            }
            state.next = next;
            let port = next as u16;
            if state.used.insert(port) {
                return port;
            }
        }
    }
}

/// Selects the store assigned paths of one peer, in store order, dropping
/// ones that are no longer available.
struct StoreSelection {
    store: SharedPathStore,
    peer_addr: String,
}

impl PathSelector for StoreSelection {
    fn select(&self, available: &PathSet) -> PathSet {
        match self.store.get(&self.peer_addr) {
            Some(entry) => PathSet::new(
                entry
                    .used
                    .into_iter()
                    .filter(|path| available.contains(path))
                    .collect(),
            ),
            None => PathSet::default(),
        }
    }
}

/// Upload accounting for one dial back connection.
pub struct UploadConnMetrics {
    pub conn_id: String,
    pub remote: String,
    pub path: String,
    pub metrics: ConnMetrics,
    pub duration: Duration,
}

impl UploadConnMetrics {
    pub fn csv_header() -> &'static str {
        "id;remote;uploadBytes;path;durationSecs"
    }

    pub fn csv(&self) -> String {
        format!(
            "{};{};{};{};{}",
            self.conn_id,
            self.remote,
            self.metrics.written_bytes(),
            self.path,
            self.duration.as_secs()
        )
    }
}

type SocketHandle = Arc<Mutex<Box<dyn PeerSocket>>>;

/// A seeder for a single torrent whose full content it holds in memory.
pub struct Seeder {
    this: Weak<Seeder>,
    transport: Arc<dyn Multipath>,
    local: ScionAddr,
    info_hash: Sha1Hash,
    bitfield: Bitfield,
    piece_length: u32,
    content: Vec<u8>,
    num_paths: usize,
    print_metrics: bool,
    store: SharedPathStore,
    ports: PortRegistry,
    peers: PeerSet,
    discovery: DiscoveryConf,
    dht_node: Mutex<Option<Arc<DhtNode>>>,
    /// The dial back socket of every active leecher, so an admission can
    /// force the others to re-select paths.
    sockets: Mutex<HashMap<String, SocketHandle>>,
    state: Mutex<State>,
    cancel: CancellationToken,
}

impl Seeder {
    /// Creates a seeder for the torrent's content. If discovery has DHT
    /// enabled and a backend is supplied, a DHT node announcing the
    /// torrent is started as well.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Multipath>,
        local: ScionAddr,
        metainfo: &Metainfo,
        content: Vec<u8>,
        responsibility: PathSelectionResponsibility,
        num_paths: usize,
        dial_back_start_port: u16,
        discovery: DiscoveryConf,
        dht_backend: Option<Arc<dyn DhtBackend>>,
    ) -> Result<Arc<Self>> {
        // there is no efficient way to do client steered selection here,
        // and for BitTorrent it would not buy anything
        if responsibility == PathSelectionResponsibility::Client {
            return Err(Error::Config(
                "client based path selection not supported".into(),
            ));
        }
        if content.len() as u64 != metainfo.total_len() {
            return Err(Error::Config(format!(
                "content is {} bytes, metainfo says {}",
                content.len(),
                metainfo.total_len()
            )));
        }

        let piece_count = metainfo.piece_hashes()?.len();
        let mut bitfield = Bitfield::repeat(false, piece_count);
        for index in 0..piece_count {
            bitfield.set(index, true);
        }

        let info_hash = metainfo.create_info_hash()?;
        let peers = PeerSet::new();

        let seeder = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            transport,
            local: local.clone(),
            info_hash,
            bitfield,
            piece_length: metainfo.info.piece_length,
            content,
            num_paths,
            print_metrics: false,
            store: PathSelectionStore::new(),
            ports: PortRegistry::new(dial_back_start_port),
            peers: peers.clone(),
            discovery: discovery.clone(),
            dht_node: Mutex::new(None),
            sockets: Mutex::new(HashMap::new()),
            state: Mutex::new(State::NotStarted),
            cancel: CancellationToken::new(),
        });

        if discovery.enable_dht {
            if let Some(backend) = dht_backend {
                let node_addr = local.with_port(discovery.dht_port);
                let mut starting_nodes = metainfo.dht_nodes()?;
                starting_nodes.extend(discovery.dht_nodes.iter().cloned());

                let known_peers = peers;
                let node = DhtNode::new(
                    backend,
                    node_addr,
                    info_hash,
                    starting_nodes,
                    local.port,
                    Box::new(move |peer| {
                        log::info!(
                            "Received peer via dht: {}, peer already known: {}",
                            peer,
                            known_peers.contains(&peer)
                        );
                        known_peers.add(peer);
                    }),
                );
                *seeder.dht_node.lock().unwrap() = Some(node);
            }
        }

        Ok(seeder)
    }

    fn arc(&self) -> Arc<Self> {
        self.this.upgrade().expect("seeder deallocated while in use")
    }

    pub fn state(&self) -> State {
        self.state.lock().unwrap().clone()
    }

    pub fn store(&self) -> &SharedPathStore {
        &self.store
    }

    /// The peers the DHT has reported for this torrent so far.
    pub fn known_peers(&self) -> &PeerSet {
        &self.peers
    }

    fn dht_node(&self) -> Option<Arc<DhtNode>> {
        self.dht_node.lock().unwrap().clone()
    }

    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(dht) = self.dht_node.lock().unwrap().take() {
            dht.close();
        }
    }

    /// Accepts leechers forever, dialing back to each from its own local
    /// port.
    pub async fn listen_handshake(&self) -> Result<()> {
        let mut listener = self.transport.listener(&self.local.to_string())?;
        *self.state.lock().unwrap() = State::Seeding;
        log::info!("Seeding {} bytes on {}", self.content.len(), self.local);

        loop {
            let remote = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                remote = listener.accept() => remote?,
            };
            log::info!("Got new leecher {}, dialing back", remote);
            let port = self.ports.alloc();
            let seeder = self.arc();
            tokio::spawn(async move {
                if let Err(e) = seeder.serve_leecher(remote.clone(), port).await
                {
                    log::warn!("Serving leecher {} failed: {}", remote, e);
                }
            });
        }
    }

    /// The driver for one leecher: dial back over the assigned paths, run
    /// one serve loop per connection, follow connection set changes, and
    /// release everything when no connections remain.
    async fn serve_leecher(
        self: Arc<Self>,
        remote: String,
        port: u16,
    ) -> Result<()> {
        let local = self.local.with_port(port).to_string();
        let mut socket = self.transport.peer_socket(
            &local,
            &remote,
            SocketOptions {
                transport: Transport::Quic,
                responsibility: PathSelectionResponsibility::Client,
                multiport: true,
            },
        )?;
        log::debug!("Dial back socket listening on {}", local);
        socket.listen()?;

        // decide which subset of the available paths this leecher gets
        let available = socket.available_paths();
        self.store
            .admit(PeerPathEntry::new(remote.clone(), available.paths));

        let selector: Arc<dyn PathSelector> = if self.num_paths > 0 {
            Arc::new(ShortestPaths {
                num_paths: self.num_paths,
            })
        } else {
            Arc::new(StoreSelection {
                store: Arc::clone(&self.store),
                peer_addr: remote.clone(),
            })
        };
        let conns = match socket
            .connect(
                selector,
                ConnectOptions {
                    send_addr_packet: true,
                    dont_wait_for_incoming: true,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(conns) => conns,
            Err(e) => {
                // hand the assigned paths back for future admissions
                self.store.remove(&remote);
                return Err(e);
            }
        };
        let mut events = socket.connection_events();

        let socket: SocketHandle = Arc::new(Mutex::new(socket));
        self.sockets
            .lock()
            .unwrap()
            .insert(remote.clone(), Arc::clone(&socket));
        // this admission may have stolen paths from other leechers
        self.force_path_selection_except(&remote);

        log::info!(
            "Starting upload to {} over {} connections",
            remote,
            conns.len()
        );
        let mut handlers = JoinSet::new();
        let mut handles = HashMap::new();
        for conn in conns {
            self.spawn_handler(&mut handlers, &mut handles, conn);
        }

        loop {
            if handles.is_empty() {
                // either the leecher is gone or a path shift is about to
                // replace the connection set; let queued events decide
                let replacement = match &mut events {
                    Some(events) => {
                        timeout(Duration::from_millis(100), events.recv())
                            .await
                            .ok()
                            .flatten()
                    }
                    None => None,
                };
                match replacement {
                    Some(ConnEvent::Opened(conn)) => {
                        log::debug!("Attaching to new conn {}", conn.id());
                        self.spawn_handler(&mut handlers, &mut handles, conn);
                        continue;
                    }
                    Some(ConnEvent::Closed(_)) => continue,
                    // no connections remain
                    None => break,
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                joined = handlers.join_next() => match joined {
                    None => {}
                    Some(Ok((id, res))) => {
                        handles.remove(&id);
                        if let Err(e) = res {
                            log::warn!("Conn {} to {} ended: {}", id, remote, e);
                        }
                    }
                    // aborted by a path withdrawal, or panicked
                    Some(Err(e)) => {
                        if e.is_panic() {
                            log::warn!("Conn handler panicked: {}", e);
                        }
                    }
                },
                event = next_event(&mut events) => match event {
                    Some(ConnEvent::Opened(conn)) => {
                        log::debug!("Attaching to new conn {}", conn.id());
                        self.spawn_handler(&mut handlers, &mut handles, conn);
                    }
                    Some(ConnEvent::Closed(id)) => {
                        if let Some(handle) = handles.remove(&id) {
                            handle.abort();
                        }
                    }
                    None => events = None,
                },
            }
        }

        self.sockets.lock().unwrap().remove(&remote);
        self.store.remove(&remote);
        socket.lock().unwrap().disconnect();
        log::info!("Leecher {} disconnected", remote);
        Ok(())
    }

    fn spawn_handler(
        &self,
        handlers: &mut JoinSet<(String, Result<()>)>,
        handles: &mut HashMap<String, tokio::task::AbortHandle>,
        conn: Conn,
    ) {
        let id = conn.id().to_string();
        let seeder = self.arc();
        let handle = handlers.spawn(async move {
            let id = conn.id().to_string();
            let res = seeder.handle_connection(conn).await;
            (id, res)
        });
        handles.insert(id, handle);
    }

    /// Forces every other leecher's socket to reconcile its connections
    /// with the store's (possibly shifted) path assignment.
    fn force_path_selection_except(&self, admitted: &str) {
        let sockets: Vec<SocketHandle> = self
            .sockets
            .lock()
            .unwrap()
            .iter()
            .filter(|(addr, _)| addr.as_str() != admitted)
            .map(|(_, socket)| Arc::clone(socket))
            .collect();
        for socket in sockets {
            socket.lock().unwrap().force_path_selection();
        }
    }

    /// The per connection serve state machine.
    async fn handle_connection(self: Arc<Self>, conn: Conn) -> Result<()> {
        let conn_id = conn.id().to_string();
        let remote = conn.remote().to_string();
        let path = conn.path().map(|p| p.to_string()).unwrap_or_default();
        let metrics = conn.metrics();
        let started = Instant::now();

        let res = self.drive_connection(conn, &remote).await;

        if self.print_metrics {
            let upload = UploadConnMetrics {
                conn_id,
                remote,
                path,
                metrics,
                duration: started.elapsed(),
            };
            log::info!("{}", upload.csv());
        }
        res
    }

    async fn drive_connection(&self, conn: Conn, remote: &str) -> Result<()> {
        // the leecher speaks first
        let mut framed = Framed::new(conn, HandshakeCodec);
        let their_handshake =
            match timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
                Err(_) => return Err(Error::Timeout),
                Ok(None) => return Err(Error::BadHandshake),
                Ok(Some(handshake)) => handshake?,
            };
        if their_handshake.info_hash != self.info_hash {
            return Err(Error::InfoHashMismatch);
        }
        let peer_supports_dht = their_handshake.supports_dht();
        framed.send(their_handshake).await?;

        let old_parts = framed.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut framed = Framed::from_parts(new_parts);

        // we are a seeder: announce everything
        framed.send(Message::Bitfield(self.bitfield.clone())).await?;

        // BEP-5 peer exchange: tell the leecher where our dht listens
        if peer_supports_dht && self.discovery.enable_dht {
            if let Some(port) = self.dht_node().and_then(|dht| dht.port()) {
                framed.send(Message::Port(port)).await?;
            }
        }

        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                msg = framed.next() => match msg {
                    // leecher hung up
                    None => return Ok(()),
                    Some(msg) => msg?,
                },
            };
            match msg {
                Message::KeepAlive => {}
                Message::Interested => {
                    // a seeder always unchokes and never re-chokes
                    framed.send(Message::Unchoke).await?;
                }
                Message::NotInterested => {}
                Message::Have(index) => {
                    log::trace!("Leecher {} now has piece {}", remote, index);
                }
                Message::Request { index, begin, len } => {
                    let block = self.read_block(index, begin, len)?;
                    framed
                        .send(Message::Piece {
                            index,
                            begin,
                            block,
                        })
                        .await?;
                }
                Message::Port(port) => self.handle_port_msg(remote, port),
                msg => {
                    log::warn!(
                        "Leecher {} sent unexpected message: {:?}",
                        remote,
                        msg.id()
                    );
                }
            }
        }
    }

    /// Bounds-checks a request and slices the block out of the content.
    fn read_block(
        &self,
        index: PieceIndex,
        begin: u32,
        len: u32,
    ) -> Result<Vec<u8>> {
        if index >= self.bitfield.len() {
            return Err(Error::MalformedMessage(format!(
                "request for out of range piece {}",
                index
            )));
        }
        let piece_len =
            piece_len(self.content.len() as u64, self.piece_length, index);
        let end = begin.checked_add(len).filter(|end| *end <= piece_len);
        let end = match end {
            Some(end) if len <= MAX_BLOCK_LEN => end,
            _ => {
                return Err(Error::MalformedMessage(format!(
                    "request [{}+{}] exceeds piece {} of length {}",
                    begin, len, index, piece_len
                )))
            }
        };
        let offset = index * self.piece_length as usize + begin as usize;
        Ok(self.content[offset..offset + (end - begin) as usize].to_vec())
    }

    /// BEP-5 peer exchange: the leecher told us its DHT port, so ping its
    /// DHT node through ours.
    fn handle_port_msg(&self, remote: &str, port: u16) {
        let dht = match self.dht_node() {
            Some(dht) if self.discovery.enable_dht => dht,
            _ => {
                log::info!("Got port message but dht is not enabled");
                return;
            }
        };
        match ScionAddr::parse(remote) {
            Ok(addr) => dht.ping(&addr.with_port(port)),
            Err(e) => {
                log::error!("Could not get remote from port message: {}", e)
            }
        }
    }
}

/// Waits for the next connection event, or forever once the stream is
/// gone.
async fn next_event(
    events: &mut Option<UnboundedReceiver<ConnEvent>>,
) -> Option<ConnEvent> {
    match events {
        Some(events) => events.recv().await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::time::Duration;

    use super::*;
    use crate::{
        peer::codec::Handshake, socket::mem::MemNetwork, testutil,
        testutil::sample_metainfo,
    };

    #[test]
    fn test_port_registry_strides_and_stays_unique() {
        let ports = PortRegistry::new(41000);
        assert_eq!(ports.alloc(), 41101);
        assert_eq!(ports.alloc(), 41202);
        assert_eq!(ports.alloc(), 41303);
    }

    #[test]
    fn test_port_registry_wraps_into_range() {
        let ports = PortRegistry::new(64950);
        let port = ports.alloc();
        assert!((1025..=65000).contains(&(port as u32)));
        assert_ne!(port as u32, 64950 + PORT_STRIDE);
    }

    #[test]
    fn test_port_registry_never_reuses() {
        let ports = PortRegistry::new(41000);
        let mut seen = HashSet::new();
        for _ in 0..2000 {
            assert!(seen.insert(ports.alloc()));
        }
    }

    #[test]
    fn test_store_selection_preserves_store_order() {
        let store = PathSelectionStore::new();
        let peer = "1-ff00:0:1,[127.0.0.1]:40000";
        store.admit(PeerPathEntry::new(
            peer,
            testutil::paths(&["a-b", "c-d", "e-f"]),
        ));

        let selector = StoreSelection {
            store: Arc::clone(&store),
            peer_addr: peer.to_string(),
        };
        // c-d is gone from the availability set
        let available = PathSet::new(testutil::paths(&["e-f", "a-b"]));
        let selected = selector.select(&available);
        assert_eq!(
            selected.paths,
            testutil::paths(&["a-b", "e-f"]),
            "selection must keep the store's ordering"
        );

        // unknown peers get nothing
        let selector = StoreSelection {
            store,
            peer_addr: "1-ff00:0:9,[10.9.9.9]:4999".to_string(),
        };
        assert!(selector.select(&available).is_empty());
    }

    fn new_seeder(
        net: &MemNetwork,
        local: &str,
        content: Vec<u8>,
        piece_length: u32,
    ) -> Arc<Seeder> {
        let metainfo = sample_metainfo(&content, piece_length);
        Seeder::new(
            Arc::new(net.clone()),
            ScionAddr::parse(local).unwrap(),
            &metainfo,
            content,
            PathSelectionResponsibility::Server,
            0,
            41000,
            DiscoveryConf::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_client_responsibility_is_rejected() {
        let net = MemNetwork::new(testutil::paths(&["a-b"]));
        let content = testutil::file_content(64);
        let metainfo = sample_metainfo(&content, 64);
        let res = Seeder::new(
            Arc::new(net),
            ScionAddr::new("1-ff00:0:2", "127.0.0.2", 50000),
            &metainfo,
            content,
            PathSelectionResponsibility::Client,
            0,
            41000,
            DiscoveryConf::default(),
            None,
        );
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn test_read_block_bounds() {
        let net = MemNetwork::new(testutil::paths(&["a-b"]));
        let content = testutil::file_content(300);
        let seeder = new_seeder(
            &net,
            "1-ff00:0:2,[127.0.0.2]:50000",
            content.clone(),
            256,
        );

        // pieces: 256 + 44 bytes
        assert_eq!(seeder.read_block(0, 0, 256).unwrap(), &content[..256]);
        assert_eq!(seeder.read_block(0, 100, 56).unwrap(), &content[100..156]);
        assert_eq!(seeder.read_block(1, 0, 44).unwrap(), &content[256..300]);

        // over the end of the short last piece
        assert!(seeder.read_block(1, 0, 45).is_err());
        assert!(seeder.read_block(1, 40, 5).is_err());
        // out of range piece
        assert!(seeder.read_block(2, 0, 1).is_err());
        // begin + len overflow must not panic
        assert!(seeder.read_block(0, u32::MAX, 2).is_err());
    }

    #[test]
    fn test_upload_metrics_csv() {
        let upload = UploadConnMetrics {
            conn_id: "conn-1".into(),
            remote: "1-ff00:0:1,[127.0.0.1]:40000".into(),
            path: "a#1>b#1".into(),
            metrics: ConnMetrics::default(),
            duration: Duration::from_secs(3),
        };
        assert_eq!(
            UploadConnMetrics::csv_header(),
            "id;remote;uploadBytes;path;durationSecs"
        );
        assert_eq!(
            upload.csv(),
            "conn-1;1-ff00:0:1,[127.0.0.1]:40000;0;a#1>b#1;3"
        );
    }

    /// Drives the serve state machine by hand: handshake, bitfield,
    /// unchoke on interest, block service.
    #[tokio::test]
    async fn test_serve_state_machine() {
        let net = MemNetwork::new(testutil::paths(&["a-b", "c-d"]));
        let seeder_addr = "1-ff00:0:2,[127.0.0.2]:50000";
        let leecher_addr = "1-ff00:0:1,[127.0.0.1]:40000";
        let content = testutil::file_content(512);
        let seeder =
            new_seeder(&net, seeder_addr, content.clone(), 256);
        let info_hash = seeder.info_hash;

        let seeder_task = {
            let seeder = Arc::clone(&seeder);
            tokio::spawn(async move { seeder.listen_handshake().await })
        };

        // act as the leecher's socket layer
        let mut sock = net
            .peer_socket(
                leecher_addr,
                seeder_addr,
                SocketOptions {
                    transport: Transport::Quic,
                    responsibility: PathSelectionResponsibility::Server,
                    multiport: false,
                },
            )
            .unwrap();
        sock.listen().unwrap();
        let mut conns = sock
            .connect(
                Arc::new(ShortestPaths { num_paths: 1 }),
                ConnectOptions {
                    send_addr_packet: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // the store assigned both disjoint paths to the only leecher
        assert_eq!(conns.len(), 2);

        let conn = conns.remove(0);
        let mut framed = Framed::new(conn, HandshakeCodec);
        framed
            .send(Handshake::new(info_hash, [3; 20], false))
            .await
            .unwrap();
        let echoed = framed.next().await.unwrap().unwrap();
        assert_eq!(echoed.info_hash, info_hash);

        let old_parts = framed.into_parts();
        let mut parts = FramedParts::new(old_parts.io, PeerCodec);
        parts.read_buf = old_parts.read_buf;
        parts.write_buf = old_parts.write_buf;
        let mut framed = Framed::from_parts(parts);

        // bitfield with every piece set
        match framed.next().await.unwrap().unwrap() {
            Message::Bitfield(bitfield) => {
                assert!(bitfield[..2].all());
            }
            msg => panic!("expected bitfield, got {:?}", msg),
        }

        framed.send(Message::Interested).await.unwrap();
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            Message::Unchoke
        );

        framed
            .send(Message::Request {
                index: 1,
                begin: 0,
                len: 256,
            })
            .await
            .unwrap();
        match framed.next().await.unwrap().unwrap() {
            Message::Piece {
                index,
                begin,
                block,
            } => {
                assert_eq!(index, 1);
                assert_eq!(begin, 0);
                assert_eq!(block, &content[256..512]);
            }
            msg => panic!("expected piece, got {:?}", msg),
        }

        seeder.close();
        seeder_task.abort();
    }
}
