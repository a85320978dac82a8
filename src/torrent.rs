//! The torrent session: the leech side piece engine and its lifecycle.
//!
//! One session exists per info hash. A download pushes every piece onto a
//! shared work queue, spawns one driver per known peer, and each driver
//! runs one worker per established connection. Workers pull work, request
//! blocks with a bounded pipeline, verify each assembled piece against its
//! SHA-1 digest, and emit results; the session driver alone writes them
//! into the assembly buffer. Connection scoped faults requeue the piece
//! and kill only the affected worker.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU16, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use sha1::{Digest, Sha1};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinSet,
    time::timeout_at,
};
use tokio_util::sync::CancellationToken;

use crate::{
    addr::ScionAddr,
    block_len,
    client::{LeechConn, MpClient},
    conf::{DiscoveryConf, PathSelectionResponsibility},
    dht::{DhtBackend, DhtNode},
    error::*,
    metainfo::Metainfo,
    peer::{codec::Message, Peer, PeerSet},
    piece_len,
    socket::{ConnEvent, ConnMetrics, Multipath},
    PieceIndex, PeerId, Sha1Hash, MAX_BACKLOG,
};

/// The wall clock budget for downloading one piece over one connection.
/// More than enough for a 256 KiB piece; a connection that blows it is
/// considered dead for the session.
const PIECE_DEADLINE: Duration = Duration::from_secs(30);

/// How often a failed peer is redialed while work remains.
const PEER_ATTEMPTS: usize = 3;

/// The coarse lifecycle of a session, as exposed to a control plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    NotStarted,
    Running,
    FinishedSuccessfully,
    FinishedFailed(String),
    FinishedCancelled,
    Seeding,
}

/// One piece that still needs downloading. Enqueued once per piece at
/// session start, requeued on failure, gone only once a verified result
/// was produced.
#[derive(Clone, Debug)]
struct PieceWork {
    index: PieceIndex,
    hash: Sha1Hash,
    len: u32,
}

/// A downloaded and verified piece.
struct PieceResult {
    index: PieceIndex,
    buf: Vec<u8>,
}

/// What peer drivers report back to the session driver.
enum DriverEvent {
    Piece(PieceResult),
    /// The last live driver gave up; nobody is working the queue anymore.
    PeersExhausted,
}

/// The download state of one in-flight piece, owned by its worker.
struct PieceProgress {
    index: PieceIndex,
    buf: Vec<u8>,
    downloaded: u32,
    requested: u32,
    backlog: u32,
}

impl PieceProgress {
    fn new(index: PieceIndex, len: u32) -> Self {
        Self {
            index,
            buf: vec![0; len as usize],
            downloaded: 0,
            requested: 0,
            backlog: 0,
        }
    }

    /// Places a received block into the piece buffer at its declared
    /// offset.
    fn on_block(
        &mut self,
        index: PieceIndex,
        begin: u32,
        block: &[u8],
    ) -> Result<()> {
        if index != self.index {
            return Err(Error::MalformedMessage(format!(
                "expected block of piece {}, got piece {}",
                self.index, index
            )));
        }
        let begin = begin as usize;
        if begin + block.len() > self.buf.len() {
            return Err(Error::MalformedMessage(format!(
                "block [{}, {}) exceeds piece length {}",
                begin,
                begin + block.len(),
                self.buf.len()
            )));
        }
        self.buf[begin..begin + block.len()].copy_from_slice(block);
        self.downloaded += block.len() as u32;
        self.backlog = self.backlog.saturating_sub(1);
        Ok(())
    }
}

/// The multi producer multi consumer piece queue shared by all workers of
/// a session. Capacity is the piece count: every piece is in the queue at
/// most once.
struct WorkQueue {
    state: Mutex<WorkQueueState>,
    notify: Notify,
}

struct WorkQueueState {
    items: VecDeque<PieceWork>,
    closed: bool,
}

impl WorkQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WorkQueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Enqueues work; used both for the initial fill and for requeues.
    /// Pushes onto a closed queue are dropped.
    fn push(&self, work: PieceWork) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.items.push_back(work);
        drop(state);
        self.notify.notify_one();
    }

    /// Takes the next work item, waiting for one if the queue is empty.
    /// Returns `None` once the queue is closed.
    async fn pop(&self) -> Option<PieceWork> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so a push or close between the
            // check and the await still wakes us
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(work) = state.items.pop_front() {
                    return Some(work);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }
}

/// Everything a peer driver needs from the running download.
#[derive(Clone)]
struct DownloadCtx {
    queue: Arc<WorkQueue>,
    results: mpsc::UnboundedSender<DriverEvent>,
    /// Live driver count; the driver dropping it to zero reports peer
    /// exhaustion.
    drivers: Arc<AtomicUsize>,
}

/// A torrent session holding everything required to download or seed one
/// torrent from a set of peers.
pub struct Torrent {
    /// Handle to our own allocation, for handing owned references to
    /// spawned tasks. Workers never store it back, so no cycle forms.
    this: Weak<Torrent>,
    transport: Arc<dyn Multipath>,
    peer_set: PeerSet,
    peer_id: PeerId,
    info_hash: Sha1Hash,
    piece_hashes: Vec<Sha1Hash>,
    piece_length: u32,
    length: u64,
    name: String,
    local: ScionAddr,
    discovery: DiscoveryConf,
    dht_node: Mutex<Option<Arc<DhtNode>>>,
    state: Mutex<State>,
    done_pieces: AtomicUsize,
    /// Present while a download is running so late discovered peers can
    /// join it.
    download_ctx: Mutex<Option<DownloadCtx>>,
    /// `(conn id, path, counters)` of every connection ever used, for the
    /// completion summary.
    conn_metrics: Mutex<Vec<(String, String, ConnMetrics)>>,
    /// Each peer socket gets a fresh local port carved from here.
    next_socket_port: AtomicU16,
    cancel: CancellationToken,
}

impl Torrent {
    pub fn new(
        transport: Arc<dyn Multipath>,
        local: ScionAddr,
        metainfo: &Metainfo,
        responsibility: PathSelectionResponsibility,
        discovery: DiscoveryConf,
    ) -> Result<Arc<Self>> {
        if responsibility == PathSelectionResponsibility::Client {
            return Err(Error::Config(
                "client based path selection not supported".into(),
            ));
        }

        let info_hash = metainfo.create_info_hash()?;
        let piece_hashes = metainfo.piece_hashes()?;
        let next_socket_port = local.port.wrapping_add(1).max(1025);
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            transport,
            peer_set: PeerSet::new(),
            peer_id: rand::random(),
            info_hash,
            piece_hashes,
            piece_length: metainfo.info.piece_length,
            length: metainfo.total_len(),
            name: metainfo.info.name.clone(),
            local,
            discovery,
            dht_node: Mutex::new(None),
            state: Mutex::new(State::NotStarted),
            done_pieces: AtomicUsize::new(0),
            download_ctx: Mutex::new(None),
            conn_metrics: Mutex::new(Vec::new()),
            next_socket_port: AtomicU16::new(next_socket_port),
            cancel: CancellationToken::new(),
        }))
    }

    /// An owning handle to this session, for spawning tasks.
    fn arc(&self) -> Arc<Self> {
        self.this.upgrade().expect("session deallocated while in use")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info_hash(&self) -> Sha1Hash {
        self.info_hash
    }

    pub fn peer_set(&self) -> &PeerSet {
        &self.peer_set
    }

    /// Adds a statically known peer; returns whether it was new.
    pub fn add_peer(&self, peer: Peer) -> bool {
        self.peer_set.add(peer)
    }

    pub fn state(&self) -> State {
        self.state.lock().unwrap().clone()
    }

    /// `(done, total)` piece counts for progress polls.
    pub fn progress(&self) -> (usize, usize) {
        (
            self.done_pieces.load(Ordering::Relaxed),
            self.piece_hashes.len(),
        )
    }

    /// Requests cooperative teardown of the session; a running download
    /// finishes as [`State::FinishedCancelled`] with its partial buffer
    /// discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn dht_node(&self) -> Option<Arc<DhtNode>> {
        self.dht_node.lock().unwrap().clone()
    }

    fn dht_enabled(&self) -> bool {
        self.dht_node.lock().unwrap().is_some()
    }

    /// Starts a DHT node announcing this torrent. Discovered peers join
    /// the peer set, and a running download spawns a driver for each peer
    /// not seen before.
    pub fn enable_dht(
        &self,
        backend: Arc<dyn DhtBackend>,
        bootstrap_nodes: Vec<ScionAddr>,
    ) -> Result<()> {
        let node_addr = self.local.with_port(self.discovery.dht_port);
        let mut starting_nodes = bootstrap_nodes;
        starting_nodes.extend(self.discovery.dht_nodes.iter().cloned());

        let torrent = self.this.clone();
        let node = DhtNode::new(
            backend,
            node_addr,
            self.info_hash,
            starting_nodes,
            self.local.port,
            Box::new(move |peer| {
                let torrent = match torrent.upgrade() {
                    Some(torrent) => torrent,
                    None => return,
                };
                let known = torrent.peer_set.contains(&peer);
                log::info!(
                    "Received peer via dht: {}, peer already known: {}",
                    peer,
                    known
                );
                // don't start two drivers for the same peer
                if torrent.peer_set.add(peer.clone()) {
                    let ctx = torrent.download_ctx.lock().unwrap().clone();
                    if let Some(ctx) = ctx {
                        ctx.drivers.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(
                            Arc::clone(&torrent).peer_driver(peer, ctx),
                        );
                    }
                }
            }),
        );
        *self.dht_node.lock().unwrap() = Some(node);
        Ok(())
    }

    /// Downloads the torrent, returning the assembled and verified file
    /// bytes. The entire file is held in memory.
    pub async fn download(&self) -> Result<Vec<u8>> {
        log::info!("Starting download for {}", self.name);
        *self.state.lock().unwrap() = State::Running;
        self.done_pieces.store(0, Ordering::SeqCst);

        // init the queue workers retrieve work from and the channel they
        // report results on
        let queue = WorkQueue::new(self.piece_hashes.len());
        for (index, hash) in self.piece_hashes.iter().enumerate() {
            queue.push(PieceWork {
                index,
                hash: *hash,
                len: piece_len(self.length, self.piece_length, index),
            });
        }
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        let ctx = DownloadCtx {
            queue: Arc::clone(&queue),
            results: results_tx,
            drivers: Arc::new(AtomicUsize::new(0)),
        };
        *self.download_ctx.lock().unwrap() = Some(ctx.clone());

        // one driver per currently known peer; the dht may add more later
        let peers = self.peer_set.snapshot();
        ctx.drivers.fetch_add(peers.len(), Ordering::SeqCst);
        for peer in peers {
            tokio::spawn(self.arc().peer_driver(peer, ctx.clone()));
        }
        if ctx.drivers.load(Ordering::SeqCst) == 0 && !self.dht_enabled() {
            let _ = ctx.results.send(DriverEvent::PeersExhausted);
        }

        // collect results into the assembly buffer until full; this loop
        // is the buffer's only writer
        let total = self.piece_hashes.len();
        let mut buf = vec![0; self.length as usize];
        let mut outcome = Ok(());
        while self.done_pieces.load(Ordering::SeqCst) < total {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    outcome = Err(Error::Cancelled);
                    break;
                }
                event = results_rx.recv() => {
                    // the sender half lives in our download ctx
                    event.expect("results channel closed while running")
                }
            };
            match event {
                DriverEvent::Piece(result) => {
                    let begin = result.index * self.piece_length as usize;
                    buf[begin..begin + result.buf.len()]
                        .copy_from_slice(&result.buf);
                    let done =
                        self.done_pieces.fetch_add(1, Ordering::SeqCst) + 1;
                    if done % 30 == 0 || done == total {
                        log::info!(
                            "({:.2}%) Downloaded piece #{} of {}",
                            done as f64 / total as f64 * 100.0,
                            result.index,
                            total
                        );
                    }
                }
                DriverEvent::PeersExhausted => {
                    if self.done_pieces.load(Ordering::SeqCst) < total {
                        outcome = Err(Error::DownloadFailed);
                        break;
                    }
                }
            }
        }

        *self.download_ctx.lock().unwrap() = None;
        queue.close();
        if let Some(dht) = self.dht_node.lock().unwrap().take() {
            dht.close();
        }

        match outcome {
            Ok(()) => {
                self.log_conn_metrics();
                *self.state.lock().unwrap() = State::FinishedSuccessfully;
                Ok(buf)
            }
            Err(Error::Cancelled) => {
                log::info!("Download of {} cancelled", self.name);
                *self.state.lock().unwrap() = State::FinishedCancelled;
                Err(Error::Cancelled)
            }
            Err(e) => {
                log::warn!("Download of {} failed: {}", self.name, e);
                *self.state.lock().unwrap() =
                    State::FinishedFailed(e.to_string());
                Err(e)
            }
        }
    }

    /// Drives one peer for the lifetime of the download: dials it, runs a
    /// worker per connection, and redials a bounded number of times while
    /// undone work remains.
    async fn peer_driver(self: Arc<Self>, peer: Peer, ctx: DownloadCtx) {
        for attempt in 1..=PEER_ATTEMPTS {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.run_peer(&peer, &ctx).await {
                Ok(()) => break,
                Err(e) => {
                    log::warn!(
                        "Peer {} attempt {}/{} ended: {}",
                        peer,
                        attempt,
                        PEER_ATTEMPTS,
                        e
                    );
                }
            }
            if ctx.queue.is_empty() {
                // the remaining pieces are in flight elsewhere
                break;
            }
        }
        if ctx.drivers.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = ctx.results.send(DriverEvent::PeersExhausted);
        }
    }

    /// One dial-and-download cycle against a peer. Returns `Ok` when the
    /// workers drained the queue, an error if the peer was unusable.
    async fn run_peer(&self, peer: &Peer, ctx: &DownloadCtx) -> Result<()> {
        let port = self.next_socket_port.fetch_add(1, Ordering::SeqCst);
        let local = self.local.with_port(port);
        let (mut client, conns) = MpClient::dial_and_wait_for_connect_back(
            &self.transport,
            &local,
            peer.clone(),
            self.peer_id,
            self.info_hash,
            self.piece_hashes.len(),
            self.dht_enabled(),
        )
        .await?;
        log::info!(
            "Completed handshake with {}, got {} connections",
            peer,
            conns.len()
        );

        let mut workers = JoinSet::new();
        for leech_conn in conns {
            self.spawn_worker(&mut workers, leech_conn, ctx);
        }

        // exactly one worker per live connection: absorb connections the
        // seeder adds later, let closed ones die with their worker
        let mut events = client.connection_events();
        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Err(Error::Cancelled),
                joined = workers.join_next() => match joined {
                    // every worker is gone; that's a clean end only if
                    // they left no work behind
                    None => {
                        if ctx.queue.is_empty() {
                            break Ok(());
                        }
                        break Err(Error::Transport(std::io::Error::new(
                            std::io::ErrorKind::ConnectionAborted,
                            "all connections lost with work remaining",
                        )));
                    }
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => log::debug!(
                        "A worker for {} exited: {}", peer, e
                    ),
                    Some(Err(e)) => log::warn!(
                        "A worker task for {} panicked: {}", peer, e
                    ),
                },
                event = next_event(&mut events) => match event {
                    Some(ConnEvent::Opened(conn)) => {
                        log::info!("Got new connection from {}", peer);
                        match client.establish(conn).await {
                            Ok(leech_conn) => self.spawn_worker(
                                &mut workers, leech_conn, ctx,
                            ),
                            Err(e) => log::warn!(
                                "Handshake on new connection from {} \
                                 failed: {}",
                                peer,
                                e
                            ),
                        }
                    }
                    Some(ConnEvent::Closed(id)) => {
                        log::debug!("Connection {} to {} closed", id, peer);
                    }
                    None => events = None,
                },
            }
        };
        client.disconnect();
        outcome
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<Result<()>>,
        leech_conn: LeechConn,
        ctx: &DownloadCtx,
    ) {
        let conn = leech_conn.framed.get_ref();
        self.conn_metrics.lock().unwrap().push((
            conn.id().to_string(),
            conn.path().map(|p| p.to_string()).unwrap_or_default(),
            conn.metrics(),
        ));

        workers.spawn(self.arc().piece_worker(leech_conn, ctx.clone()));
    }

    /// The per connection worker loop: pull work, download, verify, emit.
    async fn piece_worker(
        self: Arc<Self>,
        mut leech_conn: LeechConn,
        ctx: DownloadCtx,
    ) -> Result<()> {
        loop {
            let work = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                work = ctx.queue.pop() => match work {
                    Some(work) => work,
                    None => return Ok(()),
                },
            };

            if !leech_conn.bitfield.read().unwrap()[work.index] {
                // this peer doesn't have the piece; put it back for others
                ctx.queue.push(work);
                tokio::task::yield_now().await;
                continue;
            }

            let buf = match self
                .attempt_download_piece(&mut leech_conn, &work)
                .await
            {
                Ok(buf) => buf,
                Err(e) => {
                    log::warn!(
                        "Exiting worker on conn {}: {}",
                        leech_conn.conn_id(),
                        e
                    );
                    ctx.queue.push(work);
                    return Err(e);
                }
            };

            // the integrity gate: nothing unverified leaves a worker
            let digest: Sha1Hash = Sha1::digest(&buf).into();
            if digest != work.hash {
                log::warn!(
                    "Piece #{} from {} failed integrity check",
                    work.index,
                    leech_conn.peer
                );
                ctx.queue.push(work.clone());
                return Err(Error::PieceIntegrity { index: work.index });
            }

            // losing the courtesy have is no reason to kill the worker
            let _ = leech_conn.send_have(work.index).await;
            let _ = ctx.results.send(DriverEvent::Piece(PieceResult {
                index: work.index,
                buf,
            }));
        }
    }

    /// Requests and assembles one piece over one connection, with at most
    /// [`MAX_BACKLOG`] requests in flight and a 30 second wall clock
    /// deadline for the whole piece.
    async fn attempt_download_piece(
        &self,
        leech_conn: &mut LeechConn,
        work: &PieceWork,
    ) -> Result<Vec<u8>> {
        let mut state = PieceProgress::new(work.index, work.len);
        let deadline = tokio::time::Instant::now() + PIECE_DEADLINE;

        while state.downloaded < work.len {
            // keep the pipeline full while we are allowed to request
            if !leech_conn.choked {
                while state.backlog < MAX_BACKLOG && state.requested < work.len
                {
                    let len = block_len(work.len, state.requested);
                    leech_conn
                        .send_request(work.index, state.requested, len)
                        .await?;
                    state.backlog += 1;
                    state.requested += len;
                }
            }

            let msg = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                msg = timeout_at(deadline, leech_conn.read_msg()) => match msg {
                    Err(_) => return Err(Error::Timeout),
                    Ok(msg) => msg?,
                },
            };
            self.handle_worker_msg(leech_conn, &mut state, msg)?;
        }

        Ok(state.buf)
    }

    fn handle_worker_msg(
        &self,
        leech_conn: &mut LeechConn,
        state: &mut PieceProgress,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Unchoke => leech_conn.choked = false,
            Message::Choke => leech_conn.choked = true,
            Message::Have(index) => {
                if index >= self.piece_hashes.len() {
                    return Err(Error::MalformedMessage(format!(
                        "have for out of range piece {}",
                        index
                    )));
                }
                leech_conn.bitfield.write().unwrap().set(index, true);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => state.on_block(index, begin, &block)?,
            Message::Port(port) => self.handle_port_msg(leech_conn, port),
            Message::Bitfield(_) => {
                return Err(Error::MalformedMessage(
                    "bitfield after the availability exchange".into(),
                ))
            }
            msg => {
                log::warn!(
                    "Seed {} sent unexpected message: {:?}",
                    leech_conn.peer,
                    msg.id()
                );
            }
        }
        Ok(())
    }

    /// BEP-5 peer exchange: the remote told us its DHT port, so ping its
    /// DHT node through ours.
    fn handle_port_msg(&self, leech_conn: &LeechConn, port: u16) {
        let dht = match self.dht_node() {
            Some(dht) => dht,
            None => {
                log::info!("Received port message but dht is not enabled");
                return;
            }
        };
        match ScionAddr::parse(&leech_conn.peer.addr) {
            Ok(addr) => dht.ping(&addr.with_port(port)),
            Err(e) => {
                log::info!(
                    "Received port message but peer address is unusable: {}",
                    e
                );
            }
        }
    }

    fn log_conn_metrics(&self) {
        for (id, path, metrics) in self.conn_metrics.lock().unwrap().iter() {
            log::debug!(
                "Conn {} over path [{}]: read {} bytes, written {} bytes",
                id,
                path,
                metrics.read_bytes(),
                metrics.written_bytes()
            );
        }
    }
}

/// Waits for the next connection event, or forever once the stream is
/// gone.
async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<ConnEvent>>,
) -> Option<ConnEvent> {
    match events {
        Some(events) => events.recv().await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        seeder::Seeder,
        socket::mem::MemNetwork,
        testutil::{self, StubDht},
    };

    const SEEDER_ADDR: &str = "1-ff00:0:2,[127.0.0.2]:50000";
    const LEECHER_ADDR: &str = "1-ff00:0:1,[127.0.0.1]:40000";

    fn spawn_seeder(
        net: &MemNetwork,
        addr: &str,
        content: Vec<u8>,
        piece_length: u32,
        discovery: DiscoveryConf,
        dht_backend: Option<Arc<StubDht>>,
    ) -> Arc<Seeder> {
        let metainfo = testutil::sample_metainfo(&content, piece_length);
        let seeder = Seeder::new(
            Arc::new(net.clone()),
            ScionAddr::parse(addr).unwrap(),
            &metainfo,
            content,
            PathSelectionResponsibility::Server,
            0,
            41000,
            discovery,
            dht_backend.map(|backend| backend as Arc<dyn DhtBackend>),
        )
        .unwrap();
        let listening = Arc::clone(&seeder);
        tokio::spawn(async move { listening.listen_handshake().await });
        seeder
    }

    fn leecher(
        net: &MemNetwork,
        addr: &str,
        content: &[u8],
        piece_length: u32,
        discovery: DiscoveryConf,
    ) -> Arc<Torrent> {
        let metainfo = testutil::sample_metainfo(content, piece_length);
        Torrent::new(
            Arc::new(net.clone()),
            ScionAddr::parse(addr).unwrap(),
            &metainfo,
            PathSelectionResponsibility::Server,
            discovery,
        )
        .unwrap()
    }

    #[test]
    fn test_client_responsibility_is_rejected() {
        let net = MemNetwork::new(testutil::paths(&["a-b"]));
        let content = testutil::file_content(64);
        let metainfo = testutil::sample_metainfo(&content, 64);
        let res = Torrent::new(
            Arc::new(net),
            ScionAddr::parse(LEECHER_ADDR).unwrap(),
            &metainfo,
            PathSelectionResponsibility::Client,
            DiscoveryConf::default(),
        );
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn test_piece_progress_places_blocks() {
        let mut progress = PieceProgress::new(3, 10);
        progress.backlog = 2;

        progress.on_block(3, 4, &[9, 9, 9, 9, 9, 9]).unwrap();
        progress.on_block(3, 0, &[1, 1, 1, 1]).unwrap();
        assert_eq!(progress.downloaded, 10);
        assert_eq!(progress.backlog, 0);
        assert_eq!(progress.buf, vec![1, 1, 1, 1, 9, 9, 9, 9, 9, 9]);

        // wrong piece
        assert!(matches!(
            progress.on_block(4, 0, &[0]),
            Err(Error::MalformedMessage(_))
        ));
        // block sticking out of the piece
        assert!(matches!(
            progress.on_block(3, 8, &[0, 0, 0]),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_work_queue_requeue_and_close() {
        let queue = WorkQueue::new(2);
        queue.push(PieceWork {
            index: 0,
            hash: [0; 20],
            len: 1,
        });

        let work = queue.pop().await.unwrap();
        assert_eq!(work.index, 0);
        // requeues preserve identity
        queue.push(work);
        assert_eq!(queue.pop().await.unwrap().index, 0);

        queue.close();
        assert!(queue.pop().await.is_none());
        // pushes after close are dropped
        queue.push(PieceWork {
            index: 1,
            hash: [0; 20],
            len: 1,
        });
        assert!(queue.pop().await.is_none());
    }

    /// Two pieces, one peer, one path: the classic happy path.
    #[tokio::test]
    async fn test_single_peer_download() {
        let net = MemNetwork::new(testutil::paths(&["a-b"]));
        let content = testutil::file_content(524_288);
        spawn_seeder(
            &net,
            SEEDER_ADDR,
            content.clone(),
            262_144,
            DiscoveryConf::default(),
            None,
        );

        let torrent = leecher(
            &net,
            LEECHER_ADDR,
            &content,
            262_144,
            DiscoveryConf::default(),
        );
        torrent.add_peer(Peer::new(SEEDER_ADDR, 0));

        let downloaded = torrent.download().await.unwrap();
        assert_eq!(downloaded.len(), content.len());
        assert!(downloaded == content, "assembled bytes differ");
        assert_eq!(torrent.state(), State::FinishedSuccessfully);
        assert_eq!(torrent.progress(), (2, 2));
    }

    /// 300000 bytes in 262144 byte pieces: the last piece and its single
    /// request clamp to 37856 bytes.
    #[tokio::test]
    async fn test_short_last_piece() {
        let net = MemNetwork::new(testutil::paths(&["a-b"]));
        let content = testutil::file_content(300_000);
        spawn_seeder(
            &net,
            SEEDER_ADDR,
            content.clone(),
            262_144,
            DiscoveryConf::default(),
            None,
        );

        let torrent = leecher(
            &net,
            LEECHER_ADDR,
            &content,
            262_144,
            DiscoveryConf::default(),
        );
        torrent.add_peer(Peer::new(SEEDER_ADDR, 0));

        let downloaded = torrent.download().await.unwrap();
        assert!(downloaded == content, "assembled bytes differ");
    }

    /// Pieces spanning several blocks exercise the request pipeline.
    #[tokio::test]
    async fn test_multi_block_pieces() {
        let net = MemNetwork::new(testutil::paths(&["a-b", "c-d"]));
        // 2 pieces of 2 blocks each, the last block short
        let content = testutil::file_content(2 * 524_288 - 1000);
        spawn_seeder(
            &net,
            SEEDER_ADDR,
            content.clone(),
            524_288,
            DiscoveryConf::default(),
            None,
        );

        let torrent = leecher(
            &net,
            LEECHER_ADDR,
            &content,
            524_288,
            DiscoveryConf::default(),
        );
        torrent.add_peer(Peer::new(SEEDER_ADDR, 0));

        let downloaded = torrent.download().await.unwrap();
        assert!(downloaded == content, "assembled bytes differ");
    }

    /// Two leechers, three disjoint paths: admission spreads the paths,
    /// both downloads succeed, and disconnects empty the store.
    #[tokio::test]
    async fn test_two_leechers_share_a_seeder() {
        let net = MemNetwork::new(testutil::paths(&["a-b", "c-d", "e-f"]));
        let content = testutil::file_content(524_288);
        let seeder = spawn_seeder(
            &net,
            SEEDER_ADDR,
            content.clone(),
            262_144,
            DiscoveryConf::default(),
            None,
        );

        let torrent1 = leecher(
            &net,
            LEECHER_ADDR,
            &content,
            262_144,
            DiscoveryConf::default(),
        );
        torrent1.add_peer(Peer::new(SEEDER_ADDR, 0));
        let torrent2 = leecher(
            &net,
            "1-ff00:0:3,[127.0.0.3]:40000",
            &content,
            262_144,
            DiscoveryConf::default(),
        );
        torrent2.add_peer(Peer::new(SEEDER_ADDR, 0));

        let (first, second) =
            tokio::join!(torrent1.download(), torrent2.download());
        assert!(first.unwrap() == content);
        assert!(second.unwrap() == content);

        // both leechers hung up, so the seeder released their paths
        tokio::time::timeout(Duration::from_secs(5), async {
            while seeder.store().len() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("path store entries not released");
    }

    /// A peer serving corrupt bytes is dropped after the SHA-1 gate and
    /// the piece is re-fetched from a correct peer.
    #[tokio::test]
    async fn test_integrity_failure_recovers() {
        let net = MemNetwork::new(testutil::paths(&["a-b"]));
        let content = testutil::file_content(262_144);

        // the bad seeder serves different bytes under the good metainfo
        let mut corrupt = content.clone();
        corrupt[1000] ^= 0xff;
        let bad_addr = "1-ff00:0:4,[127.0.0.4]:50000";
        {
            let metainfo = testutil::sample_metainfo(&content, 262_144);
            let seeder = Seeder::new(
                Arc::new(net.clone()),
                ScionAddr::parse(bad_addr).unwrap(),
                &metainfo,
                corrupt,
                PathSelectionResponsibility::Server,
                0,
                42000,
                DiscoveryConf::default(),
                None,
            )
            .unwrap();
            tokio::spawn(async move { seeder.listen_handshake().await });
        }
        spawn_seeder(
            &net,
            SEEDER_ADDR,
            content.clone(),
            262_144,
            DiscoveryConf::default(),
            None,
        );

        let torrent = leecher(
            &net,
            LEECHER_ADDR,
            &content,
            262_144,
            DiscoveryConf::default(),
        );
        torrent.add_peer(Peer::new(bad_addr, 0));
        torrent.add_peer(Peer::new(SEEDER_ADDR, 1));

        let downloaded = torrent.download().await.unwrap();
        assert!(downloaded == content, "corrupt bytes reached the buffer");
    }

    /// Cancelling mid-download unwinds the session and discards the
    /// partial state.
    #[tokio::test]
    async fn test_cancellation() {
        let net = MemNetwork::new(testutil::paths(&["a-b"]));
        let content = testutil::file_content(10 * 1024);

        // a listener that accepts but never dials back keeps the download
        // stuck in connection establishment
        let _listener = {
            use crate::socket::Multipath as _;
            net.listener(SEEDER_ADDR).unwrap()
        };

        let torrent =
            leecher(&net, LEECHER_ADDR, &content, 1024, DiscoveryConf::default());
        torrent.add_peer(Peer::new(SEEDER_ADDR, 0));

        let downloading = Arc::clone(&torrent);
        let download =
            tokio::spawn(async move { downloading.download().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(torrent.state(), State::Running);
        torrent.cancel();

        let res = download.await.unwrap();
        assert!(matches!(res, Err(Error::Cancelled)));
        assert_eq!(torrent.state(), State::FinishedCancelled);
        let (done, total) = torrent.progress();
        assert!(done < total);
    }

    /// A session with no peers and no discovery fails instead of hanging.
    #[tokio::test]
    async fn test_download_fails_without_peers() {
        let net = MemNetwork::new(testutil::paths(&["a-b"]));
        let content = testutil::file_content(1024);
        let torrent =
            leecher(&net, LEECHER_ADDR, &content, 1024, DiscoveryConf::default());

        let res = torrent.download().await;
        assert!(matches!(res, Err(Error::DownloadFailed)));
        assert!(matches!(torrent.state(), State::FinishedFailed(_)));
    }

    /// BEP-5 peer exchange: the seeder sends PORT after its bitfield and
    /// the leecher pings the advertised DHT endpoint.
    #[tokio::test]
    async fn test_dht_peer_exchange() {
        let net = MemNetwork::new(testutil::paths(&["a-b"]));
        let content = testutil::file_content(262_144);

        let seeder_discovery = DiscoveryConf {
            enable_dht: true,
            dht_port: 7001,
            dht_nodes: Vec::new(),
        };
        let seeder_dht = Arc::new(StubDht::default());
        spawn_seeder(
            &net,
            SEEDER_ADDR,
            content.clone(),
            262_144,
            seeder_discovery,
            Some(Arc::clone(&seeder_dht)),
        );

        let leecher_discovery = DiscoveryConf {
            enable_dht: true,
            dht_port: 7002,
            dht_nodes: Vec::new(),
        };
        let torrent = leecher(
            &net,
            LEECHER_ADDR,
            &content,
            262_144,
            leecher_discovery,
        );
        let leecher_dht = Arc::new(StubDht::default());
        torrent
            .enable_dht(
                Arc::clone(&leecher_dht) as Arc<dyn DhtBackend>,
                Vec::new(),
            )
            .unwrap();
        torrent.add_peer(Peer::new(SEEDER_ADDR, 0));

        let downloaded = torrent.download().await.unwrap();
        assert!(downloaded == content);

        // the leecher learned the seeder's DHT endpoint from the PORT
        // message and pinged it
        let pings = leecher_dht.pings.lock().unwrap().clone();
        let seeder_host = ScionAddr::parse(SEEDER_ADDR).unwrap();
        assert!(
            pings.iter().any(|addr| addr.same_host(&seeder_host)
                && addr.port == 7001),
            "expected a ping to the seeder's dht port, got {:?}",
            pings
        );

        // the leecher announced the torrent on its own node and the
        // session closed the node with the download
        assert_eq!(leecher_dht.announces.lock().unwrap().len(), 1);
        assert!(leecher_dht
            .closed
            .load(std::sync::atomic::Ordering::Relaxed));
    }
}
