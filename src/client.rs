//! The leech side multipath client.
//!
//! For one remote peer the client opens a multipath peer socket on a fresh
//! local port, dials out, and waits for the seeder to dial back with one or
//! more path diverse connections. Every resulting connection goes through a
//! full handshake and bitfield exchange and is then handed to the torrent
//! as a download worker target; connections that appear later (the seeder
//! reacting to path changes) are absorbed the same way, reusing the piece
//! availability learned on the first connection.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    addr::ScionAddr,
    error::*,
    pathselection::PathSet,
    peer::{
        codec::{Handshake, HandshakeCodec, Message, PeerCodec},
        Peer,
    },
    socket::{
        Conn, ConnEvent, ConnectOptions, Multipath, PathSelector, PeerSocket,
        SocketOptions, Transport,
    },
    Bitfield, PeerId, Sha1Hash,
};

pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub(crate) const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);

/// The piece availability of one remote peer, shared by all the
/// connections leading to it.
pub(crate) type SharedBitfield = Arc<RwLock<Bitfield>>;

/// How many of the shortest paths the initial dial goes over. The seeder
/// steers the real path fan-out when it dials back.
struct ClientSelection;

impl PathSelector for ClientSelection {
    fn select(&self, available: &PathSet) -> PathSet {
        available.shortest(2)
    }
}

/// One established, handshaked connection to a peer, ready for a download
/// worker.
pub(crate) struct LeechConn {
    pub framed: Framed<Conn, PeerCodec>,
    pub choked: bool,
    pub bitfield: SharedBitfield,
    pub peer: Peer,
}

impl LeechConn {
    pub fn conn_id(&self) -> String {
        self.framed.get_ref().id().to_string()
    }

    /// Reads and consumes one message from the connection.
    pub async fn read_msg(&mut self) -> Result<Message> {
        match self.framed.next().await {
            Some(msg) => msg,
            None => Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            ))),
        }
    }

    pub async fn send_request(
        &mut self,
        index: usize,
        begin: u32,
        len: u32,
    ) -> Result<()> {
        self.framed
            .send(Message::Request { index, begin, len })
            .await
    }

    pub async fn send_interested(&mut self) -> Result<()> {
        self.framed.send(Message::Interested).await
    }

    pub async fn send_have(&mut self, index: usize) -> Result<()> {
        self.framed.send(Message::Have(index)).await
    }
}

/// The multipath client for one remote peer.
pub(crate) struct MpClient {
    socket: Box<dyn PeerSocket>,
    peer: Peer,
    peer_id: PeerId,
    info_hash: Sha1Hash,
    piece_count: usize,
    dht_support: bool,
    /// Cached piece availability from the first connection's bitfield.
    bitfield: Option<SharedBitfield>,
}

impl MpClient {
    /// Dials the peer from the given fresh local endpoint and waits for it
    /// to establish connections back to us. Each returned connection has
    /// gone through the full handshake and bitfield exchange.
    ///
    /// On any handshake failure the whole peer is rejected and every
    /// connection to it closed.
    pub async fn dial_and_wait_for_connect_back(
        transport: &Arc<dyn Multipath>,
        local: &ScionAddr,
        peer: Peer,
        peer_id: PeerId,
        info_hash: Sha1Hash,
        piece_count: usize,
        dht_support: bool,
    ) -> Result<(Self, Vec<LeechConn>)> {
        let mut socket = transport.peer_socket(
            &local.to_string(),
            &peer.addr,
            SocketOptions {
                transport: Transport::Quic,
                responsibility:
                    crate::conf::PathSelectionResponsibility::Server,
                multiport: false,
            },
        )?;
        socket.listen()?;

        log::info!("Dialing peer {} from {}", peer, local);
        let conns = socket
            .connect(
                Arc::new(ClientSelection),
                ConnectOptions {
                    send_addr_packet: true,
                    ..Default::default()
                },
            )
            .await?;
        log::info!(
            "Peer {} connected back with {} connections",
            peer,
            conns.len()
        );

        let mut client = Self {
            socket,
            peer,
            peer_id,
            info_hash,
            piece_count,
            dht_support,
            bitfield: None,
        };

        let mut leech_conns = Vec::with_capacity(conns.len());
        for conn in conns {
            match client.establish(conn).await {
                Ok(leech_conn) => leech_conns.push(leech_conn),
                Err(e) => {
                    // reject the peer as a whole
                    client.socket.disconnect();
                    return Err(e);
                }
            }
        }

        Ok((client, leech_conns))
    }

    /// Performs the handshake and bitfield exchange on one connection and
    /// wraps it for a download worker.
    ///
    /// The first connection's bitfield seeds the peer's shared
    /// availability; later connections only validate theirs and reuse it.
    pub async fn establish(&mut self, conn: Conn) -> Result<LeechConn> {
        let mut framed = Framed::new(conn, HandshakeCodec);

        let handshake =
            Handshake::new(self.info_hash, self.peer_id, self.dht_support);
        framed.send(handshake).await?;

        let their_handshake =
            match timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
                Err(_) => return Err(Error::Timeout),
                Ok(None) => return Err(Error::BadHandshake),
                Ok(Some(handshake)) => handshake?,
            };
        if their_handshake.info_hash != self.info_hash {
            log::warn!("Peer {} advertised a foreign info hash", self.peer);
            return Err(Error::InfoHashMismatch);
        }
        log::debug!(
            "Completed handshake with {} (dht support: {})",
            self.peer,
            their_handshake.supports_dht()
        );

        // switch to the peer message codec, keeping any already buffered
        // bytes the peer may have sent right after its handshake
        let old_parts = framed.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut framed = Framed::from_parts(new_parts);

        // the seeder announces its pieces first
        let mut their_bitfield =
            match timeout(BITFIELD_TIMEOUT, framed.next()).await {
                Err(_) => return Err(Error::Timeout),
                Ok(None) => return Err(Error::BitfieldExpected),
                Ok(Some(msg)) => match msg? {
                    Message::Bitfield(bitfield) => bitfield,
                    _ => return Err(Error::BitfieldExpected),
                },
            };
        // the raw bitfield is padded to full bytes; slice off the padding
        their_bitfield.resize(self.piece_count, false);

        let bitfield = match &self.bitfield {
            Some(bitfield) => Arc::clone(bitfield),
            None => {
                let shared = Arc::new(RwLock::new(their_bitfield));
                self.bitfield = Some(Arc::clone(&shared));
                shared
            }
        };

        let mut leech_conn = LeechConn {
            framed,
            choked: false,
            bitfield,
            peer: self.peer.clone(),
        };
        leech_conn.send_interested().await?;

        Ok(leech_conn)
    }

    /// Takes the stream of connection set changes; the per peer driver
    /// establishes workers for newly opened connections and prunes closed
    /// ones.
    pub fn connection_events(
        &mut self,
    ) -> Option<UnboundedReceiver<ConnEvent>> {
        self.socket.connection_events()
    }

    pub fn disconnect(&mut self) {
        self.socket.disconnect();
    }
}
