//! The download coordinator of a single torrent.
//!
//! A torrent is a task that owns all download state: the verified have set,
//! the piece picker, the per peer interest and request records, and the file
//! mapper. Peer sessions run as separate tasks and exchange typed messages
//! with the torrent over channels, so every event is applied to the state in
//! one place, in arrival order.
//!
//! The download strategy is deliberately simple: reserve one piece per peer,
//! request its blocks sequentially, and hash the bytes as they arrive. If
//! a peer chokes, disconnects or stops answering partway through a piece, the
//! progress (including the mid-digest hash) is suspended and the next free
//! peer that has the piece continues where the previous one left off.
//! A periodic timer resends or abandons requests that hang.

use {
    futures::{select, stream::Fuse, StreamExt},
    sha1::{Digest, Sha1},
    std::{
        collections::{HashMap, HashSet},
        net::SocketAddr,
    },
    tokio::{
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            oneshot,
        },
        time,
    },
};

use crate::{
    block_len_at,
    conf::TorrentConf,
    disk::FileMapper,
    error::*,
    metainfo::Metainfo,
    peer::{self, PeerSession},
    piece_picker::{PartialPiece, Pick, PiecePicker},
    storage_info::StorageInfo,
    tracker::PeerSource,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// The channel on which the engine can send commands to a torrent.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a torrent can receive from the engine.
pub(crate) enum Command {
    /// Report the fraction of verified pieces, in `[0, 1]`.
    Status { chan: oneshot::Sender<f64> },
    /// Eventually shut down the torrent and all its peer sessions.
    Shutdown,
}

pub(crate) struct Torrent {
    /// The torrent's id, unique within the engine. Only used for logging.
    id: TorrentId,
    conf: TorrentConf,
    /// The client id sent to peers in the handshake.
    client_id: PeerId,
    /// The torrent metainfo, kept around for the expected piece hashes.
    metainfo: Metainfo,
    info_hash: Sha1Hash,
    /// The piece and file geometry of the download.
    storage: StorageInfo,
    /// Writes downloaded blocks to the torrent's files.
    disk: FileMapper,
    /// Which pieces have been downloaded and verified.
    have: Bitfield,
    /// Which pieces are still needed and who advertises them.
    picker: PiecePicker,
    /// The peers the torrent is currently downloading from, keyed by their
    /// remote address.
    peers: HashMap<SocketAddr, Peer>,
    /// The peers that have a piece reserved but no outstanding block request.
    peer_interest: HashMap<SocketAddr, InterestState>,
    /// The peers with an outstanding block request.
    requesting: HashMap<SocketAddr, RequestState>,
    /// Hands out tracker supplied peer addresses.
    peer_source: PeerSource,
    /// The channel peer sessions report events on; cloned into each session.
    event_chan: peer::EventSender,
    /// The port on which the torrent receives events from its peer sessions.
    event_port: Fuse<peer::EventReceiver>,
    /// The port on which the torrent receives commands from the engine.
    cmd_port: Fuse<Receiver>,
    /// The bookkeeping timer's tick counter. All reservation and request
    /// timestamps are expressed in ticks.
    tick: u64,
}

/// The torrent side bookkeeping of one peer session.
struct Peer {
    /// The channel on which the torrent commands the session.
    chan: peer::Sender,
    /// The pieces the peer advertised, via its bitfield and subsequent have
    /// messages. Validated and sized to the torrent's piece count.
    pieces: Bitfield,
    /// Whether the peer is choking us. Mirrors the session's flag so that
    /// the torrent can decide whether to request without a round trip.
    is_choked: bool,
    /// Whether we have expressed interest in the peer. A mirror, as above.
    is_interested: bool,
}

/// The state of a peer that has a piece reserved for it but hasn't been sent
/// a block request yet, because it hasn't unchoked us so far.
struct InterestState {
    /// The piece reserved for the peer. No other peer may be downloading it.
    piece_index: PieceIndex,
    /// How many bytes of the piece have already been downloaded, by previous
    /// peers, if the piece was resumed from the partial list.
    bytes_received: u32,
    /// The SHA-1 of the piece's received bytes, mid-digest.
    hasher: Sha1,
    /// The tick at which interest was expressed, for timing out peers that
    /// never unchoke us.
    tick: u64,
}

/// The state of a peer with an outstanding block request.
struct RequestState {
    /// The piece reserved for the peer. No other peer may be downloading it.
    piece_index: PieceIndex,
    /// How many bytes of the piece have been downloaded. The outstanding
    /// request is always for the block starting here.
    bytes_received: u32,
    /// The SHA-1 of the piece's received bytes, mid-digest.
    hasher: Sha1,
    /// The tick at which the outstanding request was last sent.
    last_request_tick: u64,
    /// How many times the outstanding request has been resent.
    retries: u32,
}

impl Torrent {
    /// Creates a torrent and the channel the engine controls it with.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TorrentId,
        conf: TorrentConf,
        client_id: PeerId,
        metainfo: Metainfo,
        info_hash: Sha1Hash,
        storage: StorageInfo,
        disk: FileMapper,
        peer_source: PeerSource,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (event_chan, event_port) = mpsc::unbounded_channel();
        let have = disk.have();
        let picker = PiecePicker::new(storage.piece_count);
        (
            Self {
                id,
                conf,
                client_id,
                metainfo,
                info_hash,
                storage,
                disk,
                have,
                picker,
                peers: HashMap::new(),
                peer_interest: HashMap::new(),
                requesting: HashMap::new(),
                peer_source,
                event_chan,
                event_port: event_port.fuse(),
                cmd_port: cmd_port.fuse(),
                tick: 1,
            },
            cmd_chan,
        )
    }

    /// Runs the torrent until it is shut down or fails. Note that the
    /// download completing does not end the torrent: it keeps answering
    /// status queries until the engine shuts it down.
    pub async fn start(&mut self) -> Result<()> {
        log::info!(
            "Starting torrent {} ({}), info hash {}",
            self.id,
            self.metainfo.info.name,
            hex::encode(&self.info_hash)
        );

        let result = self.run().await;
        if let Err(e) = &result {
            log::error!("Torrent {} failed: {}", self.id, e);
        }

        // tell all sessions to drop their connections
        for (_, peer) in self.peers.drain() {
            let _ = peer.chan.send(peer::Command::Disconnect);
        }

        result
    }

    async fn run(&mut self) -> Result<()> {
        self.connect_to_peers(self.conf.desired_peer_count);

        let mut tick_timer = time::interval_at(
            time::Instant::now() + self.conf.tick_interval,
            self.conf.tick_interval,
        )
        .fuse();

        loop {
            select! {
                event = self.event_port.select_next_some() => {
                    self.handle_event(event)?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Status { chan } => {
                            let _ = chan.send(self.fraction_complete());
                        }
                        Command::Shutdown => {
                            log::info!("Shutting down torrent {}", self.id);
                            return Ok(());
                        }
                    }
                }
                _ = tick_timer.select_next_some() => {
                    self.tick()?;
                }
            }
        }
    }

    /// Routes a session event to the matching handler. Events from peers
    /// that have since been removed fall through harmlessly, as every
    /// handler looks the peer up first.
    fn handle_event(&mut self, event: peer::Event) -> Result<()> {
        match event {
            peer::Event::Bitfield { addr, bitfield } => {
                self.handle_bitfield(addr, bitfield)
            }
            peer::Event::Have { addr, piece_index } => {
                self.handle_have(addr, piece_index)
            }
            peer::Event::Choked { addr } => {
                self.handle_choke(addr);
                Ok(())
            }
            peer::Event::Unchoked { addr } => self.handle_unchoke(addr),
            peer::Event::Block {
                addr,
                piece_index,
                offset,
                data,
            } => self.handle_block(addr, piece_index, offset, data),
            peer::Event::Disconnected { addr } => {
                self.handle_disconnect(addr);
                Ok(())
            }
        }
    }

    /// The fraction of verified pieces, in `[0, 1]`.
    fn fraction_complete(&self) -> f64 {
        let piece_count = self.storage.piece_count;
        (piece_count - self.picker.missing_count()) as f64
            / piece_count as f64
    }

    /// Requests a batch of addresses from the peer source and starts an
    /// outbound session for each. The source may return fewer addresses than
    /// asked for (or none) when its pool runs dry.
    fn connect_to_peers(&mut self, count: usize) {
        let addrs = self.peer_source.request_peers(count);
        log::debug!(
            "Connecting to {} new peer(s) of {} requested",
            addrs.len(),
            count
        );
        for addr in addrs {
            if self.peers.contains_key(&addr) {
                continue;
            }

            let (mut session, chan) = PeerSession::outbound(
                self.event_chan.clone(),
                addr,
                self.info_hash,
                self.client_id,
                self.have.clone(),
            );
            let events = self.event_chan.clone();
            tokio::spawn(async move {
                if let Err(e) = session.start().await {
                    log::info!("Peer {} session stopped: {}", addr, e);
                }
                // the torrent may be gone already on shutdown
                let _ = events.send(peer::Event::Disconnected { addr });
            });

            self.peers.insert(
                addr,
                Peer {
                    chan,
                    pieces: self.blank_bitfield(),
                    is_choked: true,
                    is_interested: false,
                },
            );
        }
    }

    fn blank_bitfield(&self) -> Bitfield {
        let mut pieces = Bitfield::new();
        pieces.resize(self.storage.piece_count, false);
        pieces
    }

    /// Validates and registers the peer's piece availability, then tries to
    /// reserve a piece for it.
    ///
    /// A valid bitfield covers at least all pieces of the torrent and has no
    /// bit set past the last piece; anything else is a protocol violation
    /// and the peer is dropped.
    fn handle_bitfield(
        &mut self,
        addr: SocketAddr,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        if !self.peers.contains_key(&addr) {
            return Ok(());
        }

        let piece_count = self.storage.piece_count;
        if bitfield.len() < piece_count || bitfield[piece_count..].any() {
            log::info!("Invalid bitfield from peer {}", addr);
            self.drop_peer(addr);
            self.connect_to_peers(1);
            return Ok(());
        }

        log::debug!("Peer {} sent bitfield", addr);
        // the wire bitfield is padded to a whole number of bytes; only the
        // first piece count bits carry meaning
        bitfield.truncate(piece_count);
        self.picker.register_availability(addr, &bitfield);
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.pieces = bitfield;
        }

        self.check_interest(addr)
    }

    /// Registers that the peer announced a new piece, accumulating on top of
    /// whatever it advertised before.
    fn handle_have(
        &mut self,
        addr: SocketAddr,
        piece_index: PieceIndex,
    ) -> Result<()> {
        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => return Ok(()),
        };
        log::debug!("Peer {} has piece {}", addr, piece_index);

        if piece_index >= self.storage.piece_count {
            log::info!(
                "Peer {} announced invalid piece {}",
                addr,
                piece_index
            );
            self.drop_peer(addr);
            self.connect_to_peers(1);
            return Ok(());
        }

        peer.pieces.set(piece_index, true);
        if self.picker.register_have(addr, piece_index) {
            self.check_interest(addr)?;
        }
        Ok(())
    }

    /// If the peer is free, tries to reserve a piece for it to download and
    /// expresses interest to it; if there is nothing left for the peer, the
    /// interest is revoked and a connection to a fresh peer is made instead.
    fn check_interest(&mut self, addr: SocketAddr) -> Result<()> {
        if self.peer_interest.contains_key(&addr)
            || self.requesting.contains_key(&addr)
        {
            return Ok(());
        }
        let (pieces, was_interested) = match self.peers.get(&addr) {
            Some(peer) => (peer.pieces.clone(), peer.is_interested),
            None => return Ok(()),
        };

        // pieces being downloaded by other peers are off limits
        let reserved: HashSet<PieceIndex> = self
            .peer_interest
            .values()
            .map(|state| state.piece_index)
            .chain(self.requesting.values().map(|state| state.piece_index))
            .collect();

        match self.picker.pick(&pieces, &reserved) {
            Some(Pick::Resumed(partial)) => {
                log::info!(
                    "Resuming piece {} at offset {} via peer {}",
                    partial.piece_index,
                    partial.bytes_received,
                    addr
                );
                self.peer_interest.insert(
                    addr,
                    InterestState {
                        piece_index: partial.piece_index,
                        bytes_received: partial.bytes_received,
                        hasher: partial.hasher,
                        tick: self.tick,
                    },
                );
                self.show_interest(addr)
            }
            Some(Pick::Fresh(piece_index)) => {
                log::debug!(
                    "Reserved piece {} for peer {}",
                    piece_index,
                    addr
                );
                self.peer_interest.insert(
                    addr,
                    InterestState {
                        piece_index,
                        bytes_received: 0,
                        hasher: Sha1::new(),
                        tick: self.tick,
                    },
                );
                self.show_interest(addr)
            }
            None => {
                // nothing left that this peer could give us
                if was_interested {
                    log::debug!("No longer interested in peer {}", addr);
                    if let Some(peer) = self.peers.get_mut(&addr) {
                        peer.is_interested = false;
                        let _ =
                            peer.chan.send(peer::Command::RevokeInterest);
                    }
                    self.connect_to_peers(1);
                }
                Ok(())
            }
        }
    }

    /// Expresses interest in the peer, if not already expressed, and starts
    /// requesting right away if the peer has already unchoked us.
    fn show_interest(&mut self, addr: SocketAddr) -> Result<()> {
        let is_choked = match self.peers.get_mut(&addr) {
            Some(peer) => {
                if !peer.is_interested {
                    peer.is_interested = true;
                    let _ = peer.chan.send(peer::Command::ExpressInterest);
                }
                peer.is_choked
            }
            None => return Ok(()),
        };

        if !is_choked {
            self.request(addr)?;
        }
        Ok(())
    }

    /// Promotes the peer's reservation to an outstanding request, if not
    /// promoted before, and requests the next block of the reserved piece.
    fn request(&mut self, addr: SocketAddr) -> Result<()> {
        if let Some(interest) = self.peer_interest.remove(&addr) {
            self.requesting.insert(
                addr,
                RequestState {
                    piece_index: interest.piece_index,
                    bytes_received: interest.bytes_received,
                    hasher: interest.hasher,
                    last_request_tick: self.tick,
                    retries: 0,
                },
            );
        }
        self.send_request(addr)
    }

    /// Sends the request for the block the peer's download stands at.
    fn send_request(&mut self, addr: SocketAddr) -> Result<()> {
        let (piece_index, offset) = match self.requesting.get(&addr) {
            Some(request) => (request.piece_index, request.bytes_received),
            None => return Ok(()),
        };
        let piece_len = self.storage.piece_len(piece_index)?;
        let block = BlockInfo {
            piece_index,
            offset,
            len: block_len_at(piece_len, offset),
        };
        log::debug!("Requesting block {:?} from peer {}", block, addr);
        if let Some(peer) = self.peers.get(&addr) {
            let _ = peer.chan.send(peer::Command::Request(block));
        }
        Ok(())
    }

    /// Accepts a block if it is exactly the one requested from this peer and
    /// advances the piece download, verifying the piece on its last block.
    ///
    /// Anything else the peer sends is dropped on the floor: after a choke
    /// or a timeout the peer is no longer in `requesting`, so stale blocks
    /// from it cannot corrupt a resumed download.
    fn handle_block(
        &mut self,
        addr: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let piece_len = {
            let request = match self.requesting.get_mut(&addr) {
                Some(request) => request,
                None => {
                    log::debug!(
                        "Peer {} sent block while not requested",
                        addr
                    );
                    return Ok(());
                }
            };
            let piece_len = self.storage.piece_len(request.piece_index)?;
            if piece_index != request.piece_index
                || offset != request.bytes_received
                || data.is_empty()
                || offset as u64 + data.len() as u64 > piece_len as u64
            {
                log::debug!(
                    "Peer {} sent unexpected block: piece {} offset {}",
                    addr,
                    piece_index,
                    offset
                );
                return Ok(());
            }

            request.hasher.update(&data);
            self.disk.write_block(piece_index, offset, &data)?;
            request.bytes_received += data.len() as u32;
            request.last_request_tick = self.tick;
            request.retries = 0;
            piece_len
        };

        let bytes_received = self.requesting[&addr].bytes_received;
        if bytes_received < piece_len {
            // more of the piece to go
            return self.send_request(addr);
        }

        // that was the piece's last block
        if let Some(request) = self.requesting.remove(&addr) {
            let digest = request.hasher.finalize();
            let expected = self.metainfo.piece_hash(piece_index)?;
            if digest.as_slice() == expected {
                log::info!(
                    "Successfully got piece {} from {}",
                    piece_index,
                    addr
                );
                self.picker.received_piece(piece_index);
                self.have.set(piece_index, true);
                log::info!(
                    "{}: downloaded {:.4}%",
                    self.metainfo.info.name,
                    100.0 * self.fraction_complete()
                );
                // announce the new piece to the whole swarm
                for peer in self.peers.values() {
                    let _ = peer.chan.send(peer::Command::Have(piece_index));
                }
            } else {
                // the piece stays needed and unreserved, so it will be picked
                // again, from this peer or another; the bytes on disk are
                // simply overwritten then
                log::info!(
                    "Piece {} from {} failed the hash check",
                    piece_index,
                    addr
                );
            }
        }

        if self.picker.is_complete() {
            self.disk.flush()?;
            log::info!(
                "Successfully downloaded entire torrent {}",
                self.metainfo.info.name
            );
        } else {
            self.check_interest(addr)?;
        }
        Ok(())
    }

    /// Suspends whatever the peer was downloading. A bare reservation is
    /// silently freed; a request already underway is saved to the partial
    /// list.
    fn handle_choke(&mut self, addr: SocketAddr) {
        match self.peers.get_mut(&addr) {
            Some(peer) => peer.is_choked = true,
            None => return,
        }
        log::debug!("Peer {} choked us", addr);

        if self.peer_interest.remove(&addr).is_some() {
            // the reservation is freed; the piece simply becomes pickable
            // again
        } else if let Some(request) = self.requesting.remove(&addr) {
            self.picker.suspend(PartialPiece {
                piece_index: request.piece_index,
                bytes_received: request.bytes_received,
                hasher: request.hasher,
            });
        }
    }

    /// Starts requesting if the peer has a piece reserved, or tries to
    /// reserve one if the peer was unchoked while sitting idle.
    fn handle_unchoke(&mut self, addr: SocketAddr) -> Result<()> {
        match self.peers.get_mut(&addr) {
            Some(peer) => peer.is_choked = false,
            None => return Ok(()),
        }
        log::debug!("Peer {} unchoked us", addr);

        if self.peer_interest.contains_key(&addr) {
            self.request(addr)?;
        } else if !self.requesting.contains_key(&addr) {
            self.check_interest(addr)?;
        }
        Ok(())
    }

    /// Cleans up after a session that ended and replaces it with a fresh
    /// connection.
    fn handle_disconnect(&mut self, addr: SocketAddr) {
        if self.remove_peer(addr) {
            log::info!("Peer {} is unconnected", addr);
            self.connect_to_peers(1);
        }
    }

    /// Removes all bookkeeping of the peer, suspending its in-flight piece
    /// if it had one. Returns false if the peer was already removed.
    fn remove_peer(&mut self, addr: SocketAddr) -> bool {
        let peer = match self.peers.remove(&addr) {
            Some(peer) => peer,
            None => return false,
        };
        self.picker.unregister_peer(addr, &peer.pieces);

        if self.peer_interest.remove(&addr).is_some() {
            // only a reservation was held, nothing to save
        } else if let Some(request) = self.requesting.remove(&addr) {
            self.picker.suspend(PartialPiece {
                piece_index: request.piece_index,
                bytes_received: request.bytes_received,
                hasher: request.hasher,
            });
        }
        true
    }

    /// Drops a misbehaving peer: tells its session to disconnect and removes
    /// it right away rather than waiting for the disconnect event.
    fn drop_peer(&mut self, addr: SocketAddr) {
        if let Some(peer) = self.peers.get(&addr) {
            let _ = peer.chan.send(peer::Command::Disconnect);
        }
        self.remove_peer(addr);
    }

    /// The periodic bookkeeping: times out peers sitting on a reservation
    /// without unchoking us and resends or abandons hung block requests.
    fn tick(&mut self) -> Result<()> {
        self.tick += 1;

        // peers that have been interested but choked for too long lose their
        // reservation, and we look for better company
        let timed_out: Vec<SocketAddr> = self
            .peer_interest
            .iter()
            .filter(|(_, state)| {
                self.tick >= state.tick + self.conf.interest_timeout_ticks
            })
            .map(|(addr, _)| *addr)
            .collect();
        for addr in timed_out {
            log::debug!("Timed out on interest for peer {}", addr);
            self.peer_interest.remove(&addr);
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.is_interested = false;
                let _ = peer.chan.send(peer::Command::RevokeInterest);
            }
            self.connect_to_peers(1);
        }

        // hung requests are resent a couple of times in case the message got
        // lost or ignored; after that the piece is suspended and the peer
        // dropped
        let stale: Vec<SocketAddr> = self
            .requesting
            .iter()
            .filter(|(_, state)| {
                self.tick
                    >= state.last_request_tick
                        + self.conf.request_timeout_ticks
            })
            .map(|(addr, _)| *addr)
            .collect();
        for addr in stale {
            let retries = match self.requesting.get(&addr) {
                Some(request) => request.retries,
                None => continue,
            };
            if retries < self.conf.max_request_retries {
                log::debug!("Timed out on request for peer {}", addr);
                if let Some(request) = self.requesting.get_mut(&addr) {
                    request.retries += 1;
                    request.last_request_tick = self.tick;
                }
                self.send_request(addr)?;
            } else {
                log::debug!("Request retries exhausted for peer {}", addr);
                if let Some(request) = self.requesting.remove(&addr) {
                    self.picker.suspend(PartialPiece {
                        piece_index: request.piece_index,
                        bytes_received: request.bytes_received,
                        hasher: request.hasher,
                    });
                }
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.is_interested = false;
                    let _ = peer.chan.send(peer::Command::RevokeInterest);
                }
                self.drop_peer(addr);
                self.connect_to_peers(1);
            }
        }

        Ok(())
    }
}
