mod codec;

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        SinkExt, StreamExt,
    },
    std::net::SocketAddr,
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{error::*, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash},
    codec::*,
};

/// A session with a single remote peer.
///
/// The session drives the socket: it performs the handshake, decodes inbound
/// messages, and keeps the four choke/interest flags of the connection. It
/// makes no download decisions of its own. Everything of consequence is
/// reported to the torrent as an [`Event`] and the torrent steers the session
/// with [`Command`]s, so the two sides never hold references to each other.
pub(crate) struct PeerSession {
    /// The channel on which the session reports events to its torrent.
    torrent_chan: EventSender,
    /// The port on which the peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The info hash of the torrent this session belongs to, verified against
    /// the peer's handshake.
    info_hash: Sha1Hash,
    /// The client id sent in our handshake.
    client_id: PeerId,
    /// Our own piece availability at the time the session was started, sent
    /// to the peer right after the handshake.
    local_pieces: Bitfield,
    /// The current state of the session.
    state: State,
    /// The four connection flags.
    status: Status,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    ///
    /// Returns the command channel on which the torrent controls the session.
    pub fn outbound(
        torrent_chan: EventSender,
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
        local_pieces: Bitfield,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent_chan,
                cmd_port: cmd_port.fuse(),
                addr,
                info_hash,
                client_id,
                local_pieces,
                state: State::default(),
                status: Status::default(),
            },
            cmd_chan,
        )
    }

    /// Starts the peer session and returns when the connection is closed,
    /// either by us, by the peer, or by an error.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.state = State::Handshaking;
        let handshake = Handshake::new(self.info_hash, self.client_id);
        log::debug!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await?;

        // receive the peer's handshake
        if let Some(peer_handshake) = socket.next().await {
            let peer_handshake = peer_handshake?;
            log::debug!(
                "Received handshake from peer {} (id {})",
                self.addr,
                hex::encode(&peer_handshake.peer_id)
            );
            // the codec only returns a handshake whose protocol string is
            // valid
            debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

            // verify that the advertised torrent info hash is the same as ours
            if peer_handshake.info_hash != self.info_hash {
                log::info!("Peer {} handshake invalid info hash", self.addr);
                return Err(Error::InvalidPeerInfoHash);
            }

            // Now that we have the handshake, we need to switch to the peer
            // message codec. The buffers of the handshake codec are carried
            // over, as the peer may have sent bytes of its first message
            // right after its handshake.
            let old_parts = socket.into_parts();
            let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
            new_parts.read_buf = old_parts.read_buf;
            new_parts.write_buf = old_parts.write_buf;
            let mut socket = Framed::from_parts(new_parts);

            // a bitfield message is only allowed between the handshake and
            // any other message, in either direction
            self.state = State::AvailabilityExchange;
            log::debug!(
                "Peer {} session state: {:?}",
                self.addr,
                self.state
            );
            let local_pieces = std::mem::take(&mut self.local_pieces);
            socket.send(Message::Bitfield(local_pieces)).await?;

            // run the session
            self.run(socket).await?;
        }

        Ok(())
    }

    /// The main session loop: receives messages from the peer and commands
    /// from the torrent until either side disconnects.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        // split the sink and stream so that we can pass the sink while
        // holding a reference to the stream in the loop
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        loop {
            select! {
                msg = stream.next() => {
                    match msg {
                        Some(msg) => {
                            let msg = msg?;
                            log::debug!(
                                "Received message {:?} from peer {}",
                                msg.id(),
                                self.addr
                            );
                            self.handle_msg(msg)?;
                        }
                        // the transport was closed by the peer
                        None => {
                            log::info!("Peer {} connection lost", self.addr);
                            break;
                        }
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    if !self.handle_cmd(&mut sink, cmd).await? {
                        log::info!("Disconnecting peer {}", self.addr);
                        break;
                    }
                }
            }
        }

        self.state = State::Disconnected;

        Ok(())
    }

    /// Applies an inbound message to the session state and forwards it to the
    /// torrent where the state permits.
    fn handle_msg(&mut self, msg: Message) -> Result<()> {
        if self.state == State::AvailabilityExchange {
            // this is the only state in which a bitfield message is legal;
            // receiving anything else means the peer skipped its bitfield and
            // its availability stays all zeros
            self.state = State::Connected;
            log::debug!("Peer {} session state: {:?}", self.addr, self.state);
            if let Message::Bitfield(bitfield) = msg {
                self.torrent_chan.send(Event::Bitfield {
                    addr: self.addr,
                    bitfield,
                })?;
                return Ok(());
            }
        }

        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    self.status.is_choked = true;
                    self.torrent_chan.send(Event::Choked { addr: self.addr })?;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    self.status.is_choked = false;
                    self.torrent_chan
                        .send(Event::Unchoked { addr: self.addr })?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                self.torrent_chan.send(Event::Have {
                    addr: self.addr,
                    piece_index,
                })?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.torrent_chan.send(Event::Block {
                    addr: self.addr,
                    piece_index,
                    offset,
                    data,
                })?;
            }
            // we don't serve uploads, so requests are acknowledged by the
            // flag exchange above but never acted upon
            Message::Request(block) => {
                log::debug!(
                    "Peer {} requested block {:?}, not serving",
                    self.addr,
                    block
                );
            }
            Message::Cancel(block) => {
                log::debug!(
                    "Peer {} canceled block {:?}",
                    self.addr,
                    block
                );
            }
        }

        Ok(())
    }

    /// Executes a command from the torrent. Returns false when the session
    /// should disconnect.
    async fn handle_cmd(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        cmd: Command,
    ) -> Result<bool> {
        match cmd {
            // the four flag mutators only touch the wire on an actual
            // transition, so the torrent may repeat them freely
            Command::ExpressInterest => {
                if !self.status.is_interested {
                    log::debug!("Interested in peer {}", self.addr);
                    self.status.is_interested = true;
                    sink.send(Message::Interested).await?;
                }
            }
            Command::RevokeInterest => {
                if self.status.is_interested {
                    log::debug!("No longer interested in peer {}", self.addr);
                    self.status.is_interested = false;
                    sink.send(Message::NotInterested).await?;
                }
            }
            Command::Choke => {
                if !self.status.is_peer_choked {
                    self.status.is_peer_choked = true;
                    sink.send(Message::Choke).await?;
                }
            }
            Command::Unchoke => {
                if self.status.is_peer_choked {
                    self.status.is_peer_choked = false;
                    sink.send(Message::Unchoke).await?;
                }
            }
            Command::Request(block) => {
                if self.state == State::Connected {
                    log::debug!(
                        "Requesting block {:?} from peer {}",
                        block,
                        self.addr
                    );
                    sink.send(Message::Request(block)).await?;
                }
            }
            Command::Have(piece_index) => {
                if self.state == State::Connected {
                    sink.send(Message::Have { piece_index }).await?;
                }
            }
            Command::Piece {
                piece_index,
                offset,
                data,
            } => {
                if self.state == State::Connected {
                    sink.send(Message::Block {
                        piece_index,
                        offset,
                        data,
                    })
                    .await?;
                }
            }
            Command::Cancel(block) => {
                if self.state == State::Connected {
                    sink.send(Message::Cancel(block)).await?;
                }
            }
            Command::Disconnect => return Ok(false),
        }

        Ok(true)
    }
}

/// The channel on which a torrent can send commands to its peer session.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive from its torrent.
#[derive(Debug, PartialEq)]
pub(crate) enum Command {
    /// Tell the peer we want pieces from it. A no-op if already interested.
    ExpressInterest,
    /// Tell the peer we don't want anything from it right now. A no-op if not
    /// interested.
    RevokeInterest,
    /// Refuse the peer's requests. A no-op if already choked.
    Choke,
    /// Permit the peer's requests. A no-op if not choked.
    Unchoke,
    /// Announce to the peer that we acquired a piece.
    Have(PieceIndex),
    /// Request a block from the peer.
    Request(BlockInfo),
    /// Send a block of data to the peer.
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    /// Revoke a block request previously sent to the peer.
    Cancel(BlockInfo),
    /// Drop the connection.
    Disconnect,
}

/// The channel on which peer sessions report events to their torrent.
pub(crate) type EventSender = UnboundedSender<Event>;
pub(crate) type EventReceiver = UnboundedReceiver<Event>;

/// The events a peer session reports to its torrent. Each carries the
/// session's remote address, as all sessions of a torrent share one event
/// channel.
#[derive(Debug, PartialEq)]
pub(crate) enum Event {
    /// The peer announced the pieces it has, right after the handshake. The
    /// bitfield is raw off the wire: it is a multiple of 8 bits long and the
    /// torrent validates and strips the padding.
    Bitfield {
        addr: SocketAddr,
        bitfield: Bitfield,
    },
    /// The peer announced a newly acquired piece.
    Have {
        addr: SocketAddr,
        piece_index: PieceIndex,
    },
    /// The peer refuses to serve our requests from now on.
    Choked { addr: SocketAddr },
    /// The peer is willing to serve our requests from now on.
    Unchoked { addr: SocketAddr },
    /// The peer sent a block of data.
    Block {
        addr: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    /// The session ended, for whatever reason: the connection attempt failed,
    /// the handshake or a message violated the protocol, the transport
    /// errored out, or either side closed the connection. Sent exactly once,
    /// after which the session is gone.
    Disconnected { addr: SocketAddr },
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This state is set once the handshakes are exchanged, until the first
    /// peer message arrives. It is used to verify that a bitfield exchange
    /// occurs only right after the handshake and never later. Any subsequent
    /// bitfield message is rejected and the connection is dropped, as per the
    /// standard.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the 'handshake' and 'bitfield', may be exchanged.
    Connected,
}

/// The default (and initial) state of a peer session is `Disconnected`.
impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The four flags of a peer connection.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}
