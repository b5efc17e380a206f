//! Per-peer connection actor.
//!
//! One task per TCP connection, owning that connection's private mutable
//! state exclusively (in-flight requests, choke/interest flags, the
//! remote's bitfield). The only things shared with [`crate::manager`] are
//! a command channel the manager uses to tell this task to choke/unchoke
//! or announce a `HAVE`, and a small set of atomics the manager reads to
//! pick preferred/optimistic neighbors without waiting on this task.
//!
//! The handshake and steady-state phases are framed with two different
//! codecs over the same socket; [`tokio_util::codec::Framed::into_parts`]
//! hands the second codec any bytes the first one buffered but didn't
//! consume, so nothing read ahead of time is lost switching between them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::config::PeerDescriptor;
use crate::error::{Error, Result};
use crate::manager::PeerManager;
use crate::storage::FileStore;
use crate::wire::{Handshake, HandshakeCodec, Message, PeerMessageCodec};
use crate::{Bitfield, PeerId, PieceIndex};

/// Commands the manager sends down to a running connection task.
#[derive(Debug)]
pub(crate) enum Command {
    Choke,
    Unchoke,
    SendHave(PieceIndex),
    Shutdown,
}

/// State published by the connection task for the manager to read
/// without synchronizing with the task itself.
pub(crate) struct ConnectionShared {
    pub they_are_interested_in_me: AtomicBool,
    pub am_choking_them: AtomicBool,
    bytes_downloaded: AtomicU64,
    sample_epoch: std::sync::Mutex<Instant>,
}

impl ConnectionShared {
    fn new() -> Self {
        Self {
            they_are_interested_in_me: AtomicBool::new(false),
            am_choking_them: AtomicBool::new(true),
            bytes_downloaded: AtomicU64::new(0),
            sample_epoch: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn record_download(&self, bytes: usize) {
        self.bytes_downloaded
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Drains the accumulated byte count and returns the average download
    /// rate, in bytes/sec, since the previous call.
    pub(crate) fn get_and_reset_rate(&self) -> f64 {
        let elapsed = {
            let mut epoch = self.sample_epoch.lock().unwrap();
            let now = Instant::now();
            let dt = now.duration_since(*epoch);
            *epoch = now;
            dt
        };
        let bytes = self.bytes_downloaded.swap(0, Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            bytes as f64 / secs
        }
    }
}

/// A handle the manager keeps per live connection: a way to command the
/// task and a window into its published state.
pub(crate) struct ConnectionHandle {
    pub remote_id: PeerId,
    pub cmd_tx: mpsc::UnboundedSender<Command>,
    pub shared: Arc<ConnectionShared>,
}

struct Status {
    am_interested_in_them: bool,
    they_are_choking_me: bool,
}

impl Status {
    fn new() -> Self {
        Self {
            am_interested_in_them: false,
            they_are_choking_me: true,
        }
    }
}

pub async fn run_outbound(
    local_id: PeerId,
    target: PeerDescriptor,
    manager: Arc<PeerManager>,
    storage: Arc<FileStore>,
    num_pieces: usize,
) -> Result<()> {
    let socket = TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(Error::Socket)?;
    log::info!("Peer {} makes a connection to Peer {}.", local_id, target.peer_id);
    run_session(socket, local_id, Some(target.peer_id), manager, storage, num_pieces).await
}

pub async fn run_inbound(
    socket: TcpStream,
    local_id: PeerId,
    manager: Arc<PeerManager>,
    storage: Arc<FileStore>,
    num_pieces: usize,
) -> Result<()> {
    run_session(socket, local_id, None, manager, storage, num_pieces).await
}

async fn run_session(
    socket: TcpStream,
    local_id: PeerId,
    expected_remote_id: Option<PeerId>,
    manager: Arc<PeerManager>,
    storage: Arc<FileStore>,
    num_pieces: usize,
) -> Result<()> {
    let mut handshake_io = Framed::new(socket, HandshakeCodec);
    handshake_io.send(Handshake::new(local_id)).await?;
    let handshake = handshake_io
        .next()
        .await
        .ok_or(Error::BadHandshake)??;
    if let Some(expected) = expected_remote_id {
        if handshake.peer_id != expected {
            return Err(Error::BadHandshake);
        }
    }
    let remote_id = handshake.peer_id;
    if expected_remote_id.is_none() {
        log::info!("Peer {} is connected from Peer {}.", local_id, remote_id);
    }

    let parts = handshake_io.into_parts();
    let mut framed_parts = tokio_util::codec::FramedParts::new(parts.io, PeerMessageCodec);
    framed_parts.read_buf = parts.read_buf;
    framed_parts.write_buf = parts.write_buf;
    let mut stream = Framed::from_parts(framed_parts);

    // Bitfield exchange: always send ours, even if empty, so the remote's
    // termination watch can see we have zero pieces. The peer's very next
    // message must be its own BITFIELD; anything else is a protocol
    // violation.
    let my_bitfield = storage.bitfield_snapshot();
    stream
        .send(Message::Bitfield(my_bitfield.to_bytes()))
        .await?;
    let mut their_bitfield = Bitfield::new(num_pieces);
    match stream.next().await.ok_or(Error::Protocol(
        "connection closed before bitfield phase completed".into(),
    ))?? {
        Message::Bitfield(bytes) => {
            their_bitfield = Bitfield::from_bytes(num_pieces, &bytes)?;
        }
        _ => {
            return Err(Error::Protocol(
                "expected BITFIELD as the first message".into(),
            ));
        }
    }
    manager
        .update_peer_bitfield(remote_id, their_bitfield.clone())
        .await;

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(ConnectionShared::new());
    manager
        .add_connection(ConnectionHandle {
            remote_id,
            cmd_tx,
            shared: Arc::clone(&shared),
        })
        .await;

    let mut status = Status::new();
    let mut in_flight: HashSet<PieceIndex> = HashSet::new();

    if storage.check_interest(&their_bitfield) {
        status.am_interested_in_them = true;
        stream.send(Message::Interested).await?;
    } else {
        stream.send(Message::NotInterested).await?;
    }

    let result = drive_session(
        &mut stream,
        &mut cmd_rx,
        &manager,
        &storage,
        local_id,
        remote_id,
        &shared,
        &mut status,
        &mut their_bitfield,
        &mut in_flight,
    )
    .await;

    manager.remove_connection(remote_id).await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn drive_session(
    stream: &mut Framed<TcpStream, PeerMessageCodec>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    manager: &Arc<PeerManager>,
    storage: &Arc<FileStore>,
    local_id: PeerId,
    remote_id: PeerId,
    shared: &Arc<ConnectionShared>,
    status: &mut Status,
    their_bitfield: &mut Bitfield,
    in_flight: &mut HashSet<PieceIndex>,
) -> Result<()> {
    loop {
        futures::select! {
            msg = stream.next() => {
                let msg = match msg {
                    Some(msg) => msg?,
                    None => return Ok(()),
                };
                handle_message(
                    stream, manager, storage, local_id, remote_id, shared, status,
                    their_bitfield, in_flight, msg,
                ).await?;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Choke) => {
                        stream.send(Message::Choke).await?;
                        shared.am_choking_them.store(true, Ordering::Relaxed);
                    }
                    Some(Command::Unchoke) => {
                        stream.send(Message::Unchoke).await?;
                        shared.am_choking_them.store(false, Ordering::Relaxed);
                    }
                    Some(Command::SendHave(index)) => {
                        stream.send(Message::Have(index)).await?;
                    }
                    Some(Command::Shutdown) | None => return Ok(()),
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_message(
    stream: &mut Framed<TcpStream, PeerMessageCodec>,
    manager: &Arc<PeerManager>,
    storage: &Arc<FileStore>,
    local_id: PeerId,
    remote_id: PeerId,
    shared: &Arc<ConnectionShared>,
    status: &mut Status,
    their_bitfield: &mut Bitfield,
    in_flight: &mut HashSet<PieceIndex>,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::Bitfield(_) => {
            return Err(Error::Protocol(
                "received BITFIELD outside the bitfield phase".into(),
            ));
        }
        Message::Have(index) => {
            their_bitfield.set(index)?;
            manager
                .update_peer_bitfield(remote_id, their_bitfield.clone())
                .await;
            log::info!(
                "Peer {} received the 'have' message from {} for the piece {}.",
                local_id,
                remote_id,
                index
            );
            update_interest(stream, storage, status, their_bitfield).await?;
        }
        Message::Interested => {
            shared.they_are_interested_in_me.store(true, Ordering::Relaxed);
            log::info!(
                "Peer {} received the 'interested' message from {}.",
                local_id,
                remote_id
            );
        }
        Message::NotInterested => {
            shared.they_are_interested_in_me.store(false, Ordering::Relaxed);
            log::info!(
                "Peer {} received the 'not interested' message from {}.",
                local_id,
                remote_id
            );
        }
        Message::Choke => {
            status.they_are_choking_me = true;
            in_flight.clear();
            log::info!("Peer {} is choked by {}.", local_id, remote_id);
        }
        Message::Unchoke => {
            status.they_are_choking_me = false;
            log::info!("Peer {} is unchoked by {}.", local_id, remote_id);
            try_request_next(stream, storage, status, their_bitfield, in_flight).await?;
        }
        Message::Request(index) => {
            if !shared.am_choking_them.load(Ordering::Relaxed) {
                let data = storage.read_piece(index)?;
                stream.send(Message::Piece(index, data)).await?;
            }
        }
        Message::Piece(index, data) => {
            shared.record_download(data.len());
            in_flight.remove(&index);
            storage.write_piece(index, &data)?;
            let snapshot = storage.bitfield_snapshot();
            let num_have = (0..snapshot.num_pieces())
                .filter(|&i| snapshot.has(i).unwrap_or(false))
                .count();
            manager.update_peer_bitfield(local_id, snapshot).await;
            manager.broadcast_have(index).await;
            log::info!(
                "Peer {} has downloaded the piece {} from {}. Now the number of pieces it has is {}.",
                local_id,
                remote_id,
                index,
                num_have
            );
            if storage.is_complete() {
                log::info!("Peer {} has downloaded the complete file.", local_id);
            }
            try_request_next(stream, storage, status, their_bitfield, in_flight).await?;
        }
    }
    Ok(())
}

async fn update_interest(
    stream: &mut Framed<TcpStream, PeerMessageCodec>,
    storage: &Arc<FileStore>,
    status: &mut Status,
    their_bitfield: &Bitfield,
) -> Result<()> {
    let interesting = storage.check_interest(their_bitfield);
    if interesting && !status.am_interested_in_them {
        status.am_interested_in_them = true;
        stream.send(Message::Interested).await?;
    } else if !interesting && status.am_interested_in_them {
        status.am_interested_in_them = false;
        stream.send(Message::NotInterested).await?;
    }
    Ok(())
}

async fn try_request_next(
    stream: &mut Framed<TcpStream, PeerMessageCodec>,
    storage: &Arc<FileStore>,
    status: &Status,
    their_bitfield: &Bitfield,
    in_flight: &mut HashSet<PieceIndex>,
) -> Result<()> {
    if status.they_are_choking_me || !in_flight.is_empty() {
        return Ok(());
    }
    let mine = storage.bitfield_snapshot();
    if let Some(index) = mine.pick_random_missing(their_bitfield, in_flight) {
        in_flight.insert(index);
        stream.send(Message::Request(index)).await?;
    }
    Ok(())
}
