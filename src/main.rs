//! Entry point: `peerswarm <peer id>`.
//!
//! Reads `Common.cfg` and `PeerInfo.cfg` from the current directory,
//! brings up logging and local storage for the given peer id, then dials
//! every peer listed before it in `PeerInfo.cfg` while listening for
//! connections from the rest, per the roster ordering each process is
//! started in.

use std::sync::Arc;

use peerswarm::config::{self, CommonConfig};
use peerswarm::error::{Error, Result};
use peerswarm::manager::PeerManager;
use peerswarm::storage::FileStore;
use peerswarm::{connection, logging, piece_count, PeerId};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("peerswarm: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let peer_id: PeerId = std::env::args()
        .nth(1)
        .ok_or_else(|| Error::Config("usage: peerswarm <peer id>".into()))?
        .parse()
        .map_err(|_| Error::Config("<peer id> must be a decimal integer".into()))?;

    let common = CommonConfig::from_file("Common.cfg")?;
    let roster = config::load_peer_roster("PeerInfo.cfg")?;
    let me = roster
        .iter()
        .find(|p| p.peer_id == peer_id)
        .cloned()
        .ok_or_else(|| Error::Config(format!("peer id {} is not listed in PeerInfo.cfg", peer_id)))?;

    logging::init(peer_id)?;

    let num_pieces = piece_count(common.file_size, common.piece_size);
    let storage = Arc::new(FileStore::new(
        peer_id,
        &common.file_name,
        common.file_size,
        common.piece_size,
        me.starts_with_file,
    )?);

    let all_peer_ids: Vec<PeerId> = roster.iter().map(|p| p.peer_id).collect();
    let manager = PeerManager::new(peer_id, common.num_preferred_neighbors, all_peer_ids);
    manager
        .update_peer_bitfield(peer_id, storage.bitfield_snapshot())
        .await;

    let listener = TcpListener::bind(("0.0.0.0", me.port))
        .await
        .map_err(Error::Socket)?;
    spawn_accept_loop(listener, peer_id, Arc::clone(&manager), Arc::clone(&storage), num_pieces);

    for peer in &roster {
        if peer.peer_id == peer_id {
            // Everyone before us in the roster we dial; everyone after us
            // dials us instead, so we only need to break here.
            break;
        }
        let target = peer.clone();
        let manager = Arc::clone(&manager);
        let storage = Arc::clone(&storage);
        tokio::spawn(async move {
            if let Err(e) = connection::run_outbound(peer_id, target, manager, storage, num_pieces).await {
                log::debug!("outbound session failed: {}", e);
            }
        });
    }

    manager.spawn_timers(common.unchoking_interval, common.optimistic_unchoking_interval);

    manager.wait_until_done().await;
    Ok(())
}

fn spawn_accept_loop(
    listener: TcpListener,
    peer_id: PeerId,
    manager: Arc<PeerManager>,
    storage: Arc<FileStore>,
    num_pieces: usize,
) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _addr)) => {
                    let manager = Arc::clone(&manager);
                    let storage = Arc::clone(&storage);
                    tokio::spawn(async move {
                        if let Err(e) =
                            connection::run_inbound(socket, peer_id, manager, storage, num_pieces).await
                        {
                            log::debug!("inbound session failed: {}", e);
                        }
                    });
                }
                Err(e) => log::debug!("accept failed: {}", e),
            }
        }
    });
}
