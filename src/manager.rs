//! Tracks live connections and runs the two periodic neighbor-selection
//! timers.
//!
//! Modeled the way the teacher shares a single piece picker across peer
//! sessions (`Arc<RwLock<PiecePicker>>`, awaited directly rather than
//! routed through a channel): connection tasks and the timer loops below
//! all reach into the same `Mutex`-guarded registry, since the operations
//! on it are simple map lookups rather than anything that benefits from
//! actor isolation.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{Mutex, Notify};

use crate::connection::{Command, ConnectionHandle};
use crate::{Bitfield, PeerId};

struct Inner {
    connections: HashMap<PeerId, ConnectionHandle>,
    preferred: HashSet<PeerId>,
    optimistic: Option<PeerId>,
    peer_bitfields: HashMap<PeerId, Bitfield>,
}

pub struct PeerManager {
    local_id: PeerId,
    num_preferred_neighbors: usize,
    all_peer_ids: Vec<PeerId>,
    inner: Mutex<Inner>,
    done: Notify,
}

impl PeerManager {
    pub fn new(local_id: PeerId, num_preferred_neighbors: usize, all_peer_ids: Vec<PeerId>) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            num_preferred_neighbors,
            all_peer_ids,
            inner: Mutex::new(Inner {
                connections: HashMap::new(),
                preferred: HashSet::new(),
                optimistic: None,
                peer_bitfields: HashMap::new(),
            }),
            done: Notify::new(),
        })
    }

    /// Resolves once every known peer's bitfield, including our own, is
    /// complete.
    pub async fn wait_until_done(&self) {
        self.done.notified().await;
    }

    pub(crate) async fn add_connection(&self, handle: ConnectionHandle) {
        let mut inner = self.inner.lock().await;
        inner.connections.insert(handle.remote_id, handle);
    }

    pub(crate) async fn remove_connection(&self, remote_id: PeerId) {
        let mut inner = self.inner.lock().await;
        inner.connections.remove(&remote_id);
        inner.preferred.remove(&remote_id);
        if inner.optimistic == Some(remote_id) {
            inner.optimistic = None;
        }
    }

    /// Records the latest known bitfield for `peer_id` — called both for
    /// remote peers, whenever a BITFIELD or HAVE message arrives, and for
    /// ourselves, after every successful local write. Both paths must
    /// update this view for the termination watch below to be accurate.
    pub async fn update_peer_bitfield(&self, peer_id: PeerId, bitfield: Bitfield) {
        let mut inner = self.inner.lock().await;
        inner.peer_bitfields.insert(peer_id, bitfield);
        let all_complete = self
            .all_peer_ids
            .iter()
            .all(|id| inner.peer_bitfields.get(id).map_or(false, |b| b.is_complete()));
        if all_complete {
            self.done.notify_one();
        }
    }

    pub(crate) async fn broadcast_have(&self, index: crate::PieceIndex) {
        let inner = self.inner.lock().await;
        for handle in inner.connections.values() {
            let _ = handle.cmd_tx.send(Command::SendHave(index));
        }
    }

    /// Spawns the preferred- and optimistic-unchoke timer loops. Returns
    /// immediately; the loops run until the process exits.
    pub fn spawn_timers(self: &Arc<Self>, unchoking_interval: Duration, optimistic_interval: Duration) {
        let preferred = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(unchoking_interval);
            loop {
                ticker.tick().await;
                preferred.reselect_preferred().await;
            }
        });
        let optimistic = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(optimistic_interval);
            loop {
                ticker.tick().await;
                optimistic.reselect_optimistic().await;
            }
        });
    }

    async fn reselect_preferred(&self) {
        let mut inner = self.inner.lock().await;
        let i_am_seed = inner
            .peer_bitfields
            .get(&self.local_id)
            .map_or(false, |b| b.is_complete());

        let mut candidates: Vec<(PeerId, f64)> = inner
            .connections
            .iter()
            .filter(|(_, handle)| {
                handle
                    .shared
                    .they_are_interested_in_me
                    .load(AtomicOrdering::Relaxed)
            })
            .map(|(id, handle)| (*id, handle.shared.get_and_reset_rate()))
            .collect();

        let new_preferred: HashSet<PeerId> = if i_am_seed {
            // no download rate to rank by; choose uniformly at random
            let mut ids: Vec<PeerId> = candidates.drain(..).map(|(id, _)| id).collect();
            ids.shuffle(&mut rand::thread_rng());
            ids.into_iter().take(self.num_preferred_neighbors).collect()
        } else {
            candidates.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });
            candidates
                .into_iter()
                .take(self.num_preferred_neighbors)
                .map(|(id, _)| id)
                .collect()
        };

        let to_unchoke: Vec<PeerId> = new_preferred.difference(&inner.preferred).copied().collect();
        let to_choke: Vec<PeerId> = inner
            .preferred
            .difference(&new_preferred)
            .filter(|id| inner.optimistic != Some(**id))
            .copied()
            .collect();

        for id in to_unchoke {
            if let Some(handle) = inner.connections.get(&id) {
                if handle.shared.am_choking_them.load(AtomicOrdering::Relaxed) {
                    let _ = handle.cmd_tx.send(Command::Unchoke);
                }
            }
        }
        for id in to_choke {
            if let Some(handle) = inner.connections.get(&id) {
                if !handle.shared.am_choking_them.load(AtomicOrdering::Relaxed) {
                    let _ = handle.cmd_tx.send(Command::Choke);
                }
            }
        }

        inner.preferred = new_preferred;
        let mut ids: Vec<PeerId> = inner.preferred.iter().copied().collect();
        ids.sort_unstable();
        let list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        log::info!("Peer {} has the preferred neighbors [{}].", self.local_id, list);
    }

    async fn reselect_optimistic(&self) {
        let mut inner = self.inner.lock().await;
        let eligible: Vec<PeerId> = {
            let preferred = &inner.preferred;
            inner
                .connections
                .iter()
                .filter(|(id, handle)| {
                    handle
                        .shared
                        .they_are_interested_in_me
                        .load(AtomicOrdering::Relaxed)
                        && handle.shared.am_choking_them.load(AtomicOrdering::Relaxed)
                        && !preferred.contains(*id)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        let chosen = match eligible.choose(&mut rand::thread_rng()) {
            Some(id) => *id,
            None => return,
        };

        if let Some(previous) = inner.optimistic {
            if previous != chosen && !inner.preferred.contains(&previous) {
                if let Some(handle) = inner.connections.get(&previous) {
                    if !handle.shared.am_choking_them.load(AtomicOrdering::Relaxed) {
                        let _ = handle.cmd_tx.send(Command::Choke);
                    }
                }
            }
        }

        inner.optimistic = Some(chosen);
        if let Some(handle) = inner.connections.get(&chosen) {
            if handle.shared.am_choking_them.load(AtomicOrdering::Relaxed) {
                let _ = handle.cmd_tx.send(Command::Unchoke);
            }
        }
        log::info!(
            "Peer {} has the optimistically unchoked neighbor {}.",
            self.local_id,
            chosen
        );
    }
}
