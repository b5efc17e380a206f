//! Loopback end-to-end scenarios, in the reference engine's own style of
//! spinning up a real listener and connecting to it rather than mocking
//! the transport.

use std::sync::Arc;
use std::time::Duration;

use peerswarm::config::PeerDescriptor;
use peerswarm::manager::PeerManager;
use peerswarm::storage::FileStore;
use peerswarm::{connection, piece_count};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Runs `f` with the process's current directory pointed at a fresh temp
/// directory, restoring it afterwards. This crate only has one test that
/// touches cwd, so there's no cross-test race to guard against.
async fn in_temp_dir<F, Fut>(f: F)
where
    F: FnOnce(std::path::PathBuf) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let dir = TempDir::new().unwrap();
    let prev = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();
    f(dir.path().to_path_buf()).await;
    std::env::set_current_dir(prev).unwrap();
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_two_peers_one_seed_one_empty() {
    in_temp_dir(|_dir| async move {
        let file_size: u64 = 16;
        let piece_size: u32 = 4;
        let num_pieces = piece_count(file_size, piece_size);
        let content = b"AAAABBBBCCCCDDDD";

        let seed_id = 1;
        let leech_id = 2;
        let port = free_port().await;

        let roster = vec![
            PeerDescriptor {
                peer_id: seed_id,
                host: "127.0.0.1".into(),
                port,
                starts_with_file: true,
            },
            PeerDescriptor {
                peer_id: leech_id,
                host: "127.0.0.1".into(),
                port: 0,
                starts_with_file: false,
            },
        ];
        let all_ids: Vec<_> = roster.iter().map(|p| p.peer_id).collect();

        let seed_storage = Arc::new(
            FileStore::new(seed_id, "shared.dat", file_size, piece_size, true).unwrap(),
        );
        // populate the seed's file directly since `starts_with_file` only
        // guarantees presence, not specific bytes
        for i in 0..num_pieces {
            let start = i * piece_size as usize;
            let end = std::cmp::min(start + piece_size as usize, content.len());
            seed_storage.write_piece(i, &content[start..end]).unwrap();
        }
        let leech_storage = Arc::new(
            FileStore::new(leech_id, "shared.dat", file_size, piece_size, false).unwrap(),
        );

        let seed_manager = PeerManager::new(seed_id, 1, all_ids.clone());
        seed_manager
            .update_peer_bitfield(seed_id, seed_storage.bitfield_snapshot())
            .await;
        let leech_manager = PeerManager::new(leech_id, 1, all_ids.clone());
        leech_manager
            .update_peer_bitfield(leech_id, leech_storage.bitfield_snapshot())
            .await;

        seed_manager.spawn_timers(Duration::from_millis(200), Duration::from_millis(400));
        leech_manager.spawn_timers(Duration::from_millis(200), Duration::from_millis(400));

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        {
            let manager = Arc::clone(&seed_manager);
            let storage = Arc::clone(&seed_storage);
            tokio::spawn(async move {
                let (socket, _) = listener.accept().await.unwrap();
                let _ = connection::run_inbound(socket, seed_id, manager, storage, num_pieces).await;
            });
        }

        let target = roster[0].clone();
        let manager = Arc::clone(&leech_manager);
        let storage = Arc::clone(&leech_storage);
        tokio::spawn(async move {
            let _ = connection::run_outbound(leech_id, target, manager, storage, num_pieces).await;
        });

        let result = tokio::time::timeout(Duration::from_secs(10), async {
            leech_manager.wait_until_done().await;
        })
        .await;
        assert!(result.is_ok(), "download did not complete in time");
        assert!(leech_storage.is_complete());
        for i in 0..num_pieces {
            assert_eq!(
                leech_storage.read_piece(i).unwrap(),
                seed_storage.read_piece(i).unwrap()
            );
        }
    })
    .await;
}
