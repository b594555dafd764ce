//! Peer worker pool
//!
//! A bounded pool of metadata-fetch workers racing over a stream of
//! discovered endpoints. The first worker to produce verified metadata
//! wins; dropping the pool's join set aborts every sibling, which closes
//! their sockets.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::peer::session;

/// Default cap on concurrent peer-wire sessions
pub const DEFAULT_MAX_WORKERS: usize = 50;

/// Bounded pool of peer-wire metadata workers
pub struct PeerWorkerPool {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    max_workers: usize,
}

impl PeerWorkerPool {
    /// Create a pool for the given torrent
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], max_workers: usize) -> Self {
        Self {
            info_hash,
            peer_id,
            max_workers: max_workers.max(1),
        }
    }

    /// Drain `endpoints`, attempting each distinct `(ip, port)` at most
    /// once, and return the first verified metadata blob.
    ///
    /// Returns `None` when the channel is exhausted without a winner.
    pub async fn run(&self, mut endpoints: mpsc::Receiver<SocketAddr>) -> Option<Vec<u8>> {
        let mut attempted: HashSet<SocketAddr> = HashSet::new();
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut workers: JoinSet<Option<Vec<u8>>> = JoinSet::new();
        let mut channel_open = true;

        loop {
            tokio::select! {
                endpoint = endpoints.recv(), if channel_open => {
                    let Some(addr) = endpoint else {
                        channel_open = false;
                        continue;
                    };
                    if !attempted.insert(addr) {
                        trace!("Endpoint {} already attempted, skipping", addr);
                        continue;
                    }
                    debug!("Queueing peer {}", addr);

                    let semaphore = Arc::clone(&semaphore);
                    let info_hash = self.info_hash;
                    let peer_id = self.peer_id;
                    workers.spawn(async move {
                        let _permit = semaphore.acquire_owned().await.ok()?;
                        match session::fetch_metadata(addr, info_hash, peer_id).await {
                            Ok(blob) => Some(blob),
                            Err(e) => {
                                debug!("Peer {} failed: {}", addr, e);
                                None
                            }
                        }
                    });
                }
                joined = workers.join_next(), if !workers.is_empty() => {
                    if let Some(Ok(Some(blob))) = joined {
                        debug!("Worker produced verified metadata ({} bytes)", blob.len());
                        // Dropping the join set aborts every sibling worker
                        return Some(blob);
                    }
                }
                else => break,
            }
        }

        debug!("Endpoint channel drained with no winner ({} attempted)", attempted.len());
        None
    }
}
