// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Tombstoned chunks and abandoned messages linger this long before
/// the sweeper hard-deletes them.
const DEFAULT_GRACE_MILLIS: i64 = 60 * 60 * 1000;

/// Periodic task that hard-deletes tombstoned chunks and garbage
/// collects messages that were opened but never sealed.
pub struct ChunkSweeper {
    storage: Arc<dyn Storage>,
    interval: Duration,
    grace_millis: i64,
}

pub struct SweeperHandle {
    cancel_sender: Option<oneshot::Sender<()>>,
    join_handle: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn cancel(mut self) {
        if let Some(sender) = self.cancel_sender.take() {
            let _ = sender.send(());
        }
        let _ = self.join_handle.await;
    }
}

impl ChunkSweeper {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        ChunkSweeper {
            storage,
            interval: DEFAULT_SWEEP_INTERVAL,
            grace_millis: DEFAULT_GRACE_MILLIS,
        }
    }

    pub fn with_schedule(mut self, interval: Duration, grace_millis: i64) -> Self {
        self.interval = interval;
        self.grace_millis = grace_millis;
        self
    }

    pub fn start(self) -> SweeperHandle {
        info!("Task 'chunk-sweeper' started");
        let (cancel_sender, mut cancel_receiver) = oneshot::channel::<()>();
        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await; // discard first immediate tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.storage.sweep(self.grace_millis).await {
                            Ok(0) => {}
                            Ok(removed) => {
                                debug!("chunk-sweeper removed {} rows", removed);
                            }
                            Err(e) => {
                                warn!("Task 'chunk-sweeper' failed: {:?}", e);
                            }
                        }
                    }
                    _ = &mut cancel_receiver => {
                        info!("Task 'chunk-sweeper' received cancellation signal");
                        break;
                    }
                }
            }
        });
        SweeperHandle {
            cancel_sender: Some(cancel_sender),
            join_handle,
        }
    }
}
