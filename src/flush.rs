//! Background tasks: scheduled storage flushing and periodic wallet
//! maintenance (timed relock, transaction resend, automatic backups).
//!
//! Both tasks take the wallet lock, do a bounded amount of synchronous
//! work and release it; neither holds the lock across an await point.
//! Stop them by aborting the returned handles.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::wallet::{unix_time, Wallet};

/// How often the flush scheduler wakes up.
pub const FLUSH_PERIOD: Duration = Duration::from_millis(500);

/// How often maintenance (relock, resend, auto-backup) runs.
pub const MAINTENANCE_PERIOD: Duration = Duration::from_secs(1);

fn lock_wallet(wallet: &Arc<Mutex<Wallet>>) -> std::sync::MutexGuard<'_, Wallet> {
    wallet.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Flush the database once writes have quiesced: a tick with no new
/// writes since the previous one, and unflushed writes outstanding.
pub fn spawn_flush_scheduler(wallet: Arc<Mutex<Wallet>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(FLUSH_PERIOD);
        let mut last_seen = 0u64;
        let mut last_flushed = 0u64;
        loop {
            interval.tick().await;
            let mut guard = lock_wallet(&wallet);
            let count = guard.storage().write_count();
            if count == last_seen && count != last_flushed {
                match guard.storage_mut().flush() {
                    Ok(()) => {
                        last_flushed = count;
                        debug!(write_count = count, "wallet flushed");
                    }
                    Err(e) => warn!(error = %e, "wallet flush failed"),
                }
            }
            last_seen = count;
        }
    })
}

/// Periodic wallet upkeep: honor the scheduled relock time, re-announce
/// stale unconfirmed transactions, and write an automatic backup when the
/// keypool drained past the configured threshold.
pub fn spawn_maintenance(wallet: Arc<Mutex<Wallet>>, backup_dir: Option<PathBuf>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_PERIOD);
        loop {
            interval.tick().await;
            let now = unix_time();
            let mut guard = lock_wallet(&wallet);

            if let Some(relock_at) = guard.relock_time() {
                if now >= relock_at {
                    guard.lock();
                    debug!("timed relock");
                }
            }

            let best_block_time = guard
                .best_block()
                .and_then(|h| guard.chain().block_time(&h))
                .unwrap_or(0) as u64;
            guard.resend_wallet_transactions(now, best_block_time);

            if guard.auto_backup_due() {
                if let Some(dir) = &backup_dir {
                    let dest = dir.join(format!("wallet-{}-{}.bak", guard.name(), now));
                    if let Err(e) = guard.backup(&dest) {
                        warn!(error = %e, "automatic backup failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::test_utils::MockChain;
    use crate::wallet::config::WalletConfig;
    use dashcore::Network;

    fn shared_wallet() -> Arc<Mutex<Wallet>> {
        let chain = Arc::new(MockChain::with_height(5));
        let mut config = WalletConfig::default();
        config.keypool_size = 2;
        let wallet = Wallet::create_new(
            "bg",
            Network::Testnet,
            config,
            Box::new(MemoryStorage::new()),
            chain,
        )
        .unwrap();
        Arc::new(Mutex::new(wallet))
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_scheduler_runs_when_quiesced() {
        let wallet = shared_wallet();
        let handle = spawn_flush_scheduler(Arc::clone(&wallet));

        // A couple of periods pass without new writes: the scheduler
        // must flush without panicking and keep running.
        tokio::time::sleep(FLUSH_PERIOD * 4).await;
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_relock() {
        let wallet = shared_wallet();
        {
            let mut guard = lock_wallet(&wallet);
            guard.encrypt_wallet("pp").unwrap();
            guard.unlock("pp", false).unwrap();
            // Relock moment already in the past.
            guard.set_relock_time(Some(1));
            assert!(!guard.is_locked());
        }

        let handle = spawn_maintenance(Arc::clone(&wallet), None);
        tokio::time::sleep(MAINTENANCE_PERIOD * 3).await;
        // Let the spawned task actually run.
        tokio::task::yield_now().await;
        assert!(lock_wallet(&wallet).is_locked());
        handle.abort();
    }
}
