//! Event system for wallet-to-host notifications.
//!
//! The wallet emits events for subscribers (UI, RPC long-pollers) through
//! a broadcast bus. Emission never blocks: slow or absent receivers are
//! not an error.

use dashcore::{Address, Txid};
use tokio::sync::broadcast;

const DEFAULT_EVENT_LIMIT: usize = 10000;

/// What happened to an entry that changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Updated,
    Removed,
}

/// Notifications exposed to subscribers.
#[derive(Debug, Clone)]
pub enum WalletEvent {
    /// A wallet transaction was added, updated or removed.
    TransactionChanged { txid: Txid, status: ChangeType },
    /// An address book entry was added, updated or removed.
    AddressBookChanged {
        address: Address,
        label: String,
        purpose: String,
        is_mine: bool,
        status: ChangeType,
    },
    /// Long-running operation progress, 0..=100. Used by rescan.
    ShowProgress { title: String, progress: i32 },
    /// The set of watch-only scripts became empty / non-empty.
    WatchOnlyChanged { have_watch_only: bool },
}

/// Broadcast bus carrying [`WalletEvent`]s to any number of subscribers.
///
/// Late subscribers do not receive past events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WalletEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
        }
    }

    /// Create a new subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers. No receivers is not an error.
    pub fn emit(&self, event: WalletEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashcore::hashes::Hash;

    #[test]
    fn test_emit_without_receivers() {
        let bus = EventBus::default();
        bus.emit(WalletEvent::WatchOnlyChanged {
            have_watch_only: true,
        });
    }

    #[tokio::test]
    async fn test_emit_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let txid = Txid::all_zeros();
        bus.emit(WalletEvent::TransactionChanged {
            txid,
            status: ChangeType::Added,
        });

        match rx.recv().await.unwrap() {
            WalletEvent::TransactionChanged {
                txid: got,
                status,
            } => {
                assert_eq!(got, txid);
                assert_eq!(status, ChangeType::Added);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
