//! In-process publication of wallet events.
//!
//! Components publish through a shared [`StatusPublisher`]; consumers
//! subscribe to a broadcast stream.  Replaces any external pub/sub
//! transport for everything that stays inside the process.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::*;

use cinder_primitives::prelude::*;

mod event;

pub use event::WalletEvent;

/// Capacity of the broadcast ring.  Slow subscribers observe `Lagged`
/// rather than blocking publishers.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Shared handle used to publish wallet events.
pub struct StatusPublisher {
    event_tx: broadcast::Sender<WalletEvent>,

    /// Last announced tip per (chain, filter type), kept to suppress
    /// duplicate announcements.
    filter_tips: Mutex<HashMap<(Chain, FilterType), BlockPosition>>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            event_tx,
            filter_tips: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.event_tx.subscribe()
    }

    /// Announces a new cfilter tip, unless it matches the previous
    /// announcement for the same chain and filter type.
    pub fn publish_filter_tip(&self, chain: Chain, filter_type: FilterType, tip: BlockPosition) {
        {
            let mut tips = self.filter_tips.lock();
            if tips.get(&(chain, filter_type)) == Some(&tip) {
                trace!(%chain, ?filter_type, %tip, "suppressing duplicate filter tip");
                return;
            }
            tips.insert((chain, filter_type), tip);
        }

        self.publish(WalletEvent::FilterTip {
            chain,
            filter_type,
            tip,
        });
    }

    pub fn publish(&self, event: WalletEvent) {
        // An error only means there are no subscribers right now.
        if self.event_tx.send(event).is_err() {
            trace!("published wallet event with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_tip_dedup() {
        let status = StatusPublisher::new();
        let mut rx = status.subscribe();
        let tip = BlockPosition::new(5, Buf32::from([1; 32]));

        status.publish_filter_tip(Chain::UnitTest, FilterType::Basic, tip);
        status.publish_filter_tip(Chain::UnitTest, FilterType::Basic, tip);

        let next = BlockPosition::new(6, Buf32::from([2; 32]));
        status.publish_filter_tip(Chain::UnitTest, FilterType::Basic, next);

        assert!(matches!(
            rx.try_recv(),
            Ok(WalletEvent::FilterTip { tip: t, .. }) if t == tip
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(WalletEvent::FilterTip { tip: t, .. }) if t == next
        ));
        assert!(rx.try_recv().is_err());
    }
}
