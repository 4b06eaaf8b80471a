//! # Engine Events
//!
//! Post-commit notifications for downstream consumers (notification, mint and
//! analytics workers). Events are published only after the transaction that
//! produced them committed, so a consumer never sees a rolled-back effect.
//!
//! Delivery is best effort: a full channel drops the event with a warning and
//! never fails the committed operation.

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::types::{AwardedItem, CampaignId, PrivilegeId, UserId};

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A committed engine effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// A contribution was converted into items.
    AllocationCompleted {
        /// External event id.
        event_id: String,
        /// User credited.
        user_id: UserId,
        /// Campaign drawn from.
        campaign_id: CampaignId,
        /// Aggregated awards.
        items: Vec<AwardedItem>,
    },
    /// A privilege was redeemed.
    RedemptionCompleted {
        /// Redeeming user.
        user_id: UserId,
        /// Privilege redeemed.
        privilege_id: PrivilegeId,
        /// The user's execution count after this redemption.
        execution_times: u64,
    },
}

/// Bounded broadcast-free event channel.
///
/// Every subscriber shares one queue; each event is received once.
#[derive(Debug)]
pub struct EventBus {
    sender: Sender<EngineEvent>,
    receiver: Receiver<EngineEvent>,
}

impl EventBus {
    /// Creates a bus holding at most `capacity` undelivered events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self { sender, receiver }
    }

    /// Publishes without blocking. Drops the event if the queue is full.
    pub fn publish(&self, event: EngineEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!("event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// A receiver for another thread.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.receiver.clone()
    }

    /// Takes every queued event.
    #[must_use]
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.receiver.try_iter().collect()
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Returns true if no event is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
