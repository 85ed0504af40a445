//! Duplicate suppression for conversation views.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use kindred_shared::DeliveryStatus;
use kindred_store::Message;

/// Message ids a subscription has already taken in, from the store or the
/// echo transport.
#[derive(Debug, Default)]
pub struct SeenSet {
    ids: HashSet<Uuid>,
}

impl SeenSet {
    /// Returns `true` when `id` was not seen before.
    pub fn insert(&mut self, id: Uuid) -> bool {
        self.ids.insert(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }
}

impl Extend<Uuid> for SeenSet {
    fn extend<T: IntoIterator<Item = Uuid>>(&mut self, iter: T) {
        self.ids.extend(iter);
    }
}

/// The ordered list a conversation callback receives, keyed by message id
/// so that no id ever appears twice.
#[derive(Debug, Default)]
pub struct MessageSink {
    by_id: HashMap<Uuid, Message>,
}

impl MessageSink {
    /// Merge messages into the view. A pending copy never overwrites a
    /// stored one. Returns whether the view changed.
    pub fn merge(&mut self, messages: impl IntoIterator<Item = Message>) -> bool {
        let mut changed = false;
        for message in messages {
            match self.by_id.get(&message.id) {
                Some(existing)
                    if existing.delivery_status != DeliveryStatus::Pending
                        && message.delivery_status == DeliveryStatus::Pending => {}
                Some(existing) if *existing == message => {}
                _ => {
                    self.by_id.insert(message.id, message);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Flag still-pending messages missing from `alive` as failed. Returns
    /// how many were flagged.
    pub fn fail_missing(&mut self, alive: &HashSet<Uuid>) -> usize {
        let mut failed = 0;
        for message in self.by_id.values_mut() {
            if message.delivery_status == DeliveryStatus::Pending && !alive.contains(&message.id) {
                message.delivery_status = DeliveryStatus::Failed;
                failed += 1;
            }
        }
        failed
    }

    /// Messages ordered by creation time, ties broken by id.
    pub fn snapshot(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.by_id.values().cloned().collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        messages
    }

    pub fn get(&self, id: &Uuid) -> Option<&Message> {
        self.by_id.get(id)
    }
}
