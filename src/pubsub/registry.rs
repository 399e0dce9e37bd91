//! Channel to handler registrations.
//!
//! Handler lists are copy-on-write: every change swaps in a new
//! `Arc<[..]>`, so a delivery that already took a snapshot runs to completion
//! against the list it saw.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::{DashMap, mapref::entry::Entry};

use super::{Channel, Handler, SubscriptionId};

pub(crate) type Handlers = Arc<[(SubscriptionId, Handler)]>;

struct Registration {
    /// Position of the channel's first registration; drives replay order.
    order: u64,
    handlers: Handlers,
}

/// Registered subscriptions keyed by channel and by id.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    channels: DashMap<Channel, Registration>,
    ids: DashMap<SubscriptionId, Channel>,
    next_id: AtomicU64,
    next_order: AtomicU64,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("channels", &self.channels.len())
            .field("handlers", &self.ids.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Register `handler` for `channel`.
    ///
    /// Returns the new id and whether this is the channel's first handler,
    /// in which case the caller must subscribe on the server.
    pub(crate) fn add(&self, channel: Channel, handler: Handler) -> (SubscriptionId, bool) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let first = match self.channels.entry(channel.clone()) {
            Entry::Occupied(mut entry) => {
                let registration = entry.get_mut();
                registration.handlers = registration
                    .handlers
                    .iter()
                    .cloned()
                    .chain(std::iter::once((id, handler)))
                    .collect();
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Registration {
                    order: self.next_order.fetch_add(1, Ordering::Relaxed),
                    handlers: Arc::from(vec![(id, handler)]),
                });
                true
            }
        };
        self.ids.insert(id, channel);
        (id, first)
    }

    /// Remove the handler registered as `id`.
    ///
    /// Returns its channel and whether it was the channel's last handler, in
    /// which case the caller should unsubscribe on the server.
    pub(crate) fn remove(&self, id: SubscriptionId) -> Option<(Channel, bool)> {
        let (_, channel) = self.ids.remove(&id)?;
        let last = match self.channels.entry(channel.clone()) {
            Entry::Occupied(mut entry) => {
                let remaining: Handlers = entry
                    .get()
                    .handlers
                    .iter()
                    .filter(|(registered, _)| *registered != id)
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    entry.remove();
                    true
                } else {
                    entry.get_mut().handlers = remaining;
                    false
                }
            }
            Entry::Vacant(_) => false,
        };
        Some((channel, last))
    }

    /// Snapshot of the handlers registered for `channel`.
    pub(crate) fn handlers(&self, channel: &Channel) -> Option<Handlers> {
        self.channels
            .get(channel)
            .map(|registration| Arc::clone(&registration.handlers))
    }

    /// Channels with at least one handler, in first-registration order.
    pub(crate) fn replay_order(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self
            .channels
            .iter()
            .map(|entry| (entry.value().order, entry.key().clone()))
            .collect();
        channels.sort_unstable_by_key(|(order, _)| *order);
        channels.into_iter().map(|(_, channel)| channel).collect()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;
    use crate::pubsub::PubSubMessage;

    fn noop() -> Handler { Arc::new(|_: PubSubMessage| async {}.boxed()) }

    #[test]
    fn first_and_last_handlers_are_reported() {
        let registry = SubscriptionRegistry::default();
        let news = Channel::literal("news");
        let (a, first_a) = registry.add(news.clone(), noop());
        let (b, first_b) = registry.add(news.clone(), noop());
        assert!(first_a);
        assert!(!first_b);
        assert_eq!(registry.handlers(&news).map(|h| h.len()), Some(2));

        assert_eq!(registry.remove(a), Some((news.clone(), false)));
        assert_eq!(registry.remove(b), Some((news.clone(), true)));
        assert!(registry.handlers(&news).is_none());
        assert_eq!(registry.remove(b), None);
    }

    #[test]
    fn snapshots_survive_removal() {
        let registry = SubscriptionRegistry::default();
        let news = Channel::literal("news");
        let (id, _) = registry.add(news.clone(), noop());
        let snapshot = registry.handlers(&news).expect("handlers");
        registry.remove(id);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, id);
    }

    #[test]
    fn replay_follows_first_registration() {
        let registry = SubscriptionRegistry::default();
        registry.add(Channel::literal("b"), noop());
        let (a, _) = registry.add(Channel::pattern("a*"), noop());
        registry.add(Channel::literal("c"), noop());
        registry.add(Channel::literal("b"), noop());
        registry.remove(a);
        registry.add(Channel::pattern("a*"), noop());

        assert_eq!(
            registry.replay_order(),
            vec![
                Channel::literal("b"),
                Channel::literal("c"),
                Channel::pattern("a*"),
            ]
        );
    }
}
