//! Subscription bookkeeping
//!
//! Reference-counts interest in definitions. The first activation of a
//! definition subscribes its whole dependency closure with the definition's
//! own id as subscriber; losing the last subscription releases those
//! cascaded entries again.

use std::collections::HashSet;

use crate::definition::Definition;
use crate::resolver::flatten_dependencies;
use crate::types::{DefinitionId, Subscription};

/// Ordered list of subscriptions
#[derive(Debug, Clone, Default)]
pub struct SubscriptionManager {
    entries: Vec<Subscription>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `(subscriber_id, definition)`
    ///
    /// Returns `true` when this was the definition's first activation, in
    /// which case its dependency closure was subscribed as well.
    pub fn subscribe(&mut self, subscriber_id: &str, definition: &Definition) -> bool {
        let first_activation = !self
            .entries
            .iter()
            .any(|sub| sub.subscriber_id == definition.id());

        self.entries
            .push(Subscription::new(subscriber_id, definition.id()));

        if first_activation {
            for dependency in flatten_dependencies(definition) {
                self.entries
                    .push(Subscription::new(definition.id(), dependency.id()));
            }
        }
        first_activation
    }

    /// Remove `(subscriber_id, definition)` and cascade releases
    ///
    /// Every definition left without subscriptions drops the entries it
    /// holds as subscriber, recursively. Returns the released definition ids;
    /// an unknown pair releases nothing.
    pub fn unsubscribe(&mut self, subscriber_id: &str, definition: &Definition) -> Vec<DefinitionId> {
        let before = self.entries.len();
        self.entries.retain(|sub| {
            !(sub.subscriber_id == subscriber_id && sub.definition_id == definition.id())
        });
        if self.entries.len() == before {
            return Vec::new();
        }

        let mut released = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = vec![definition.id().to_string()];

        while let Some(id) = pending.pop() {
            if self.is_active(&id) || !seen.insert(id.clone()) {
                continue;
            }
            let mut held = Vec::new();
            self.entries.retain(|sub| {
                if sub.subscriber_id == id {
                    held.push(sub.definition_id.clone());
                    false
                } else {
                    true
                }
            });
            pending.extend(held);
            released.push(id);
        }
        released
    }

    /// Whether any subscription targets the definition
    pub fn is_active(&self, definition_id: &str) -> bool {
        self.entries.iter().any(|sub| sub.definition_id == definition_id)
    }

    /// Number of subscriptions targeting the definition
    pub fn count(&self, definition_id: &str) -> usize {
        self.entries
            .iter()
            .filter(|sub| sub.definition_id == definition_id)
            .count()
    }

    pub fn entries(&self) -> &[Subscription] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
