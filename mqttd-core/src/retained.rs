//! Retained message store
//!
//! One message per exact topic name. The broker holds the store lock across
//! a retained update and its fan-out, and across a subscription insert and
//! its retained lookup, so a subscriber racing a retained publish sees that
//! message exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::message::Message;
use crate::topics::topic_matches;

#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: Mutex<HashMap<String, Arc<Message>>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> RetainedGuard<'_> {
        RetainedGuard {
            messages: self.messages.lock(),
        }
    }

    /// Stored entries, expired ones included until they are swept
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry, returning how many were removed
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|_, message| !message.is_expired(now));
        before - messages.len()
    }
}

pub struct RetainedGuard<'a> {
    messages: MutexGuard<'a, HashMap<String, Arc<Message>>>,
}

impl RetainedGuard<'_> {
    /// Stores `message` for its topic, or deletes the entry when the payload is empty
    pub fn apply(&mut self, message: &Arc<Message>) {
        if message.payload.is_empty() {
            self.messages.remove(&message.topic);
        } else {
            self.messages.insert(message.topic.clone(), Arc::clone(message));
        }
    }

    /// Live messages whose topic matches `filter`, ordered by topic
    pub fn matching(&mut self, filter: &str, now: Instant) -> Vec<Arc<Message>> {
        self.messages.retain(|_, message| !message.is_expired(now));
        let mut found: Vec<_> = self
            .messages
            .iter()
            .filter(|(topic, _)| topic_matches(topic, filter))
            .map(|(_, message)| Arc::clone(message))
            .collect();
        found.sort_by(|a, b| a.topic.cmp(&b.topic));
        found
    }
}
