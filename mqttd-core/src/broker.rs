//! Broker core
//!
//! Shared state behind every session: the subscription trie, the retained
//! store, the session registry and the connection accounting. All operations
//! take `&self` and never await; fan-out pushes into each target session's
//! unbounded mailbox.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::limits::{ConnectionPermit, Limits};
use crate::message::{Delivery, Message};
use crate::metrics::{Counters, Health, MetricsSnapshot};
use crate::protocol::packets::{RetainHandling, SubscriptionOptions};
use crate::protocol::QoS;
use crate::retained::RetainedStore;
use crate::topics::{validate_topic_filter, validate_topic_name};
use crate::trie::{SubscriberEntry, TopicTrie};
use crate::SessionId;

/// Events the broker pushes into a session's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Deliver(Delivery),
    /// Another connection registered the same client identifier
    Evicted,
    /// The broker is shutting down
    Shutdown,
}

pub type Mailbox = mpsc::UnboundedReceiver<Outbound>;
pub type MailboxSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug)]
struct SessionHandle {
    client_id: String,
    sender: MailboxSender,
    filters: HashSet<String>,
}

/// Result of a successful subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribed {
    pub granted: QoS,
    /// Retained messages to send right after the SUBACK
    pub retained: Vec<Delivery>,
}

pub struct Broker {
    config: BrokerConfig,
    trie: TopicTrie<SessionId>,
    retained: RetainedStore,
    sessions: DashMap<SessionId, SessionHandle>,
    client_ids: DashMap<String, SessionId>,
    limits: Arc<Limits>,
    counters: Counters,
    accepting: AtomicBool,
    next_session_id: AtomicU64,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let limits = Arc::new(Limits::new(&config));
        Self {
            config,
            trie: TopicTrie::new(),
            retained: RetainedStore::new(),
            sessions: DashMap::new(),
            client_ids: DashMap::new(),
            limits,
            counters: Counters::default(),
            accepting: AtomicBool::new(true),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Admission control, run before any byte of CONNECT is read
    pub fn admit(&self, ip: IpAddr) -> Result<ConnectionPermit, BrokerError> {
        if !self.is_accepting() {
            return Err(BrokerError::NotAccepting);
        }
        let permit = self.limits.admit(ip)?;
        self.counters.connection_opened();
        Ok(permit)
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Makes `session` reachable under `client_id`. A live session already
    /// holding that identifier is told to go away; its id is returned.
    pub fn register_session(&self, session: SessionId, client_id: &str, sender: MailboxSender) -> Option<SessionId> {
        self.sessions.insert(
            session,
            SessionHandle {
                client_id: client_id.to_owned(),
                sender,
                filters: HashSet::new(),
            },
        );

        let previous = self
            .client_ids
            .insert(client_id.to_owned(), session)
            .filter(|previous| *previous != session)?;

        log::info!(
            "Session {}: client id {:?} taken over by session {}",
            previous,
            client_id,
            session
        );
        if let Some(handle) = self.sessions.get(&previous) {
            let _ = handle.sender.send(Outbound::Evicted);
        }
        Some(previous)
    }

    /// Drops the session and every subscription it holds
    pub fn remove_session(&self, session: SessionId) {
        let Some((_, handle)) = self.sessions.remove(&session) else {
            return;
        };
        self.client_ids
            .remove_if(&handle.client_id, |_, owner| *owner == session);
        for filter in &handle.filters {
            self.trie.remove(filter, &session);
        }
        log::debug!(
            "Session {}: removed with {} subscriptions",
            session,
            handle.filters.len()
        );
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Registers a subscription and collects the retained messages it should
    /// receive. The retained lock spans both steps.
    pub fn subscribe(
        &self,
        session: SessionId,
        filter: &str,
        options: SubscriptionOptions,
        identifier: Option<u32>,
        now: Instant,
    ) -> Result<Subscribed, BrokerError> {
        validate_topic_filter(filter)?;
        self.limits.check_subscribe()?;

        let granted = options.qos.downgrade(self.config.max_qos);
        let entry = SubscriberEntry::new(SubscriptionOptions { qos: granted, ..options }, identifier);

        let mut retained = self.retained.lock();
        let previous = self.trie.insert(filter, session, entry);
        if let Some(mut handle) = self.sessions.get_mut(&session) {
            handle.filters.insert(filter.to_owned());
        }

        let send_retained = self.config.retained_enabled
            && match options.retain_handling {
                RetainHandling::SendOnSubscribe => true,
                RetainHandling::SendIfNewSubscription => previous.is_none(),
                RetainHandling::DoNotSend => false,
            };
        let deliveries = if send_retained {
            retained
                .matching(filter, now)
                .into_iter()
                .map(|message| Delivery {
                    qos: message.qos.downgrade(granted),
                    retain: true,
                    subscription_identifiers: identifier.into_iter().collect(),
                    message,
                })
                .collect()
        } else {
            Vec::new()
        };
        drop(retained);

        log::debug!(
            "Session {}: subscribed to {} at {:?}, {} retained",
            session,
            filter,
            granted,
            deliveries.len()
        );
        Ok(Subscribed {
            granted,
            retained: deliveries,
        })
    }

    /// Removes one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, session: SessionId, filter: &str) -> Result<bool, BrokerError> {
        validate_topic_filter(filter)?;
        let existed = self.trie.remove(filter, &session).is_some();
        if let Some(mut handle) = self.sessions.get_mut(&session) {
            handle.filters.remove(filter);
        }
        Ok(existed)
    }

    /// Publishes a client message, charged against the global message bucket.
    /// Returns every session the message was routed to with its delivered QoS.
    pub fn publish(&self, message: Message) -> Result<Vec<(SessionId, QoS)>, BrokerError> {
        validate_topic_name(&message.topic)?;
        self.limits.check_publish()?;
        Ok(self.dispatch(message))
    }

    /// Routes a broker-originated message such as a will, bypassing rate limits
    pub fn dispatch(&self, message: Message) -> Vec<(SessionId, QoS)> {
        self.counters.message_published();
        let message = Arc::new(message);

        if message.retain && self.config.retained_enabled {
            let mut retained = self.retained.lock();
            retained.apply(&message);
            // fan-out under the lock keeps racing subscribers exactly-once
            let routed = self.fan_out(&message);
            drop(retained);
            routed
        } else {
            self.fan_out(&message)
        }
    }

    fn fan_out(&self, message: &Arc<Message>) -> Vec<(SessionId, QoS)> {
        let mut routed = Vec::new();
        for target in self.trie.find_matching(&message.topic) {
            if target.no_local && message.origin == Some(target.subscriber) {
                continue;
            }
            let qos = message.qos.downgrade(target.qos);
            let delivery = Delivery {
                message: Arc::clone(message),
                qos,
                retain: message.retain && target.retain_as_published,
                subscription_identifiers: target.identifiers,
            };

            let sent = self
                .sessions
                .get(&target.subscriber)
                .is_some_and(|handle| handle.sender.send(Outbound::Deliver(delivery)).is_ok());
            if sent {
                routed.push((target.subscriber, qos));
            } else {
                log::trace!(
                    "Session {}: gone, dropping message on {}",
                    target.subscriber,
                    message.topic
                );
            }
        }
        routed
    }

    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.retained.sweep_expired(now)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            current_connections: self.limits.current_connections() as u64,
            total_messages_published: self.counters.total_messages_published.load(Ordering::Relaxed),
            retained_messages_count: self.retained.len() as u64,
            active_subscriptions_count: self.trie.len() as u64,
        }
    }

    pub fn health(&self) -> Health {
        Health::evaluate(
            self.is_accepting(),
            self.limits.current_connections(),
            self.limits.max_connections(),
        )
    }

    /// Stops admission and tells every live session to wind down
    pub fn begin_shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        log::info!("Broker shutting down, notifying {} sessions", self.sessions.len());
        for handle in self.sessions.iter() {
            let _ = handle.sender.send(Outbound::Shutdown);
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("sessions", &self.sessions.len())
            .field("subscriptions", &self.trie.len())
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}
