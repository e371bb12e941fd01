//! Readiness fan-out.
//!
//! One [`ReadinessBroadcaster`] per manager. Every subscriber sees the
//! last published value first, then each later change.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// How a preview address was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    /// Reported by the sandbox when its server accepted connections.
    Confirmed,
    /// Assumed after the readiness deadline elapsed without a report.
    Fallback,
}

/// A reachable (or presumed reachable) preview address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewAddress {
    pub url: String,
    pub port: Option<u16>,
    pub kind: AddressKind,
}

impl PreviewAddress {
    /// Address from a genuine readiness signal.
    pub fn confirmed(url: impl Into<String>, port: u16) -> Self {
        Self {
            url: url.into(),
            port: Some(port),
            kind: AddressKind::Confirmed,
        }
    }

    /// Address assumed after the deadline.
    pub fn fallback(url: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            url: url.into(),
            port,
            kind: AddressKind::Fallback,
        }
    }

    /// Whether the address came from a genuine signal.
    pub fn is_confirmed(&self) -> bool {
        self.kind == AddressKind::Confirmed
    }
}

/// A published address, tagged with the sandbox generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessEvent {
    pub address: PreviewAddress,
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
}

impl ReadinessEvent {
    /// Stamp an address with the current time.
    pub fn new(address: PreviewAddress, generation: u64) -> Self {
        Self {
            address,
            generation,
            timestamp: Utc::now(),
        }
    }
}

/// The value observers track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Readiness {
    /// No address for this generation yet.
    Pending { generation: u64 },
    /// An address is available.
    Ready(ReadinessEvent),
    /// Boot failed for this generation.
    Failed { generation: u64, error: String },
}

impl Readiness {
    /// Generation this value belongs to.
    pub fn generation(&self) -> u64 {
        match self {
            Self::Pending { generation } | Self::Failed { generation, .. } => *generation,
            Self::Ready(event) => event.generation,
        }
    }

    /// The address, if ready.
    pub fn address(&self) -> Option<&PreviewAddress> {
        match self {
            Self::Ready(event) => Some(&event.address),
            _ => None,
        }
    }
}

/// Publish/subscribe channel for readiness changes.
#[derive(Debug, Clone)]
pub struct ReadinessBroadcaster {
    tx: Arc<watch::Sender<Readiness>>,
}

impl Default for ReadinessBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessBroadcaster {
    /// Create a broadcaster holding `Pending` for generation 0.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Readiness::Pending { generation: 0 });
        Self { tx: Arc::new(tx) }
    }

    /// Publish a change to every subscriber.
    ///
    /// Values from a generation older than the current one are dropped.
    /// Returns whether the value was accepted.
    pub fn publish(&self, value: Readiness) -> bool {
        let accepted = self.tx.send_if_modified(|current| {
            if value.generation() < current.generation() {
                return false;
            }
            *current = value.clone();
            true
        });
        if accepted {
            tracing::debug!(generation = value.generation(), "Readiness published");
        } else {
            tracing::debug!(
                generation = value.generation(),
                "Dropping readiness from superseded generation"
            );
        }
        accepted
    }

    /// Last published value.
    pub fn current(&self) -> Readiness {
        self.tx.borrow().clone()
    }

    /// Attach a subscriber. Its first `next()` replays the current value.
    pub fn subscribe(&self) -> ReadinessSubscriber {
        let mut rx = self.tx.subscribe();
        rx.mark_changed();
        ReadinessSubscriber { rx }
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One observer of a [`ReadinessBroadcaster`].
#[derive(Debug)]
pub struct ReadinessSubscriber {
    rx: watch::Receiver<Readiness>,
}

impl ReadinessSubscriber {
    /// Wait for the next value. Returns `None` once the broadcaster is gone.
    ///
    /// Intermediate values published between two calls are coalesced; the
    /// subscriber always sees the latest.
    pub async fn next(&mut self) -> Option<Readiness> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Latest value without waiting.
    pub fn current(&self) -> Readiness {
        self.rx.borrow().clone()
    }

    /// Wait until an address is available.
    pub async fn wait_for_address(&mut self) -> Option<ReadinessEvent> {
        loop {
            if let Readiness::Ready(event) = self.next().await? {
                return Some(event);
            }
        }
    }

    /// Convert into a stream of values, starting with the replay.
    pub fn into_stream(self) -> impl Stream<Item = Readiness> + Send + 'static {
        stream::unfold(self, |mut subscriber| async move {
            let value = subscriber.next().await?;
            Some((value, subscriber))
        })
    }
}
