//! Publish/subscribe over three delivery tiers.
//!
//! Tiers are tried in [`TransportKind`] order: broadcast channel, direct
//! window messaging, storage polling. A tier that errors synchronously hands
//! the message to the next one. Delivery is at-most-once on every tier.

use super::error::TransportError;
use crate::dataflow::{Listeners, Subscription};
use shared::TimingSection;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Broadcast,
    Window,
    Storage,
}

/// One delivery mechanism. Arriving envelopes are queued by the backend and
/// handed over by `drain` on the next sync tick.
pub trait Transport {
    fn kind(&self) -> TransportKind;

    fn is_open(&self) -> bool;

    fn publish(&mut self, raw: &str, now_ms: i64) -> Result<(), TransportError>;

    fn drain(&mut self, now_ms: i64) -> Vec<String>;

    fn reopen(&mut self) -> Result<(), TransportError> {
        Err(TransportError::Unavailable(self.kind()))
    }

    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay_ms: i64,
    pub max_attempts: u32,
}

impl From<&TimingSection> for ReconnectPolicy {
    fn from(timing: &TimingSection) -> Self {
        Self {
            delay_ms: timing.reconnect_delay_ms as i64,
            max_attempts: timing.max_reconnect_attempts,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&TimingSection::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryStatus {
    /// No broadcast tier was ever attached (host lacks the primitive).
    Absent,
    Open,
    Waiting { attempt: u32, retry_at_ms: i64 },
    /// Reconnect budget spent; fallback tiers only for the rest of the session.
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    PrimaryLost { retry_at_ms: i64 },
    ReconnectFailed { attempt: u32, retry_at_ms: i64 },
    Reconnected,
    PrimaryRetired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub kind: TransportKind,
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub published: BTreeMap<TransportKind, u64>,
    pub received: BTreeMap<TransportKind, u64>,
    pub fallthroughs: u64,
    pub dropped: u64,
}

pub struct SyncTransport {
    tiers: Vec<Box<dyn Transport>>,
    policy: ReconnectPolicy,
    primary: PrimaryStatus,
    attempts_made: u32,
    listeners: Listeners<Incoming>,
    stats: TransportStats,
}

impl SyncTransport {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            tiers: Vec::new(),
            policy,
            primary: PrimaryStatus::Absent,
            attempts_made: 0,
            listeners: Listeners::new(),
            stats: TransportStats::default(),
        }
    }

    pub fn with_tier(mut self, tier: Box<dyn Transport>) -> Self {
        self.attach(tier);
        self
    }

    /// Add a tier, replacing any tier of the same kind. A popup handle
    /// acquired after startup arrives this way.
    pub fn attach(&mut self, tier: Box<dyn Transport>) {
        let kind = tier.kind();
        if let Some(mut previous) = self.detach(kind) {
            previous.close();
        }
        if kind == TransportKind::Broadcast && self.primary != PrimaryStatus::Retired {
            self.primary = if tier.is_open() {
                PrimaryStatus::Open
            } else {
                PrimaryStatus::Absent
            };
        }
        self.tiers.push(tier);
        self.tiers.sort_by_key(|tier| tier.kind());
    }

    pub fn detach(&mut self, kind: TransportKind) -> Option<Box<dyn Transport>> {
        let index = self.tiers.iter().position(|tier| tier.kind() == kind)?;
        Some(self.tiers.remove(index))
    }

    pub fn has_tier(&self, kind: TransportKind) -> bool {
        self.tiers.iter().any(|tier| tier.kind() == kind)
    }

    pub fn primary_status(&self) -> PrimaryStatus {
        self.primary
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts_made
    }

    /// Primary is gone for good or never existed.
    pub fn is_degraded(&self) -> bool {
        matches!(self.primary, PrimaryStatus::Retired | PrimaryStatus::Absent)
    }

    /// The tier the next publish would try first.
    pub fn active_kind(&self) -> Option<TransportKind> {
        self.tiers
            .iter()
            .find(|tier| self.is_usable(tier.as_ref()))
            .map(|tier| tier.kind())
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    fn is_usable(&self, tier: &dyn Transport) -> bool {
        if tier.kind() == TransportKind::Broadcast && self.primary != PrimaryStatus::Open {
            return false;
        }
        tier.is_open()
    }

    pub fn publish(&mut self, raw: &str, now_ms: i64) -> Result<TransportKind, TransportError> {
        let mut primary_failed = false;
        let mut delivered = None;
        let mut last_error = None;

        for index in 0..self.tiers.len() {
            let kind = self.tiers[index].kind();
            if kind == TransportKind::Broadcast && self.primary != PrimaryStatus::Open {
                continue;
            }
            let tier = &mut self.tiers[index];
            if !tier.is_open() {
                // Closed underneath us since the last maintain.
                primary_failed |= kind == TransportKind::Broadcast;
                continue;
            }
            match tier.publish(raw, now_ms) {
                Ok(()) => {
                    delivered = Some(kind);
                    break;
                }
                Err(error) => {
                    log::debug!("{:?} publish failed, falling through: {}", kind, error);
                    self.stats.fallthroughs += 1;
                    if kind == TransportKind::Broadcast {
                        primary_failed = true;
                    }
                    last_error = Some(error);
                }
            }
        }

        if primary_failed {
            self.schedule_reconnect(now_ms);
        }

        match delivered {
            Some(kind) => {
                *self.stats.published.entry(kind).or_default() += 1;
                Ok(kind)
            }
            None => {
                self.stats.dropped += 1;
                let error = last_error.unwrap_or(TransportError::Exhausted);
                log::warn!("Dropping outgoing message: {}", error);
                Err(error)
            }
        }
    }

    /// Collect everything that arrived on any tier since the last pump and
    /// hand it to raw subscribers. The caller gets the same list back.
    pub fn pump(&mut self, now_ms: i64) -> Vec<Incoming> {
        let mut incoming = Vec::new();
        for tier in self.tiers.iter_mut() {
            let kind = tier.kind();
            for raw in tier.drain(now_ms) {
                *self.stats.received.entry(kind).or_default() += 1;
                incoming.push(Incoming { kind, raw });
            }
        }
        for message in &incoming {
            self.listeners.emit(message);
        }
        incoming
    }

    pub fn subscribe(&self, listener: impl Fn(&Incoming) + 'static) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Drive the reconnect policy. Call once per sync tick.
    pub fn maintain(&mut self, now_ms: i64) -> Option<TransportEvent> {
        let index = self
            .tiers
            .iter()
            .position(|tier| tier.kind() == TransportKind::Broadcast)?;

        match self.primary {
            PrimaryStatus::Open => {
                if self.tiers[index].is_open() {
                    None
                } else {
                    self.schedule_reconnect(now_ms)
                }
            }
            PrimaryStatus::Waiting {
                attempt,
                retry_at_ms,
            } if now_ms >= retry_at_ms => {
                self.attempts_made = attempt;
                let result = self.tiers[index].reopen();
                if result.is_ok() && self.tiers[index].is_open() {
                    log::info!("Broadcast channel reconnected after {} attempt(s)", attempt);
                    self.attempts_made = 0;
                    self.primary = PrimaryStatus::Open;
                    return Some(TransportEvent::Reconnected);
                }
                if let Err(error) = result {
                    log::debug!("Reconnect attempt {} failed: {}", attempt, error);
                }
                if attempt >= self.policy.max_attempts {
                    Some(self.retire_primary(index))
                } else {
                    let retry_at_ms = now_ms + self.policy.delay_ms;
                    self.primary = PrimaryStatus::Waiting {
                        attempt: attempt + 1,
                        retry_at_ms,
                    };
                    Some(TransportEvent::ReconnectFailed {
                        attempt,
                        retry_at_ms,
                    })
                }
            }
            PrimaryStatus::Waiting { .. } | PrimaryStatus::Retired | PrimaryStatus::Absent => None,
        }
    }

    /// Heartbeat timeout: treat the primary as broken and start reconnecting.
    pub fn mark_primary_failed(&mut self, now_ms: i64) -> Option<TransportEvent> {
        if self.primary != PrimaryStatus::Open {
            return None;
        }
        if let Some(tier) = self
            .tiers
            .iter_mut()
            .find(|tier| tier.kind() == TransportKind::Broadcast)
        {
            tier.close();
        }
        self.schedule_reconnect(now_ms)
    }

    fn schedule_reconnect(&mut self, now_ms: i64) -> Option<TransportEvent> {
        if self.primary != PrimaryStatus::Open {
            return None;
        }
        if self.policy.max_attempts == 0 {
            let index = self
                .tiers
                .iter()
                .position(|tier| tier.kind() == TransportKind::Broadcast)?;
            return Some(self.retire_primary(index));
        }
        let retry_at_ms = now_ms + self.policy.delay_ms;
        log::info!("Broadcast channel lost, retrying at {}", retry_at_ms);
        self.primary = PrimaryStatus::Waiting {
            attempt: 1,
            retry_at_ms,
        };
        Some(TransportEvent::PrimaryLost { retry_at_ms })
    }

    fn retire_primary(&mut self, index: usize) -> TransportEvent {
        log::warn!(
            "Broadcast channel retired after {} attempt(s); continuing on fallback tiers",
            self.attempts_made
        );
        self.tiers[index].close();
        self.primary = PrimaryStatus::Retired;
        TransportEvent::PrimaryRetired
    }

    pub fn close(&mut self) {
        for tier in self.tiers.iter_mut() {
            tier.close();
        }
        self.listeners.clear();
    }
}
