//! Connection bookkeeping and heartbeat liveness.

use super::transport::TransportKind;
use shared::TimingSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
}

/// Best-effort indicator for the UI. Controls never wait on it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub last_heartbeat_at: Option<i64>,
    pub reconnect_attempts: u32,
    pub is_reconnecting: bool,
    /// The primary is gone for the rest of the session.
    pub is_degraded: bool,
    pub active_transport: Option<TransportKind>,
}

impl ConnectionState {
    pub fn status(&self) -> ConnectionStatus {
        if self.is_reconnecting {
            ConnectionStatus::Reconnecting
        } else if self.is_connected {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    pub fn set_status(&mut self, status: ConnectionStatus) {
        self.is_connected = status == ConnectionStatus::Connected;
        self.is_reconnecting = status == ConnectionStatus::Reconnecting;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    SendPing { nonce: u64 },
    /// A peer had been heard from and then went quiet for longer than the timeout.
    TimedOut,
}

/// PING scheduler and liveness clock.
///
/// Any message from a peer counts as proof of life, not only PONG. The
/// timeout only applies once a peer has been heard from, so a main window
/// with no mirror open never declares its channel dead.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval_ms: i64,
    timeout_ms: i64,
    next_ping_at: i64,
    nonce: u64,
    last_peer_at: Option<i64>,
}

impl Heartbeat {
    pub fn new(timing: &TimingSection, now_ms: i64) -> Self {
        Self {
            interval_ms: timing.heartbeat_interval_ms as i64,
            timeout_ms: timing.heartbeat_timeout_ms as i64,
            next_ping_at: now_ms,
            nonce: 0,
            last_peer_at: None,
        }
    }

    pub fn record_peer(&mut self, now_ms: i64) {
        self.last_peer_at = Some(self.last_peer_at.map_or(now_ms, |last| last.max(now_ms)));
    }

    pub fn last_peer_at(&self) -> Option<i64> {
        self.last_peer_at
    }

    pub fn peer_seen(&self) -> bool {
        self.last_peer_at.is_some()
    }

    pub fn poll(&mut self, now_ms: i64) -> HeartbeatAction {
        if let Some(last) = self.last_peer_at {
            if now_ms - last > self.timeout_ms {
                self.last_peer_at = None;
                return HeartbeatAction::TimedOut;
            }
        }
        if now_ms >= self.next_ping_at {
            self.nonce += 1;
            self.next_ping_at = now_ms + self.interval_ms;
            return HeartbeatAction::SendPing { nonce: self.nonce };
        }
        HeartbeatAction::Idle
    }
}
