//! Sync protocol endpoint for one context.
//!
//! A `SyncSession` turns raw transport traffic into typed [`SessionEvent`]s:
//! it validates envelopes, filters by directory, answers PING, tracks
//! liveness and drives the transport's reconnect policy. Timer semantics
//! live one level up in the service; the session never touches a clock
//! engine.

use super::connection::{ConnectionState, ConnectionStatus, Heartbeat, HeartbeatAction};
use super::envelope::{self, EnvelopeRejection};
use super::transport::{PrimaryStatus, SyncTransport, TransportEvent, TransportKind};
use crate::dataflow::{Listeners, Subscription};
use shared::{
    ContextMode, ControlAction, ControlPayload, HeartbeatPayload, InitPayload, SyncMessage,
    SyncRequestPayload, TimerSnapshot, TimingSection,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Holds the authoritative timer: answers INIT / SYNC_REQUEST, applies CONTROL.
    Owner,
    /// Hydrates from the owner's snapshots and forwards controls to it.
    Mirror,
}

impl SessionRole {
    pub fn mode(self) -> ContextMode {
        match self {
            SessionRole::Owner => ContextMode::Main,
            SessionRole::Mirror => ContextMode::Mirror,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SnapshotRequested { requester: String },
    SnapshotReceived(TimerSnapshot),
    ControlReceived(ControlAction),
    ConnectionChanged(ConnectionStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotJson,
    UnsupportedVersion,
    UnknownType,
    Malformed,
    ForeignDirectory,
    OwnEcho,
}

impl From<&EnvelopeRejection> for DropReason {
    fn from(rejection: &EnvelopeRejection) -> Self {
        match rejection {
            EnvelopeRejection::NotJson(_) => DropReason::NotJson,
            EnvelopeRejection::UnsupportedVersion(_) => DropReason::UnsupportedVersion,
            EnvelopeRejection::UnknownType(_) => DropReason::UnknownType,
            EnvelopeRejection::Malformed { .. } => DropReason::Malformed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDiagnostics {
    pub sent: u64,
    pub send_failures: u64,
    pub accepted: u64,
    pub dropped_not_json: u64,
    pub dropped_version: u64,
    pub dropped_unknown_type: u64,
    pub dropped_malformed: u64,
    pub dropped_foreign_directory: u64,
    pub dropped_own_echo: u64,
    pub heartbeat_timeouts: u64,
}

impl SyncDiagnostics {
    fn record_drop(&mut self, reason: DropReason) {
        let counter = match reason {
            DropReason::NotJson => &mut self.dropped_not_json,
            DropReason::UnsupportedVersion => &mut self.dropped_version,
            DropReason::UnknownType => &mut self.dropped_unknown_type,
            DropReason::Malformed => &mut self.dropped_malformed,
            DropReason::ForeignDirectory => &mut self.dropped_foreign_directory,
            DropReason::OwnEcho => &mut self.dropped_own_echo,
        };
        *counter += 1;
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        match reason {
            DropReason::NotJson => self.dropped_not_json,
            DropReason::UnsupportedVersion => self.dropped_version,
            DropReason::UnknownType => self.dropped_unknown_type,
            DropReason::Malformed => self.dropped_malformed,
            DropReason::ForeignDirectory => self.dropped_foreign_directory,
            DropReason::OwnEcho => self.dropped_own_echo,
        }
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped_not_json
            + self.dropped_version
            + self.dropped_unknown_type
            + self.dropped_malformed
            + self.dropped_foreign_directory
            + self.dropped_own_echo
    }
}

pub struct SyncSession {
    role: SessionRole,
    context_id: String,
    directory_id: Option<String>,
    transport: SyncTransport,
    heartbeat: Heartbeat,
    connection: ConnectionState,
    diagnostics: SyncDiagnostics,
    listeners: Listeners<SessionEvent>,
    pending: Vec<SessionEvent>,
    closed: bool,
}

impl SyncSession {
    pub fn new(
        role: SessionRole,
        context_id: impl Into<String>,
        transport: SyncTransport,
        timing: &TimingSection,
        now_ms: i64,
    ) -> Self {
        let mut session = Self {
            role,
            context_id: context_id.into(),
            directory_id: None,
            transport,
            heartbeat: Heartbeat::new(timing, now_ms),
            connection: ConnectionState::default(),
            diagnostics: SyncDiagnostics::default(),
            listeners: Listeners::new(),
            pending: Vec::new(),
            closed: false,
        };
        session.refresh_transport_state();
        let initial = if session.connection.active_transport.is_some() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };
        session.connection.set_status(initial);
        session
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn directory_id(&self) -> Option<&str> {
        self.directory_id.as_deref()
    }

    /// Scope the session to one directory. Empty clears the filter.
    pub fn bind_directory(&mut self, directory_id: &str) {
        self.directory_id = Some(directory_id.to_string()).filter(|id| !id.is_empty());
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn diagnostics(&self) -> &SyncDiagnostics {
        &self.diagnostics
    }

    pub fn transport(&self) -> &SyncTransport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut SyncTransport {
        &mut self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn subscribe(&self, listener: impl Fn(&SessionEvent) + 'static) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Fire-and-forget. Returns the tier that took the message.
    pub fn send(&mut self, message: SyncMessage, now_ms: i64) -> Option<TransportKind> {
        if self.closed {
            return None;
        }
        let raw = match envelope::encode(&message, Some(&self.context_id)) {
            Ok(raw) => raw,
            Err(error) => {
                log::warn!("Failed to encode {}: {}", message.kind(), error);
                self.diagnostics.send_failures += 1;
                return None;
            }
        };

        let primary_before = self.transport.primary_status();
        let delivered = match self.transport.publish(&raw, now_ms) {
            Ok(kind) => {
                self.diagnostics.sent += 1;
                Some(kind)
            }
            Err(_) => {
                self.diagnostics.send_failures += 1;
                None
            }
        };
        // A failing primary schedules its own reconnect inside `publish`.
        if primary_before == PrimaryStatus::Open
            && self.transport.primary_status() != PrimaryStatus::Open
        {
            self.set_status(ConnectionStatus::Reconnecting);
        }
        self.refresh_transport_state();
        delivered
    }

    /// INIT: announce presence and ask the owner for full state.
    pub fn announce(&mut self, now_ms: i64) -> Option<TransportKind> {
        let message = SyncMessage::Init(InitPayload {
            directory_id: self.directory_id.clone(),
            context_id: self.context_id.clone(),
            mode: self.role.mode(),
        });
        self.send(message, now_ms)
    }

    pub fn request_sync(&mut self, now_ms: i64) -> Option<TransportKind> {
        let message = SyncMessage::SyncRequest(SyncRequestPayload {
            directory_id: self.directory_id.clone(),
            context_id: self.context_id.clone(),
        });
        self.send(message, now_ms)
    }

    pub fn send_snapshot(&mut self, snapshot: TimerSnapshot, now_ms: i64) -> Option<TransportKind> {
        self.send(SyncMessage::SyncResponse(snapshot), now_ms)
    }

    pub fn send_control(&mut self, action: ControlAction, now_ms: i64) -> Option<TransportKind> {
        let message = SyncMessage::Control(ControlPayload {
            directory_id: self.directory_id.clone(),
            action,
        });
        self.send(message, now_ms)
    }

    /// One sync tick: reconnect policy, everything that arrived since the
    /// last tick, then the heartbeat. Events are also emitted to subscribers.
    ///
    /// Connection changes caused by a `send` between ticks are reported by
    /// the next poll.
    pub fn poll(&mut self, now_ms: i64) -> Vec<SessionEvent> {
        if self.closed {
            return Vec::new();
        }

        if let Some(event) = self.transport.maintain(now_ms) {
            self.apply_transport_event(event);
        }

        // Read the inbox first: a peer's queued messages prove it alive even
        // when this context was throttled past the timeout.
        for incoming in self.transport.pump(now_ms) {
            if let Some(event) = self.accept(&incoming.raw, now_ms) {
                self.pending.push(event);
            }
        }

        match self.heartbeat.poll(now_ms) {
            HeartbeatAction::SendPing { nonce } => {
                let ping = SyncMessage::Ping(HeartbeatPayload {
                    directory_id: self.directory_id.clone(),
                    context_id: self.context_id.clone(),
                    nonce,
                    reply_to: None,
                });
                self.send(ping, now_ms);
            }
            HeartbeatAction::TimedOut => {
                log::info!("Heartbeat timed out for context {}", self.context_id);
                self.diagnostics.heartbeat_timeouts += 1;
                self.set_status(ConnectionStatus::Disconnected);
                if let Some(event) = self.transport.mark_primary_failed(now_ms) {
                    self.apply_transport_event(event);
                }
            }
            HeartbeatAction::Idle => {}
        }

        self.refresh_transport_state();
        let events = std::mem::take(&mut self.pending);
        for event in &events {
            self.listeners.emit(event);
        }
        events
    }

    /// Validate and classify one raw envelope. Replies to PING directly.
    pub fn accept(&mut self, raw: &str, now_ms: i64) -> Option<SessionEvent> {
        let envelope = match envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(rejection) => {
                log::debug!("Dropping envelope: {}", rejection);
                self.diagnostics.record_drop(DropReason::from(&rejection));
                return None;
            }
        };

        if envelope.source.as_deref() == Some(self.context_id.as_str()) {
            self.diagnostics.record_drop(DropReason::OwnEcho);
            return None;
        }
        if let (Some(bound), Some(incoming)) =
            (self.directory_id.as_deref(), envelope.message.directory_id())
        {
            if bound != incoming {
                log::debug!(
                    "Dropping {} for directory {} (bound to {})",
                    envelope.message.kind(),
                    incoming,
                    bound
                );
                self.diagnostics.record_drop(DropReason::ForeignDirectory);
                return None;
            }
        }

        self.diagnostics.accepted += 1;
        self.heartbeat.record_peer(now_ms);
        self.connection.last_heartbeat_at = self.heartbeat.last_peer_at();
        if self.connection.status() == ConnectionStatus::Disconnected {
            self.set_status(ConnectionStatus::Connected);
        }

        match envelope.message {
            SyncMessage::Ping(ping) => {
                let pong = SyncMessage::Pong(HeartbeatPayload {
                    directory_id: self.directory_id.clone(),
                    context_id: self.context_id.clone(),
                    nonce: ping.nonce,
                    reply_to: Some(ping.context_id),
                });
                self.send(pong, now_ms);
                None
            }
            SyncMessage::Pong(_) => None,
            SyncMessage::Init(InitPayload { context_id, .. })
            | SyncMessage::SyncRequest(SyncRequestPayload { context_id, .. }) => match self.role {
                SessionRole::Owner => Some(SessionEvent::SnapshotRequested {
                    requester: context_id,
                }),
                SessionRole::Mirror => None,
            },
            SyncMessage::SyncResponse(snapshot) => Some(SessionEvent::SnapshotReceived(snapshot)),
            SyncMessage::Control(payload) => match self.role {
                SessionRole::Owner => Some(SessionEvent::ControlReceived(payload.action)),
                SessionRole::Mirror => None,
            },
        }
    }

    fn apply_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PrimaryLost { .. } | TransportEvent::ReconnectFailed { .. } => {
                self.set_status(ConnectionStatus::Reconnecting);
            }
            TransportEvent::Reconnected => self.set_status(ConnectionStatus::Connected),
            TransportEvent::PrimaryRetired => self.set_status(ConnectionStatus::Disconnected),
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        let previous = self.connection.status();
        if previous == status {
            return;
        }
        log::info!("Connection {:?} -> {:?} ({})", previous, status, self.context_id);
        self.connection.set_status(status);
        self.pending.push(SessionEvent::ConnectionChanged(status));
    }

    fn refresh_transport_state(&mut self) {
        self.connection.reconnect_attempts = self.transport.reconnect_attempts();
        self.connection.is_degraded = self.transport.is_degraded();
        self.connection.active_transport = self.transport.active_kind();
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.transport.close();
        self.listeners.clear();
        self.pending.clear();
        self.connection.set_status(ConnectionStatus::Disconnected);
        self.connection.active_transport = None;
        self.closed = true;
    }
}
