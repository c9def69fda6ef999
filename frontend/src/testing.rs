//! Multi-context harness over the in-memory hub.
//!
//! Every context built from one [`Harness`] shares a simulated origin (one
//! broadcast channel namespace, one storage area) and a manual clock. The
//! scenario tests below and `timer-sim` both drive contexts through it.

use crate::service::{MirrorHandles, OwnerHandles, ServiceOptions, TimerService};
use crate::sync::{MemoryHub, ReconnectPolicy, StorageTransport, SyncTransport, TimerStore};
use crate::time_types::{ManualTimeSource, SkewedTimeSource, TimeSource};
use shared::{Stage, SyncConfig};
use std::rc::Rc;

pub struct Harness {
    pub hub: MemoryHub,
    pub clock: ManualTimeSource,
    pub config: SyncConfig,
}

impl Harness {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            hub: MemoryHub::new(),
            clock: ManualTimeSource::starting_at(0),
            config,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn advance(&self, delta_ms: i64) {
        self.clock.advance(delta_ms);
    }

    pub fn store(&self) -> TimerStore {
        TimerStore::new(self.hub.storage(), self.config.channel.state_key.as_str())
    }

    pub fn context<'a>(&'a self, context_id: &'a str) -> ContextBuilder<'a> {
        ContextBuilder {
            harness: self,
            context_id,
            directory_id: "session-1",
            stages: Vec::new(),
            skew_ms: 0,
            window: None,
        }
    }

    fn transport(
        &self,
        context_id: &str,
        window: Option<(&str, &str)>,
        now_ms: i64,
    ) -> SyncTransport {
        let timing = &self.config.timing;
        let mut transport = SyncTransport::new(ReconnectPolicy::from(timing));
        match self.hub.open_broadcast(&self.config.channel.broadcast_name) {
            Ok(broadcast) => transport.attach(Box::new(broadcast)),
            Err(error) => log::debug!("{} starts without broadcast: {}", context_id, error),
        }
        if let Some((own, peer)) = window {
            transport.attach(Box::new(self.hub.window_endpoint(own, peer)));
        }
        transport.attach(Box::new(StorageTransport::new(
            self.hub.storage(),
            self.config.channel.storage_prefix.as_str(),
            context_id,
            timing,
            now_ms,
        )));
        transport
    }
}

pub struct ContextBuilder<'a> {
    harness: &'a Harness,
    context_id: &'a str,
    directory_id: &'a str,
    stages: Vec<Stage>,
    skew_ms: i64,
    window: Option<(&'a str, &'a str)>,
}

impl<'a> ContextBuilder<'a> {
    pub fn directory(mut self, directory_id: &'a str) -> Self {
        self.directory_id = directory_id;
        self
    }

    pub fn stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    /// Offset this context's monotonic clock from the harness clock.
    pub fn skew(mut self, skew_ms: i64) -> Self {
        self.skew_ms = skew_ms;
        self
    }

    /// Register window `own` holding a handle to window `peer`.
    pub fn window(mut self, own: &'a str, peer: &'a str) -> Self {
        self.window = Some((own, peer));
        self
    }

    fn parts(self) -> (ServiceOptions, SyncTransport, TimerStore, Rc<dyn TimeSource>) {
        let harness = self.harness;
        let clock: Rc<dyn TimeSource> =
            Rc::new(SkewedTimeSource::new(harness.clock.clone(), self.skew_ms));
        let options = ServiceOptions::new(self.directory_id)
            .with_context_id(self.context_id)
            .with_stages(self.stages)
            .with_timing(harness.config.timing.clone());
        let transport = harness.transport(self.context_id, self.window, clock.now_ms());
        (options, transport, harness.store(), clock)
    }

    pub fn owner(self) -> OwnerHandles {
        let (options, transport, store, clock) = self.parts();
        TimerService::owner(options, transport, Some(store), clock)
    }

    pub fn mirror(self) -> MirrorHandles {
        let (options, transport, store, clock) = self.parts();
        TimerService::mirror(options, transport, Some(store), clock)
    }
}

/// A three-stage meeting used by the scenarios and the simulator.
pub fn sample_agenda() -> Vec<Stage> {
    let stage = |id: &str, name: &str, seconds: u32, order_index: i32| Stage {
        id: id.to_string(),
        name: name.to_string(),
        duration_seconds: seconds,
        order_index,
        color_primary: "#22c55e".to_string(),
        color_alert: "#ef4444".to_string(),
    };
    vec![
        stage("pitch", "Pitch", 60, 0),
        stage("qa", "Questions", 120, 1),
        stage("wrap", "Wrap-up", 30, 2),
    ]
}

#[cfg(test)]
mod scenario_tests {
    use super::*;
    use crate::sync::{ConnectionStatus, DropReason, Transport, TransportKind};
    use shared::{TimerSnapshot, TimerState};

    fn harness() -> Harness {
        Harness::new(SyncConfig::default())
    }

    /// Owner plays a 60s stage at t=0; a mirror opens at 2000 on a clock
    /// 500s ahead, announces itself and reads ~57950ms at 2050.
    #[test]
    fn mirror_opened_late_catches_up_across_clock_skew() {
        let harness = harness();
        let a = harness.context("a").stages(sample_agenda()).owner();
        a.controller.start();

        harness.advance(2_000);
        let b = harness.context("b").skew(500_000).mirror();
        a.driver.tick();

        harness.advance(50);
        b.driver.tick();

        let remaining = b.observer.remaining_ms();
        assert!(
            (remaining - 57_950).abs() <= 100,
            "mirror computed {}",
            remaining
        );
        assert_eq!(a.observer.remaining_ms(), 57_950);
        assert!(b.observer.get_state().state.is_running);
        assert_eq!(
            b.observer.current_stage().map(|stage| stage.id),
            Some("pitch".to_string())
        );
    }

    #[test]
    fn mirror_follows_owner_controls() {
        let harness = harness();
        let a = harness.context("a").stages(sample_agenda()).owner();
        let b = harness.context("b").mirror();
        a.driver.tick();
        b.driver.tick();

        a.controller.start();
        harness.advance(9_000);
        a.controller.adjust(30);
        a.controller.pause();
        b.driver.tick();

        let view = b.observer.get_state();
        assert!(!view.state.is_running);
        assert_eq!(view.state.duration_ms, 81_000);
        assert_eq!(b.observer.remaining_ms(), 81_000);
        assert_eq!(view.revision, a.observer.get_state().revision);

        a.controller.next();
        b.driver.tick();
        let view = b.observer.get_state();
        assert_eq!(view.stage.map(|stage| stage.id), Some("qa".to_string()));
        assert_eq!(b.observer.remaining_ms(), 120_000);
    }

    #[test]
    fn mirror_controls_are_applied_by_owner() {
        let harness = harness();
        let a = harness.context("a").stages(sample_agenda()).owner();
        let b = harness.context("b").mirror();
        a.driver.tick();
        b.driver.tick();

        b.remote.start();
        assert!(!b.observer.get_state().state.is_running);

        a.driver.tick();
        assert!(a.observer.get_state().state.is_running);

        harness.advance(100);
        b.driver.tick();
        assert!(b.observer.get_state().state.is_running);
        // Rebased on receipt: delivery latency is not subtracted.
        assert!((59_900..=60_000).contains(&b.observer.remaining_ms()));

        b.remote.next();
        a.driver.tick();
        b.driver.tick();
        assert_eq!(b.observer.get_state().stage_index, 1);
    }

    #[test]
    fn contexts_in_other_directories_are_isolated() {
        let harness = harness();
        let a = harness
            .context("a")
            .directory("session-1")
            .stages(sample_agenda())
            .owner();
        let b = harness.context("b").directory("session-2").mirror();

        a.controller.start();
        a.driver.tick();
        b.driver.tick();

        assert!(!b.observer.get_state().state.is_running);
        assert!(a.observer.diagnostics().dropped(DropReason::ForeignDirectory) >= 1);
        assert!(b.observer.diagnostics().dropped(DropReason::ForeignDirectory) >= 1);
    }

    #[test]
    fn messages_from_other_protocol_versions_are_ignored() {
        let harness = harness();
        let a = harness.context("a").stages(sample_agenda()).owner();
        let mut stranger = harness
            .hub
            .open_broadcast(&harness.config.channel.broadcast_name)
            .unwrap();

        stranger
            .publish(r#"{"type":"CONTROL","payload":{"action":"PLAY"},"v":"v2"}"#, 0)
            .unwrap();
        a.driver.tick();

        assert!(!a.observer.get_state().state.is_running);
        assert_eq!(a.observer.diagnostics().dropped(DropReason::UnsupportedVersion), 1);

        stranger
            .publish(r#"{"type":"CONTROL","payload":{"action":"PLAY"},"v":"v1"}"#, 0)
            .unwrap();
        a.driver.tick();
        assert!(a.observer.get_state().state.is_running);
    }

    #[test]
    fn storage_tier_carries_sync_without_broadcast() {
        let harness = harness();
        harness.hub.set_broadcast_available(false);
        let a = harness.context("a").stages(sample_agenda()).owner();
        let b = harness.context("b").mirror();

        assert_eq!(
            a.observer.connection().active_transport,
            Some(TransportKind::Storage)
        );
        assert!(b.observer.connection().is_degraded);

        a.driver.tick();
        b.driver.tick();

        harness.advance(500);
        a.controller.start();
        b.driver.tick();
        assert!(b.observer.get_state().state.is_running);

        harness.advance(9_500);
        assert_eq!(b.observer.remaining_ms(), 50_500);
        assert_eq!(a.observer.remaining_ms(), 50_500);
    }

    #[test]
    fn window_handle_used_when_broadcast_missing_and_probe_detects_close() {
        let harness = harness();
        harness.hub.set_broadcast_available(false);
        let b = harness.context("b").window("popup", "main").mirror();
        let a = harness
            .context("a")
            .stages(sample_agenda())
            .window("main", "popup")
            .owner();

        assert_eq!(
            a.observer.connection().active_transport,
            Some(TransportKind::Window)
        );

        b.remote.request_sync();
        a.driver.tick();
        b.driver.tick();
        assert_eq!(b.observer.get_state().state.duration_ms, 60_000);
        assert_eq!(b.observer.current_stage().map(|s| s.id), Some("pitch".to_string()));

        harness.hub.close_window("popup");
        a.controller.start();
        assert_eq!(
            a.observer.connection().active_transport,
            Some(TransportKind::Storage)
        );
    }

    #[test]
    fn reconnect_budget_exhaustion_degrades_for_good() {
        let harness = harness();
        let a = harness.context("a").stages(sample_agenda()).owner();
        let b = harness.context("b").mirror();
        a.driver.tick();
        b.driver.tick();
        a.controller.start();
        b.driver.tick();

        harness.hub.set_broadcast_available(false);
        harness.hub.break_broadcast(&harness.config.channel.broadcast_name);

        let mut statuses = Vec::new();
        for _ in 0..20 {
            harness.advance(500);
            a.driver.tick();
            b.driver.tick();
            statuses.push(b.observer.connection().status());
        }
        assert!(statuses.contains(&ConnectionStatus::Reconnecting));
        assert!(a.observer.connection().is_degraded);
        assert!(b.observer.connection().is_degraded);

        harness.hub.set_broadcast_available(true);
        a.controller.pause();
        harness.advance(500);
        b.driver.tick();

        assert!(b.observer.connection().is_degraded, "never promoted back");
        let owner_view = a.observer.get_state();
        let mirror_view = b.observer.get_state();
        assert!(!mirror_view.state.is_running);
        assert_eq!(mirror_view.state.duration_ms, owner_view.state.duration_ms);
    }

    #[test]
    fn degraded_mirror_hydrates_from_durable_record() {
        let harness = harness();
        harness.hub.set_broadcast_available(false);
        let b = harness.context("b").mirror();
        assert!(b.observer.connection().is_degraded);

        let snapshot = TimerSnapshot {
            state: TimerState {
                duration_ms: 42_000,
                start_time_ms: None,
                adjustments_ms: 0,
                is_running: false,
                directory_id: "session-1".to_string(),
                stage_id: "wrap".to_string(),
            },
            stage_index: 2,
            stage: None,
            sent_at_ms: 0,
            revision: 99,
        };
        harness.store().save(&snapshot).unwrap();

        b.driver.tick();
        let view = b.observer.get_state();
        assert_eq!(view.revision, 99);
        assert_eq!(view.state.duration_ms, 42_000);
        assert_eq!(view.state.stage_id, "wrap");
    }

    /// The owner pauses while its broadcast link is down, so that change
    /// goes through storage. The next change rides the restored broadcast
    /// and reaches the mirror first; the older record must not win.
    #[test]
    fn mirror_keeps_newest_revision_when_tiers_deliver_out_of_order() {
        let harness = harness();
        let a = harness.context("a").stages(sample_agenda()).owner();
        let b = harness.context("b").mirror();
        a.controller.start();
        a.driver.tick();
        b.driver.tick();

        // Only the owner keeps ticking until it gives up on the silent mirror.
        for _ in 0..20 {
            if a.observer.diagnostics().heartbeat_timeouts > 0 {
                break;
            }
            harness.advance(1_000);
            a.driver.tick();
        }
        assert_eq!(a.observer.diagnostics().heartbeat_timeouts, 1);

        a.controller.pause();
        assert_eq!(
            a.observer.connection().active_transport,
            Some(TransportKind::Storage)
        );
        let paused_revision = a.observer.get_state().revision;

        for _ in 0..10 {
            if a.observer.connection().active_transport == Some(TransportKind::Broadcast) {
                break;
            }
            harness.advance(500);
            a.driver.tick();
        }
        assert_eq!(
            a.observer.connection().active_transport,
            Some(TransportKind::Broadcast)
        );
        a.controller.adjust(30);
        let owner = a.observer.get_state();
        assert!(owner.revision > paused_revision);

        b.driver.tick();
        let mirror = b.observer.get_state();
        assert_eq!(mirror.revision, owner.revision);
        assert!(!mirror.state.is_running);
        assert_eq!(b.observer.remaining_ms(), a.observer.remaining_ms());
    }

    #[test]
    fn degraded_mirror_ignores_older_durable_record() {
        let harness = harness();
        harness.hub.set_broadcast_available(false);
        let b = harness.context("b").mirror();

        let record = |revision: u64, duration_ms: i64| TimerSnapshot {
            state: TimerState {
                duration_ms,
                start_time_ms: None,
                adjustments_ms: 0,
                is_running: false,
                directory_id: "session-1".to_string(),
                stage_id: "qa".to_string(),
            },
            stage_index: 1,
            stage: None,
            sent_at_ms: 0,
            revision,
        };
        harness.store().save(&record(7, 70_000)).unwrap();
        b.driver.tick();
        assert_eq!(b.observer.get_state().revision, 7);

        harness.store().save(&record(6, 10_000)).unwrap();
        harness.advance(1_000);
        b.driver.tick();
        let view = b.observer.get_state();
        assert_eq!(view.revision, 7);
        assert_eq!(view.state.duration_ms, 70_000);
    }

    #[test]
    fn closed_mirror_is_detected_by_heartbeat_timeout() {
        let harness = harness();
        let a = harness.context("a").stages(sample_agenda()).owner();
        let b = harness.context("b").mirror();
        a.driver.tick();
        b.driver.tick();
        harness.advance(100);
        a.driver.tick();
        assert_eq!(a.observer.connection().last_heartbeat_at, Some(100));

        b.driver.shutdown();

        let mut statuses = Vec::new();
        for _ in 0..13 {
            harness.advance(1_000);
            a.driver.tick();
            statuses.push(a.observer.connection().status());
        }

        assert_eq!(a.observer.diagnostics().heartbeat_timeouts, 1);
        // Timed out at 11_100, primary reopened on the retry at 13_100.
        assert_eq!(statuses[9], ConnectionStatus::Connected);
        assert_eq!(statuses[10], ConnectionStatus::Reconnecting);
        assert_eq!(statuses[12], ConnectionStatus::Connected);
    }

    #[test]
    fn polling_cadence_does_not_change_mirror_reading() {
        let harness = harness();
        let a = harness.context("a").stages(sample_agenda()).owner();
        let b = harness.context("b").mirror();
        a.controller.start();
        a.driver.tick();
        b.driver.tick();

        for _ in 0..37 {
            harness.advance(73);
            b.driver.tick();
        }
        harness.advance(1_000 - 37 * 73 % 1_000);
        let elapsed = harness.now_ms();
        assert_eq!(b.observer.remaining_ms(), 60_000 - elapsed);
    }
}
