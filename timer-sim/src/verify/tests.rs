use super::TestResult;
use shared::SyncConfig;
use timer_frontend::sync::{
    ConnectionStatus, DropReason, StorageTransport, Transport, TransportKind,
};
use timer_frontend::testing::{sample_agenda, Harness};

/// Most scenarios settle within a few storage polls; tick at that cadence.
fn step_ms(config: &SyncConfig) -> i64 {
    (config.timing.storage_poll_interval_ms as i64).max(1)
}

pub fn test_late_mirror_catches_up(config: &SyncConfig) -> TestResult {
    let harness = Harness::new(config.clone());
    let a = harness.context("a").stages(sample_agenda()).owner();
    a.controller.start();

    harness.advance(2_000);
    let b = harness.context("b").skew(500_000).mirror();
    a.driver.tick();
    harness.advance(50);
    b.driver.tick();

    let remaining = b.observer.remaining_ms();
    if (remaining - 57_950).abs() > 100 {
        return TestResult::Fail(format!("Mirror computed {}ms, expected ~57950ms", remaining));
    }
    if !b.observer.get_state().state.is_running {
        return TestResult::Fail("Mirror did not pick up the running state".into());
    }
    TestResult::Pass
}

pub fn test_directory_isolation(config: &SyncConfig) -> TestResult {
    let harness = Harness::new(config.clone());
    let a = harness
        .context("a")
        .directory("session-1")
        .stages(sample_agenda())
        .owner();
    let b = harness.context("b").directory("session-2").mirror();

    a.controller.start();
    a.driver.tick();
    b.driver.tick();

    if b.observer.get_state().state.is_running {
        return TestResult::Fail("Mirror in another directory followed the owner".into());
    }
    let dropped = a.observer.diagnostics().dropped(DropReason::ForeignDirectory);
    if dropped == 0 {
        return TestResult::Fail("Owner answered a foreign SYNC_REQUEST".into());
    }
    TestResult::Pass
}

pub fn test_version_guard(config: &SyncConfig) -> TestResult {
    let harness = Harness::new(config.clone());
    let a = harness.context("a").stages(sample_agenda()).owner();
    let mut stranger = match harness.hub.open_broadcast(&config.channel.broadcast_name) {
        Ok(stranger) => stranger,
        Err(e) => return TestResult::Skip(format!("No broadcast channel: {}", e)),
    };

    if let Err(e) = stranger.publish(
        r#"{"type":"CONTROL","payload":{"action":"PLAY"},"v":"v2"}"#,
        harness.now_ms(),
    ) {
        return TestResult::Fail(format!("Publish failed: {}", e));
    }
    a.driver.tick();

    if a.observer.get_state().state.is_running {
        return TestResult::Fail("A v2 CONTROL message was applied".into());
    }
    if a.observer.diagnostics().dropped(DropReason::UnsupportedVersion) != 1 {
        return TestResult::Fail("Version drop was not counted".into());
    }
    TestResult::Pass
}

pub fn test_remote_control_round_trip(config: &SyncConfig) -> TestResult {
    let harness = Harness::new(config.clone());
    let a = harness.context("a").stages(sample_agenda()).owner();
    let b = harness.context("b").mirror();
    a.driver.tick();
    b.driver.tick();

    b.remote.next();
    b.remote.start();
    a.driver.tick();
    b.driver.tick();

    let owner = a.observer.get_state();
    let mirror = b.observer.get_state();
    if owner.stage_index != 1 || !owner.state.is_running {
        return TestResult::Fail(format!(
            "Owner did not apply mirror controls (stage {}, running {})",
            owner.stage_index, owner.state.is_running
        ));
    }
    if mirror.revision != owner.revision || mirror.stage_index != owner.stage_index {
        return TestResult::Fail(format!(
            "Mirror at revision {} stage {}, owner at revision {} stage {}",
            mirror.revision, mirror.stage_index, owner.revision, owner.stage_index
        ));
    }
    TestResult::Pass
}

pub fn test_storage_fallback(config: &SyncConfig) -> TestResult {
    let harness = Harness::new(config.clone());
    harness.hub.set_broadcast_available(false);
    let a = harness.context("a").stages(sample_agenda()).owner();
    let b = harness.context("b").mirror();

    if a.observer.connection().active_transport != Some(TransportKind::Storage) {
        return TestResult::Fail("Owner is not publishing through storage".into());
    }

    let step = step_ms(config);
    a.driver.tick();
    b.driver.tick();
    harness.advance(step);
    a.controller.start();
    b.driver.tick();

    if !b.observer.get_state().state.is_running {
        return TestResult::Fail("Mirror missed PLAY over storage".into());
    }
    let drift = b.observer.remaining_ms() - a.observer.remaining_ms();
    if drift != 0 {
        return TestResult::Fail(format!("Mirror drifted by {}ms", drift));
    }
    TestResult::Pass
}

pub fn test_reconnect_exhaustion(config: &SyncConfig) -> TestResult {
    let harness = Harness::new(config.clone());
    let a = harness.context("a").stages(sample_agenda()).owner();
    let b = harness.context("b").mirror();
    a.driver.tick();
    b.driver.tick();

    harness.hub.set_broadcast_available(false);
    harness.hub.break_broadcast(&config.channel.broadcast_name);

    let step = step_ms(config);
    let budget = config.timing.reconnect_delay_ms as i64
        * (config.timing.max_reconnect_attempts as i64 + 2)
        + step;
    let mut saw_reconnecting = false;
    let deadline = harness.now_ms() + budget;
    while harness.now_ms() < deadline {
        harness.advance(step);
        a.driver.tick();
        b.driver.tick();
        saw_reconnecting |= b.observer.connection().status() == ConnectionStatus::Reconnecting;
    }

    if !saw_reconnecting {
        return TestResult::Fail("Mirror never reported Reconnecting".into());
    }
    if !b.observer.connection().is_degraded {
        return TestResult::Fail("Mirror not degraded after the retry budget".into());
    }

    harness.hub.set_broadcast_available(true);
    a.controller.start();
    harness.advance(step);
    b.driver.tick();

    if !b.observer.connection().is_degraded {
        return TestResult::Fail("Mirror promoted back to broadcast".into());
    }
    if !b.observer.get_state().state.is_running {
        return TestResult::Fail("Degraded mirror missed PLAY".into());
    }
    TestResult::Pass
}

pub fn test_heartbeat_timeout(config: &SyncConfig) -> TestResult {
    let harness = Harness::new(config.clone());
    let a = harness.context("a").stages(sample_agenda()).owner();
    let b = harness.context("b").mirror();
    a.driver.tick();
    b.driver.tick();
    harness.advance(1);
    a.driver.tick();

    let Some(last_seen) = a.observer.connection().last_heartbeat_at else {
        return TestResult::Fail("Owner never saw the mirror".into());
    };
    b.driver.shutdown();

    let timeout = config.timing.heartbeat_timeout_ms as i64;
    let step = step_ms(config);
    let deadline = last_seen + timeout + 2 * step;
    while harness.now_ms() < deadline {
        harness.advance(step);
        a.driver.tick();
        let timeouts = a.observer.diagnostics().heartbeat_timeouts;
        if timeouts > 0 {
            if harness.now_ms() - last_seen <= timeout {
                return TestResult::Fail(format!(
                    "Timed out after {}ms, before {}ms",
                    harness.now_ms() - last_seen,
                    timeout
                ));
            }
            return TestResult::Pass;
        }
    }
    TestResult::Fail("Closed mirror was never detected".into())
}

pub fn test_storage_prune(config: &SyncConfig) -> TestResult {
    let prune_age = config.timing.storage_prune_age_ms as i64;
    if prune_age == 0 {
        return TestResult::Skip("storage_prune_age_ms is 0".into());
    }

    let harness = Harness::new(config.clone());
    let storage = harness.hub.storage();
    let prefix = config.channel.storage_prefix.as_str();
    let mut writer = StorageTransport::new(storage.clone(), prefix, "writer", &config.timing, 0);
    let mut reader = StorageTransport::new(storage.clone(), prefix, "reader", &config.timing, 0);

    if let Err(e) = writer.publish("{}", 0) {
        return TestResult::Fail(format!("Storage write failed: {}", e));
    }
    let stale = reader.drain(prune_age + 1);
    if !stale.is_empty() {
        return TestResult::Fail(format!("{} stale records delivered", stale.len()));
    }
    if !storage.is_empty() {
        return TestResult::Fail(format!("{} stale records left behind", storage.len()));
    }
    TestResult::Pass
}
