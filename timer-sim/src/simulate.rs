//! Owner plus late-joining mirror on a shared manual clock.

use shared::{Stage, SyncConfig};
use timer_frontend::runtime::{auto_advance, render_frame};
use timer_frontend::sync::{ConnectionStatus, TransportKind};
use timer_frontend::testing::Harness;
use timer_frontend::MirrorHandles;

pub struct SimulateOptions {
    pub duration_secs: u32,
    pub mirror_at_ms: i64,
    pub steps: usize,
    pub step_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimRow {
    pub at_ms: i64,
    pub owner_remaining_ms: i64,
    pub owner_display: String,
    pub mirror_remaining_ms: Option<i64>,
    pub mirror_status: Option<ConnectionStatus>,
    pub mirror_transport: Option<TransportKind>,
}

impl SimRow {
    /// Mirror reading minus owner reading.
    pub fn divergence_ms(&self) -> Option<i64> {
        self.mirror_remaining_ms
            .map(|mirror| mirror - self.owner_remaining_ms)
    }
}

pub fn run_simulation(options: &SimulateOptions, config: SyncConfig) -> Vec<SimRow> {
    let harness = Harness::new(config);
    let stage = Stage {
        id: "sim".to_string(),
        name: "Simulated stage".to_string(),
        duration_seconds: options.duration_secs,
        order_index: 0,
        color_primary: "#22c55e".to_string(),
        color_alert: "#ef4444".to_string(),
    };
    let owner = harness.context("owner").stages(vec![stage]).owner();
    owner.controller.start();
    log::info!("Owner started a {}s stage", options.duration_secs);

    let mut mirror: Option<MirrorHandles> = None;
    let mut rows = Vec::with_capacity(options.steps);
    for _ in 0..options.steps {
        harness.advance(options.step_ms);

        if mirror.is_none() && harness.now_ms() >= options.mirror_at_ms {
            log::info!("Mirror opened at {}ms", harness.now_ms());
            mirror = Some(harness.context("mirror").mirror());
        }

        owner.driver.tick();
        auto_advance(&owner.controller);
        if let Some(mirror) = mirror.as_ref() {
            mirror.driver.tick();
        }

        let frame = render_frame(&owner.observer);
        rows.push(SimRow {
            at_ms: harness.now_ms(),
            owner_remaining_ms: frame.remaining_ms,
            owner_display: frame.display,
            mirror_remaining_ms: mirror.as_ref().map(|m| m.observer.remaining_ms()),
            mirror_status: mirror.as_ref().map(|m| m.observer.connection().status()),
            mirror_transport: mirror
                .as_ref()
                .and_then(|m| m.observer.connection().active_transport),
        });
    }

    owner.driver.shutdown();
    if let Some(mirror) = mirror {
        mirror.driver.shutdown();
    }
    rows
}

pub fn print_rows(rows: &[SimRow]) {
    println!("⏱️  Meeting timer simulation");
    println!("================================");
    println!(
        "{:>8}  {:>7}  {:>10}  {:>10}  {:>7}  {}",
        "t(ms)", "owner", "owner(ms)", "mirror(ms)", "drift", "mirror link"
    );
    for row in rows {
        let mirror = row
            .mirror_remaining_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".to_string());
        let drift = row
            .divergence_ms()
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".to_string());
        let link = match (row.mirror_status, row.mirror_transport) {
            (Some(status), Some(kind)) => format!("{:?} via {:?}", status, kind),
            (Some(status), None) => format!("{:?}", status),
            _ => "-".to_string(),
        };
        println!(
            "{:>8}  {:>7}  {:>10}  {:>10}  {:>7}  {}",
            row.at_ms, row.owner_display, row.owner_remaining_ms, mirror, drift, link
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_appears_and_tracks_owner() {
        let options = SimulateOptions {
            duration_secs: 60,
            mirror_at_ms: 2_000,
            steps: 8,
            step_ms: 500,
        };
        let rows = run_simulation(&options, SyncConfig::default());

        assert_eq!(rows.len(), 8);
        assert_eq!(rows[0].mirror_remaining_ms, None);
        assert_eq!(rows[3].at_ms, 2_000);
        assert!(rows[3].mirror_remaining_ms.is_some());
        let last = rows.last().unwrap();
        assert_eq!(last.owner_remaining_ms, 56_000);
        assert!(last.divergence_ms().unwrap().abs() <= options.step_ms);
        assert_eq!(last.mirror_transport, Some(TransportKind::Broadcast));
    }

    #[test]
    fn owner_pauses_at_end_of_single_stage() {
        let options = SimulateOptions {
            duration_secs: 1,
            mirror_at_ms: 10_000,
            steps: 4,
            step_ms: 500,
        };
        let rows = run_simulation(&options, SyncConfig::default());
        assert_eq!(rows[1].owner_remaining_ms, 0);
        assert_eq!(rows[3].owner_display, "00:00");
        assert!(rows.iter().all(|row| row.mirror_remaining_ms.is_none()));
    }
}
