use serde::{Deserialize, Serialize};

// ===== PROTOCOL =====

/// Envelope version understood by this build. Receivers drop anything else.
pub const PROTOCOL_VERSION: &str = "v1";

/// Manual adjustment applied by ADD30 / SUB30.
pub const ADJUST_STEP_MS: i64 = 30_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Init,
    Control,
    SyncRequest,
    SyncResponse,
    Ping,
    Pong,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        MessageKind::Init,
        MessageKind::Control,
        MessageKind::SyncRequest,
        MessageKind::SyncResponse,
        MessageKind::Ping,
        MessageKind::Pong,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Init => "INIT",
            MessageKind::Control => "CONTROL",
            MessageKind::SyncRequest => "SYNC_REQUEST",
            MessageKind::SyncResponse => "SYNC_RESPONSE",
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed message, one variant per wire `type`. The envelope codec in the
/// frontend maps it to `{type, payload, v}`.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    Init(InitPayload),
    Control(ControlPayload),
    SyncRequest(SyncRequestPayload),
    SyncResponse(TimerSnapshot),
    Ping(HeartbeatPayload),
    Pong(HeartbeatPayload),
}

impl SyncMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            SyncMessage::Init(_) => MessageKind::Init,
            SyncMessage::Control(_) => MessageKind::Control,
            SyncMessage::SyncRequest(_) => MessageKind::SyncRequest,
            SyncMessage::SyncResponse(_) => MessageKind::SyncResponse,
            SyncMessage::Ping(_) => MessageKind::Ping,
            SyncMessage::Pong(_) => MessageKind::Pong,
        }
    }

    /// Directory the payload is scoped to. `None` means broadcast-to-all.
    pub fn directory_id(&self) -> Option<&str> {
        let directory_id = match self {
            SyncMessage::Init(payload) => payload.directory_id.as_deref(),
            SyncMessage::Control(payload) => payload.directory_id.as_deref(),
            SyncMessage::SyncRequest(payload) => payload.directory_id.as_deref(),
            SyncMessage::SyncResponse(snapshot) => Some(snapshot.state.directory_id.as_str()),
            SyncMessage::Ping(payload) | SyncMessage::Pong(payload) => {
                payload.directory_id.as_deref()
            }
        };
        directory_id.filter(|id| !id.is_empty())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_id: Option<String>,
    #[serde(default)]
    pub context_id: String,
    #[serde(default)]
    pub mode: ContextMode,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_id: Option<String>,
    #[serde(flatten)]
    pub action: ControlAction,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_id: Option<String>,
    #[serde(default)]
    pub context_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_id: Option<String>,
    #[serde(default)]
    pub context_id: String,
    #[serde(default)]
    pub nonce: u64,
    /// Set on PONG: the context whose PING is being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Control command. Wire form: `{"action": "PLAY"}` or
/// `{"action": "ADJUST", "deltaMs": 15000}`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlAction {
    Play,
    Pause,
    Reset,
    #[serde(rename = "ADD30")]
    Add30,
    #[serde(rename = "SUB30")]
    Sub30,
    Next,
    Prev,
    Adjust {
        #[serde(rename = "deltaMs")]
        delta_ms: i64,
    },
}

impl ControlAction {
    /// Signed adjustment carried by this action, if it is an adjustment.
    pub fn adjustment_ms(self) -> Option<i64> {
        match self {
            ControlAction::Add30 => Some(ADJUST_STEP_MS),
            ControlAction::Sub30 => Some(-ADJUST_STEP_MS),
            ControlAction::Adjust { delta_ms } => Some(delta_ms),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    #[default]
    Main,
    Mirror,
}

impl ContextMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextMode::Main => "main",
            ContextMode::Mirror => "mirror",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "main" => Some(ContextMode::Main),
            "mirror" => Some(ContextMode::Mirror),
            _ => None,
        }
    }
}

// ===== TIMER TYPES =====

/// Canonical timer state. `start_time_ms` is an anchor on the owning
/// context's clock, never a running counter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub duration_ms: i64,
    pub start_time_ms: Option<i64>,
    pub adjustments_ms: i64,
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub directory_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stage_id: String,
}

/// Full state snapshot, the SYNC_RESPONSE payload and the durable record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    #[serde(flatten)]
    pub state: TimerState,
    #[serde(default)]
    pub stage_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Sender clock when the snapshot left the owner.
    pub sent_at_ms: i64,
    #[serde(default)]
    pub revision: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    pub name: String,
    pub duration_seconds: u32,
    pub order_index: i32,
    #[serde(default)]
    pub color_primary: String,
    #[serde(default)]
    pub color_alert: String,
}

impl Stage {
    pub fn duration_ms(&self) -> i64 {
        i64::from(self.duration_seconds) * 1000
    }
}

// ===== STORAGE TYPES =====

/// Durable timer record as found in shared storage. Older builds wrote the
/// accumulator shape; it is still accepted on read.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum StoredTimerRecord {
    Current(TimerSnapshot),
    Legacy(LegacyTimerRecord),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTimerRecord {
    pub running: bool,
    #[serde(default)]
    pub start_anchor: i64,
    #[serde(default)]
    pub paused_accumulator_ms: i64,
}

impl LegacyTimerRecord {
    /// Convert to anchor form. The accumulator holds elapsed time already
    /// spent, so it becomes a negative adjustment while running and is
    /// folded into the duration while paused.
    pub fn into_state(self, stage_duration_ms: i64, directory_id: &str, stage_id: &str) -> TimerState {
        let (duration_ms, start_time_ms, adjustments_ms) = if self.running {
            (stage_duration_ms, Some(self.start_anchor), -self.paused_accumulator_ms)
        } else {
            ((stage_duration_ms - self.paused_accumulator_ms).max(0), None, 0)
        };
        TimerState {
            duration_ms,
            start_time_ms,
            adjustments_ms,
            is_running: self.running,
            directory_id: directory_id.to_string(),
            stage_id: stage_id.to_string(),
        }
    }
}

// ===== POPUP TYPES =====

/// Query parameters the main window hands to a popup it opens.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PopupParams {
    pub mode: ContextMode,
    pub session_id: String,
    pub meeting_id: String,
    pub timestamp: i64,
}

impl PopupParams {
    /// Sessions scope synchronization, so the session id is the directory filter.
    pub fn directory_id(&self) -> &str {
        &self.session_id
    }
}

// ===== CONFIG TYPES =====

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SyncConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub channel: ChannelSection,
}

impl SyncConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Parse and reject config files written for a format this build can't read.
    pub fn parse_checked(content: &str) -> Result<Self, ConfigError> {
        let config =
            Self::from_toml_str(content).map_err(|error| ConfigError::Parse(error.to_string()))?;
        match config.app.get_migration_strategy() {
            MigrationStrategy::None => Ok(config),
            MigrationStrategy::Recreate => {
                Err(ConfigError::UnsupportedVersion(config.app.version))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("unsupported config version '{0}'")]
    UnsupportedVersion(String),
}

// AppSection carries the config format version so older files can be migrated
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppSection {
    pub version: String,
}

impl AppSection {
    /// Current configuration format version
    pub const CURRENT_VERSION: &'static str = "1.0.0";

    pub fn get_migration_strategy(&self) -> MigrationStrategy {
        match self.version.as_str() {
            "1.0.0" => MigrationStrategy::None,
            _ => MigrationStrategy::Recreate,
        }
    }
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStrategy {
    None,
    Recreate,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TimingSection {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub storage_poll_interval_ms: u64,
    pub storage_prune_age_ms: u64,
    pub sync_interval_ms: u64,
    pub render_interval_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 10_000,
            reconnect_delay_ms: 2_000,
            max_reconnect_attempts: 3,
            storage_poll_interval_ms: 500,
            storage_prune_age_ms: 60_000,
            sync_interval_ms: 250,
            render_interval_ms: 100,
        }
    }
}

impl TimingSection {
    /// Period of the host sync tick, as a browser timer takes it.
    pub fn sync_period_ms(&self) -> u32 {
        timer_period(self.sync_interval_ms)
    }

    /// Period of the render frame, as a browser timer takes it.
    pub fn render_period_ms(&self) -> u32 {
        timer_period(self.render_interval_ms)
    }
}

// A zero period would spin the event loop.
fn timer_period(interval_ms: u64) -> u32 {
    u32::try_from(interval_ms).unwrap_or(u32::MAX).max(1)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ChannelSection {
    pub broadcast_name: String,
    pub storage_prefix: String,
    pub state_key: String,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            broadcast_name: "meeting-timer-sync".to_string(),
            storage_prefix: "meeting-timer-msg".to_string(),
            state_key: "meeting-timer-state".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_snapshot() -> TimerSnapshot {
        TimerSnapshot {
            state: TimerState {
                duration_ms: 60_000,
                start_time_ms: Some(0),
                adjustments_ms: 0,
                is_running: true,
                directory_id: "dir-1".to_string(),
                stage_id: "stage-a".to_string(),
            },
            stage_index: 0,
            stage: None,
            sent_at_ms: 2_000,
            revision: 4,
        }
    }

    #[test]
    fn control_action_wire_names() {
        let json = serde_json::to_value(ControlAction::Sub30).unwrap();
        assert_eq!(json, serde_json::json!({ "action": "SUB30" }));

        let adjust: ControlAction =
            serde_json::from_value(serde_json::json!({ "action": "ADJUST", "deltaMs": -5000 }))
                .unwrap();
        assert_eq!(adjust, ControlAction::Adjust { delta_ms: -5000 });
        assert_eq!(adjust.adjustment_ms(), Some(-5000));
    }

    #[test]
    fn control_payload_flattens_action() {
        let payload = ControlPayload {
            directory_id: Some("dir-1".to_string()),
            action: ControlAction::Next,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({ "directoryId": "dir-1", "action": "NEXT" }));
    }

    #[test]
    fn snapshot_flattens_state_fields() {
        let json = serde_json::to_value(running_snapshot()).unwrap();
        assert_eq!(json["durationMs"], 60_000);
        assert_eq!(json["directoryId"], "dir-1");
        assert_eq!(json["sentAtMs"], 2_000);
        assert!(json.get("stage").is_none());
    }

    #[test]
    fn stored_record_accepts_both_shapes() {
        let current = serde_json::to_string(&running_snapshot()).unwrap();
        let parsed: StoredTimerRecord = serde_json::from_str(&current).unwrap();
        assert_eq!(parsed, StoredTimerRecord::Current(running_snapshot()));

        let legacy = r#"{"running":false,"startAnchor":0,"pausedAccumulatorMs":12000}"#;
        let parsed: StoredTimerRecord = serde_json::from_str(legacy).unwrap();
        assert_eq!(
            parsed,
            StoredTimerRecord::Legacy(LegacyTimerRecord {
                running: false,
                start_anchor: 0,
                paused_accumulator_ms: 12_000,
            })
        );
    }

    #[test]
    fn legacy_record_conversion() {
        let paused = LegacyTimerRecord {
            running: false,
            start_anchor: 0,
            paused_accumulator_ms: 12_000,
        }
        .into_state(60_000, "dir-1", "stage-a");
        assert_eq!(paused.duration_ms, 48_000);
        assert_eq!(paused.start_time_ms, None);
        assert!(!paused.is_running);

        let running = LegacyTimerRecord {
            running: true,
            start_anchor: 5_000,
            paused_accumulator_ms: 3_000,
        }
        .into_state(60_000, "dir-1", "stage-a");
        assert_eq!(running.start_time_ms, Some(5_000));
        assert_eq!(running.adjustments_ms, -3_000);

        let overspent = LegacyTimerRecord {
            running: false,
            start_anchor: 0,
            paused_accumulator_ms: 90_000,
        }
        .into_state(60_000, "", "");
        assert_eq!(overspent.duration_ms, 0);
    }

    #[test]
    fn directory_id_ignores_empty_values() {
        let mut snapshot = running_snapshot();
        snapshot.state.directory_id.clear();
        assert_eq!(SyncMessage::SyncResponse(snapshot).directory_id(), None);

        let request = SyncMessage::SyncRequest(SyncRequestPayload {
            directory_id: Some("dir-2".to_string()),
            context_id: "ctx".to_string(),
        });
        assert_eq!(request.directory_id(), Some("dir-2"));
    }

    #[test]
    fn message_kind_parse_matches_wire_names() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("HELLO"), None);
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config = SyncConfig::from_toml_str(
            r#"
            [timing]
            heartbeat_interval_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.timing.heartbeat_interval_ms, 1_000);
        assert_eq!(config.timing.heartbeat_timeout_ms, 10_000);
        assert_eq!(config.channel, ChannelSection::default());
        assert_eq!(config.app.get_migration_strategy(), MigrationStrategy::None);

        let text = SyncConfig::default().to_toml_string().unwrap();
        assert_eq!(SyncConfig::from_toml_str(&text).unwrap(), SyncConfig::default());
    }

    #[test]
    fn unknown_config_version_is_recreated() {
        let section = AppSection {
            version: "0.3.0".to_string(),
        };
        assert_eq!(section.get_migration_strategy(), MigrationStrategy::Recreate);
    }

    #[test]
    fn loop_periods_follow_timing_section() {
        let defaults = TimingSection::default();
        assert_eq!(defaults.sync_period_ms(), 250);
        assert_eq!(defaults.render_period_ms(), 100);

        let config = SyncConfig::from_toml_str(
            r#"
            [timing]
            sync_interval_ms = 0
            render_interval_ms = 40
            "#,
        )
        .unwrap();
        assert_eq!(config.timing.sync_period_ms(), 1);
        assert_eq!(config.timing.render_period_ms(), 40);

        let slow = TimingSection {
            render_interval_ms: u64::MAX,
            ..TimingSection::default()
        };
        assert_eq!(slow.render_period_ms(), u32::MAX);
    }

    #[test]
    fn parse_checked_rejects_unknown_versions() {
        let config = SyncConfig::parse_checked("[timing]\nmax_reconnect_attempts = 5\n").unwrap();
        assert_eq!(config.timing.max_reconnect_attempts, 5);

        assert_eq!(
            SyncConfig::parse_checked("[app]\nversion = \"0.3.0\"\n"),
            Err(ConfigError::UnsupportedVersion("0.3.0".to_string()))
        );
        assert!(matches!(
            SyncConfig::parse_checked("[timing"),
            Err(ConfigError::Parse(_))
        ));
    }
}
