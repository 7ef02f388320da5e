use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VortexConfig {
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub room: RoomConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub screen_share: ScreenShareConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
///
/// Without TURN, peers behind symmetric NATs or CGNAT never connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (for long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Sub-room a participant joins first
    #[serde(default = "default_sub_room")]
    pub default_sub_room: String,
    /// Upper bound on participants sharing one sub-room (enforced upstream)
    #[serde(default = "default_max_participants")]
    pub max_participants_per_sub_room: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// How long a connection may sit in `disconnected` before an ICE restart
    #[serde(default = "default_ice_restart_grace_ms")]
    pub ice_restart_grace_ms: u64,
    /// Delay before renegotiating after a track is added to a live connection
    #[serde(default = "default_track_update_delay_ms")]
    pub track_update_delay_ms: u64,
    /// How long a new link may stay short of `connected` before it is rebuilt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenShareConfig {
    /// Budget shared by every viewer of a share, in kbps
    #[serde(default = "default_share_total_kbps")]
    pub total_bitrate_kbps: u32,
    /// Per-viewer floor, in kbps
    #[serde(default = "default_share_min_kbps")]
    pub min_bitrate_kbps: u32,
    #[serde(default = "default_high_framerate")]
    pub high_framerate: u32,
    #[serde(default = "default_low_framerate")]
    pub low_framerate: u32,
    /// Viewer count above which the low framerate applies
    #[serde(default = "default_framerate_peer_threshold")]
    pub framerate_peer_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Opus frame length in milliseconds
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    /// Opus bitrate in kbps
    #[serde(default = "default_opus_bitrate")]
    pub opus_bitrate_kbps: u32,
    /// Noise gate threshold, RMS in 0..1
    #[serde(default = "default_gate_threshold")]
    pub gate_threshold: f32,
    #[serde(default = "default_gate_open_ratio")]
    pub gate_open_ratio: f32,
    #[serde(default = "default_gate_close_ratio")]
    pub gate_close_ratio: f32,
    #[serde(default = "default_gate_hold_ms")]
    pub gate_hold_ms: u64,
    #[serde(default = "default_gate_attack_ms")]
    pub gate_attack_ms: f32,
    #[serde(default = "default_gate_release_ms")]
    pub gate_release_ms: f32,
    /// Interval between gate decisions
    #[serde(default = "default_gate_interval_ms")]
    pub gate_interval_ms: u64,
    #[serde(default = "default_true")]
    pub denoise_enabled: bool,
    /// Suppression strength, 0..1
    #[serde(default = "default_denoise_intensity")]
    pub denoise_intensity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Wait after returning to the foreground before checking state
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// One entry of the ICE server list handed to the media transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            default_sub_room: default_sub_room(),
            max_participants_per_sub_room: default_max_participants(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ice_restart_grace_ms: default_ice_restart_grace_ms(),
            track_update_delay_ms: default_track_update_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ScreenShareConfig {
    fn default() -> Self {
        Self {
            total_bitrate_kbps: default_share_total_kbps(),
            min_bitrate_kbps: default_share_min_kbps(),
            high_framerate: default_high_framerate(),
            low_framerate: default_low_framerate(),
            framerate_peer_threshold: default_framerate_peer_threshold(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_ms: default_frame_ms(),
            opus_bitrate_kbps: default_opus_bitrate(),
            gate_threshold: default_gate_threshold(),
            gate_open_ratio: default_gate_open_ratio(),
            gate_close_ratio: default_gate_close_ratio(),
            gate_hold_ms: default_gate_hold_ms(),
            gate_attack_ms: default_gate_attack_ms(),
            gate_release_ms: default_gate_release_ms(),
            gate_interval_ms: default_gate_interval_ms(),
            denoise_enabled: true,
            denoise_intensity: default_denoise_intensity(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl IceConfig {
    /// Flatten into the server list the media transport expects: one STUN
    /// entry, plus one TURN entry carrying the credentials when configured.
    pub fn servers(&self) -> Vec<IceServerConfig> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServerConfig {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !self.turn_urls.is_empty() {
            servers.push(IceServerConfig {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }
}

impl VortexConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the session should not start) or
    /// "WARNING:" (advisory, the session can start but the config is likely wrong).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: turn_urls are set without turn_username/turn_credential. \
                 Most TURN servers reject unauthenticated allocations."
                    .to_string(),
            );
        }
        if self.ice.stun_urls.is_empty() && self.ice.turn_urls.is_empty() {
            issues.push(
                "WARNING: no ICE servers configured. Only peers on the same network will connect."
                    .to_string(),
            );
        }

        // --- Room ---
        if self.room.default_sub_room.trim().is_empty() {
            issues.push("ERROR: room.default_sub_room must not be empty.".to_string());
        }
        if self.room.max_participants_per_sub_room < 2 {
            issues.push(format!(
                "ERROR: room.max_participants_per_sub_room must be at least 2, got {}.",
                self.room.max_participants_per_sub_room
            ));
        }

        // --- Screen share budget ---
        let share = &self.screen_share;
        if share.total_bitrate_kbps == 0 {
            issues.push("ERROR: screen_share.total_bitrate_kbps must be > 0.".to_string());
        }
        if share.min_bitrate_kbps > share.total_bitrate_kbps {
            issues.push(format!(
                "ERROR: screen_share.min_bitrate_kbps ({}) exceeds total_bitrate_kbps ({}).",
                share.min_bitrate_kbps, share.total_bitrate_kbps
            ));
        }
        let max_viewers = self.room.max_participants_per_sub_room.saturating_sub(1);
        if u64::from(share.min_bitrate_kbps) * u64::from(max_viewers)
            > u64::from(share.total_bitrate_kbps)
        {
            issues.push(format!(
                "WARNING: screen_share.min_bitrate_kbps ({}) x {} viewers exceeds the \
                 {} kbps budget. Full sub-rooms will exceed the shared budget.",
                share.min_bitrate_kbps, max_viewers, share.total_bitrate_kbps
            ));
        }
        if share.high_framerate == 0 || share.high_framerate > 120 {
            issues.push(format!(
                "ERROR: screen_share.high_framerate must be between 1 and 120, got {}.",
                share.high_framerate
            ));
        }
        if share.low_framerate == 0 {
            issues.push("ERROR: screen_share.low_framerate must be >= 1.".to_string());
        } else if share.low_framerate > share.high_framerate {
            issues.push(format!(
                "WARNING: screen_share.low_framerate ({}) is above high_framerate ({}).",
                share.low_framerate, share.high_framerate
            ));
        }

        // --- Audio ---
        let audio = &self.audio;
        if !matches!(audio.sample_rate, 8000 | 12000 | 16000 | 24000 | 48000) {
            issues.push(format!(
                "ERROR: audio.sample_rate {} is not supported by Opus \
                 (8000, 12000, 16000, 24000, 48000).",
                audio.sample_rate
            ));
        }
        if !matches!(audio.channels, 1 | 2) {
            issues.push(format!(
                "ERROR: audio.channels must be 1 or 2, got {}.",
                audio.channels
            ));
        }
        if !matches!(audio.frame_ms, 10 | 20 | 40 | 60) {
            issues.push(format!(
                "ERROR: audio.frame_ms must be one of 10, 20, 40, 60, got {}.",
                audio.frame_ms
            ));
        }
        if !(0.0..1.0).contains(&audio.gate_threshold) {
            issues.push(format!(
                "ERROR: audio.gate_threshold must be in [0, 1), got {}.",
                audio.gate_threshold
            ));
        }
        if audio.gate_close_ratio >= audio.gate_open_ratio {
            issues.push(format!(
                "ERROR: audio.gate_close_ratio ({}) must be below gate_open_ratio ({}) \
                 or the gate will chatter.",
                audio.gate_close_ratio, audio.gate_open_ratio
            ));
        }
        if audio.gate_attack_ms <= 0.0 || audio.gate_release_ms <= 0.0 {
            issues.push("ERROR: audio.gate_attack_ms and gate_release_ms must be > 0.".to_string());
        }
        if audio.gate_interval_ms == 0 {
            issues.push("ERROR: audio.gate_interval_ms must be > 0.".to_string());
        }
        if !(0.0..=1.0).contains(&audio.denoise_intensity) {
            issues.push(format!(
                "ERROR: audio.denoise_intensity must be between 0 and 1, got {}.",
                audio.denoise_intensity
            ));
        }

        // --- Timers ---
        if self.connection.ice_restart_grace_ms == 0 {
            issues.push(
                "WARNING: connection.ice_restart_grace_ms is 0. Every transient \
                 disconnect will trigger an ICE restart."
                    .to_string(),
            );
        }
        if self.connection.connect_timeout_ms <= self.connection.ice_restart_grace_ms {
            issues.push(format!(
                "ERROR: connection.connect_timeout_ms ({}) must be greater than \
                 connection.ice_restart_grace_ms ({}).",
                self.connection.connect_timeout_ms, self.connection.ice_restart_grace_ms
            ));
        }
        if self.stats.poll_interval_ms == 0 {
            issues.push("ERROR: stats.poll_interval_ms must be > 0.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    ///
    /// Returns a "WARNING:" line for every variable that is present but unusable.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut issues = Vec::new();

        if let Some(key) = lookup("VORTEX_METERED_API_KEY").filter(|k| !k.is_empty()) {
            self.ice.turn_urls = vec![
                "turn:global.relay.metered.ca:80".to_string(),
                "turn:global.relay.metered.ca:443".to_string(),
                "turns:global.relay.metered.ca:443".to_string(),
            ];
            self.ice.turn_username = lookup("VORTEX_METERED_USERNAME").or(Some(key.clone()));
            self.ice.turn_credential = Some(key);
        } else if let Some(domain) = lookup("VORTEX_TURN_DOMAIN").filter(|d| !d.is_empty()) {
            self.ice.turn_urls = vec![
                format!("turn:{domain}:3478?transport=udp"),
                format!("turn:{domain}:3478?transport=tcp"),
                format!("turns:{domain}:5349"),
            ];
            self.ice.turn_username = lookup("VORTEX_TURN_USERNAME");
            self.ice.turn_credential = lookup("VORTEX_TURN_CREDENTIAL");
        }

        if let Some(raw) = lookup("VORTEX_GATE_THRESHOLD") {
            match raw.trim().parse::<f32>() {
                Ok(v) => self.audio.gate_threshold = v,
                Err(_) => issues.push(format!(
                    "WARNING: VORTEX_GATE_THRESHOLD '{raw}' is not a number, ignored."
                )),
            }
        }
        if let Some(raw) = lookup("VORTEX_DENOISE") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => self.audio.denoise_enabled = true,
                "0" | "false" | "off" | "no" => self.audio.denoise_enabled = false,
                _ => issues.push(format!(
                    "WARNING: VORTEX_DENOISE '{raw}' is not a boolean, ignored."
                )),
            }
        }
        for (var, field) in [
            (
                "VORTEX_SCREEN_SHARE_TOTAL_KBPS",
                &mut self.screen_share.total_bitrate_kbps,
            ),
            (
                "VORTEX_SCREEN_SHARE_MIN_KBPS",
                &mut self.screen_share.min_bitrate_kbps,
            ),
        ] {
            if let Some(raw) = lookup(var) {
                match raw.trim().parse::<u32>() {
                    Ok(v) => *field = v,
                    Err(_) => issues.push(format!(
                        "WARNING: {var} '{raw}' is not a whole number of kbps, ignored."
                    )),
                }
            }
        }

        issues
    }
}

fn default_sub_room() -> String {
    crate::DEFAULT_SUB_ROOM.to_string()
}
fn default_max_participants() -> u32 {
    10
}
fn default_ice_restart_grace_ms() -> u64 {
    2000
}
fn default_track_update_delay_ms() -> u64 {
    100
}
fn default_connect_timeout_ms() -> u64 {
    15_000
}
fn default_share_total_kbps() -> u32 {
    4000
}
fn default_share_min_kbps() -> u32 {
    250
}
fn default_high_framerate() -> u32 {
    30
}
fn default_low_framerate() -> u32 {
    15
}
fn default_framerate_peer_threshold() -> u32 {
    4
}
fn default_sample_rate() -> u32 {
    48000
}
fn default_channels() -> u16 {
    1
}
fn default_frame_ms() -> u32 {
    20
}
fn default_opus_bitrate() -> u32 {
    64
}
fn default_gate_threshold() -> f32 {
    0.01
}
fn default_gate_open_ratio() -> f32 {
    1.1
}
fn default_gate_close_ratio() -> f32 {
    0.8
}
fn default_gate_hold_ms() -> u64 {
    250
}
fn default_gate_attack_ms() -> f32 {
    3.0
}
fn default_gate_release_ms() -> f32 {
    60.0
}
fn default_gate_interval_ms() -> u64 {
    50
}
fn default_true() -> bool {
    true
}
fn default_denoise_intensity() -> f32 {
    0.5
}
fn default_settle_delay_ms() -> u64 {
    500
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_from_empty_string() {
        let config: VortexConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn_urls.is_empty());
        assert!(config.ice.turn_username.is_none());

        assert_eq!(config.room.default_sub_room, "general");
        assert_eq!(config.room.max_participants_per_sub_room, 10);

        assert_eq!(config.connection.ice_restart_grace_ms, 2000);
        assert_eq!(config.connection.connect_timeout_ms, 15_000);

        assert_eq!(config.screen_share.total_bitrate_kbps, 4000);
        assert_eq!(config.screen_share.min_bitrate_kbps, 250);
        assert_eq!(config.screen_share.high_framerate, 30);
        assert_eq!(config.screen_share.low_framerate, 15);
        assert_eq!(config.screen_share.framerate_peer_threshold, 4);

        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.gate_threshold, 0.01);
        assert_eq!(config.audio.gate_open_ratio, 1.1);
        assert_eq!(config.audio.gate_close_ratio, 0.8);
        assert_eq!(config.audio.gate_hold_ms, 250);
        assert_eq!(config.audio.gate_interval_ms, 50);
        assert!(config.audio.denoise_enabled);

        assert_eq!(config.recovery.settle_delay_ms, 500);
        assert_eq!(config.stats.poll_interval_ms, 1000);
    }

    #[test]
    fn partial_config_only_screen_share_section() {
        let toml_str = r#"
[screen_share]
total_bitrate_kbps = 8000
low_framerate = 10
"#;
        let config: VortexConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.screen_share.total_bitrate_kbps, 8000);
        assert_eq!(config.screen_share.low_framerate, 10);
        // Untouched fields keep their defaults
        assert_eq!(config.screen_share.min_bitrate_kbps, 250);
        assert_eq!(config.screen_share.high_framerate, 30);
        assert_eq!(config.audio.gate_hold_ms, 250);
        assert_eq!(config.ice.stun_urls.len(), 2);
    }

    #[test]
    fn custom_values_override_defaults() {
        let toml_str = r#"
[ice]
stun_urls = ["stun:custom.stun.example.com:3478"]
turn_urls = ["turn:turn.example.com:3478"]
turn_username = "user"
turn_credential = "pass"

[audio]
gate_threshold = 0.02
denoise_enabled = false
denoise_intensity = 0.8

[recovery]
settle_delay_ms = 750
"#;
        let config: VortexConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.ice.stun_urls, vec!["stun:custom.stun.example.com:3478"]);
        assert_eq!(config.ice.turn_urls, vec!["turn:turn.example.com:3478"]);
        assert_eq!(config.ice.turn_username.as_deref(), Some("user"));
        assert_eq!(config.audio.gate_threshold, 0.02);
        assert!(!config.audio.denoise_enabled);
        assert_eq!(config.audio.denoise_intensity, 0.8);
        assert_eq!(config.recovery.settle_delay_ms, 750);
    }

    #[test]
    fn default_trait_matches_empty_toml() {
        let from_toml: VortexConfig = toml::from_str("").unwrap();
        let defaults = VortexConfig::default();
        assert_eq!(defaults.ice.stun_urls, from_toml.ice.stun_urls);
        assert_eq!(
            defaults.screen_share.total_bitrate_kbps,
            from_toml.screen_share.total_bitrate_kbps
        );
        assert_eq!(defaults.audio.gate_threshold, from_toml.audio.gate_threshold);
        assert_eq!(defaults.audio.denoise_enabled, from_toml.audio.denoise_enabled);
        assert_eq!(
            defaults.connection.ice_restart_grace_ms,
            from_toml.connection.ice_restart_grace_ms
        );
    }

    #[test]
    fn ice_servers_group_turn_credentials() {
        let mut ice = IceConfig::default();
        assert_eq!(ice.servers().len(), 1);

        ice.turn_urls = vec!["turn:t.example.com:3478".to_string()];
        ice.turn_username = Some("u".to_string());
        ice.turn_credential = Some("c".to_string());
        let servers = ice.servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username.as_deref(), Some("u"));
        assert!(servers[0].credential.is_none());
    }

    // --- Validation tests ---

    fn validate_issues(config: &VortexConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(VortexConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_bad_ice_schemes() {
        let mut config = VortexConfig::default();
        config.ice.stun_urls = vec!["http://stun.example.com".to_string()];
        config.ice.turn_urls = vec!["stun:wrong.example.com".to_string()];
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "STUN URL"));
        assert!(has_error(&issues, "TURN URL"));
        assert!(has_warning(&issues, "turn_username"));
    }

    #[test]
    fn validate_share_floor_against_budget() {
        let mut config = VortexConfig::default();
        config.screen_share.min_bitrate_kbps = 500;
        // 500 x 9 viewers > 4000
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "min_bitrate_kbps"));

        config.screen_share.min_bitrate_kbps = 5000;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "exceeds total_bitrate_kbps"));
    }

    #[test]
    fn validate_gate_ratios_must_not_cross() {
        let mut config = VortexConfig::default();
        config.audio.gate_close_ratio = 1.2;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "gate_close_ratio"));
    }

    #[test]
    fn validate_audio_format() {
        let mut config = VortexConfig::default();
        config.audio.sample_rate = 44100;
        config.audio.channels = 6;
        config.audio.denoise_intensity = 1.5;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "sample_rate"));
        assert!(has_error(&issues, "channels"));
        assert!(has_error(&issues, "denoise_intensity"));
    }

    #[test]
    fn validate_connect_timeout_exceeds_restart_grace() {
        let mut config = VortexConfig::default();
        config.connection.connect_timeout_ms = config.connection.ice_restart_grace_ms;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "connect_timeout_ms"));
    }

    #[test]
    fn validate_zero_framerate_is_error() {
        let mut config = VortexConfig::default();
        config.screen_share.high_framerate = 0;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "high_framerate"));
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_turn_domain_builds_coturn_urls() {
        let mut config = VortexConfig::default();
        let issues = config.apply_env_overrides(env(&[
            ("VORTEX_TURN_DOMAIN", "turn.example.org"),
            ("VORTEX_TURN_USERNAME", "u"),
            ("VORTEX_TURN_CREDENTIAL", "p"),
        ]));
        assert!(issues.is_empty());
        assert_eq!(config.ice.turn_urls.len(), 3);
        assert_eq!(
            config.ice.turn_urls[0],
            "turn:turn.example.org:3478?transport=udp"
        );
        assert_eq!(config.ice.turn_urls[2], "turns:turn.example.org:5349");
        assert_eq!(config.ice.turn_credential.as_deref(), Some("p"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_metered_key_takes_precedence() {
        let mut config = VortexConfig::default();
        config.apply_env_overrides(env(&[
            ("VORTEX_TURN_DOMAIN", "turn.example.org"),
            ("VORTEX_METERED_API_KEY", "k123"),
        ]));
        assert!(config.ice.turn_urls[0].contains("metered.ca"));
        assert_eq!(config.ice.turn_credential.as_deref(), Some("k123"));
    }

    #[test]
    fn env_audio_and_share_overrides() {
        let mut config = VortexConfig::default();
        let issues = config.apply_env_overrides(env(&[
            ("VORTEX_GATE_THRESHOLD", "0.05"),
            ("VORTEX_DENOISE", "off"),
            ("VORTEX_SCREEN_SHARE_TOTAL_KBPS", "6000"),
            ("VORTEX_SCREEN_SHARE_MIN_KBPS", "lots"),
        ]));
        assert_eq!(config.audio.gate_threshold, 0.05);
        assert!(!config.audio.denoise_enabled);
        assert_eq!(config.screen_share.total_bitrate_kbps, 6000);
        assert_eq!(config.screen_share.min_bitrate_kbps, 250);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("VORTEX_SCREEN_SHARE_MIN_KBPS"));
    }
}
