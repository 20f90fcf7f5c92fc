//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level VoxRelay configuration.
///
/// Every section is optional; the accessors on [`Config`] return the
/// effective section with defaults filled in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<JitterConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<FlowConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub barge_in: Option<BargeInConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference: Option<InferenceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- Server ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Malformed units tolerated per connection before it is closed.
    #[serde(default = "default_max_violations")]
    pub max_violations: u32,

    /// Session idle timeout in milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Time allowed between connect and a valid `start`.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Outbound messages buffered per connection.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            auth: None,
            admission: AdmissionConfig::default(),
            max_violations: default_max_violations(),
            idle_timeout_ms: default_idle_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

fn default_port() -> u16 {
    18790
}

fn default_max_violations() -> u32 {
    5
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_outbound_queue() -> usize {
    256
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Auth mode: "none", "token", or "password". Default: "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

impl AuthConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    pub fn resolve_password(&self) -> Option<String> {
        resolve_secret_field(&self.password, &self.password_env)
    }

    pub fn effective_mode(&self) -> &str {
        self.mode.as_deref().unwrap_or("none")
    }
}

/// Connection admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Concurrent connections across the whole server.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Connections per client IP within a one-minute window.
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,

    /// New connections accepted per second across the server.
    #[serde(default = "default_max_accepts_per_sec")]
    pub max_accepts_per_sec: u32,

    /// Live sessions across the whole server.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_connections_per_ip: default_max_connections_per_ip(),
            max_accepts_per_sec: default_max_accepts_per_sec(),
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_connections_per_ip() -> u32 {
    16
}

fn default_max_accepts_per_sec() -> u32 {
    200
}

fn default_max_sessions() -> usize {
    1024
}

// --- Media ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_sample_rates")]
    pub sample_rates: Vec<u32>,

    #[serde(default = "default_min_bitrate")]
    pub min_bitrate: u32,

    #[serde(default = "default_max_bitrate")]
    pub max_bitrate: u32,

    /// Nominal frame duration in milliseconds.
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,

    /// Largest accepted frame payload in bytes.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            sample_rates: default_sample_rates(),
            min_bitrate: default_min_bitrate(),
            max_bitrate: default_max_bitrate(),
            frame_ms: default_frame_ms(),
            max_payload: default_max_payload(),
        }
    }
}

fn default_sample_rates() -> Vec<u32> {
    vec![8000, 16000, 24000, 48000]
}

fn default_min_bitrate() -> u32 {
    6000
}

fn default_max_bitrate() -> u32 {
    510_000
}

fn default_frame_ms() -> u32 {
    20
}

fn default_max_payload() -> usize {
    4096
}

// --- Jitter buffer ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitterConfig {
    #[serde(default = "default_min_depth_ms")]
    pub min_depth_ms: u64,

    #[serde(default = "default_max_depth_ms")]
    pub max_depth_ms: u64,

    /// How long a hole may block later frames before it is concealed.
    #[serde(default = "default_loss_tolerance_ms")]
    pub loss_tolerance_ms: u64,

    /// Holding area size in frames.
    #[serde(default = "default_jitter_capacity")]
    pub capacity: usize,

    /// Target depth = frame duration + multiplier * estimated jitter.
    #[serde(default = "default_jitter_multiplier")]
    pub jitter_multiplier: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_depth_ms: default_min_depth_ms(),
            max_depth_ms: default_max_depth_ms(),
            loss_tolerance_ms: default_loss_tolerance_ms(),
            capacity: default_jitter_capacity(),
            jitter_multiplier: default_jitter_multiplier(),
        }
    }
}

fn default_min_depth_ms() -> u64 {
    40
}

fn default_max_depth_ms() -> u64 {
    80
}

fn default_loss_tolerance_ms() -> u64 {
    60
}

fn default_jitter_capacity() -> usize {
    64
}

fn default_jitter_multiplier() -> f64 {
    3.0
}

// --- Flow control ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Depth (frames) at or below which backpressure clears.
    #[serde(default = "default_flow_low")]
    pub low: usize,

    /// Depth (frames) at or above which backpressure is asserted.
    #[serde(default = "default_flow_high")]
    pub high: usize,

    /// Depth (frames) beyond which frames are shed.
    #[serde(default = "default_flow_ceiling")]
    pub hard_ceiling: usize,

    /// Fraction of the negotiated bitrate suggested while asserted.
    #[serde(default = "default_reduced_bitrate_factor")]
    pub reduced_bitrate_factor: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            low: default_flow_low(),
            high: default_flow_high(),
            hard_ceiling: default_flow_ceiling(),
            reduced_bitrate_factor: default_reduced_bitrate_factor(),
        }
    }
}

fn default_flow_low() -> usize {
    8
}

fn default_flow_high() -> usize {
    24
}

fn default_flow_ceiling() -> usize {
    48
}

fn default_reduced_bitrate_factor() -> f64 {
    0.5
}

// --- Barge-in ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BargeInConfig {
    /// Silence required before the user is considered done speaking.
    #[serde(default = "default_hangover_ms")]
    pub hangover_ms: u64,

    /// Bound on waiting for a synthesis cancellation acknowledgement.
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            hangover_ms: default_hangover_ms(),
            cancel_timeout_ms: default_cancel_timeout_ms(),
        }
    }
}

fn default_hangover_ms() -> u64 {
    300
}

fn default_cancel_timeout_ms() -> u64 {
    50
}

// --- Inference ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default)]
    pub recognition: StageConfig,

    #[serde(default)]
    pub reasoning: StageConfig,

    #[serde(default)]
    pub synthesis: StageConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub gating: GatingConfig,

    #[serde(default)]
    pub segmenter: SegmenterConfig,

    /// System prompt prepended to every reasoning turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Configuration for one external inference stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Provider id: "loopback" (default), "openai", "groq", "ollama", "elevenlabs".
    #[serde(default = "default_stage_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Synthesis voice id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Bounded queue depth between the router and the stage.
    #[serde(default = "default_stage_queue")]
    pub queue: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            provider: default_stage_provider(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            model: None,
            voice: None,
            queue: default_stage_queue(),
        }
    }
}

impl StageConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn is_loopback(&self) -> bool {
        self.provider == "loopback"
    }
}

fn default_stage_provider() -> String {
    "loopback".into()
}

fn default_stage_queue() -> usize {
    64
}

/// Reconnection policy for dropped stage streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Randomizes each delay by up to +/- factor * delay.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2000
}

fn default_jitter_factor() -> f64 {
    0.2
}

/// When recognized text is handed to the reasoning stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatingConfig {
    /// A partial at or above this confidence may open the gate early.
    #[serde(default = "default_partial_confidence")]
    pub partial_confidence: f32,

    /// Quiet time after a confident partial before the gate opens.
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            partial_confidence: default_partial_confidence(),
            pause_ms: default_pause_ms(),
        }
    }
}

fn default_partial_confidence() -> f32 {
    0.85
}

fn default_pause_ms() -> u64 {
    600
}

/// How reasoning tokens are grouped into speakable units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Clause punctuation only splits once this many chars are pending.
    #[serde(default = "default_min_clause_chars")]
    pub min_clause_chars: usize,

    /// Pending text is force-split at whitespace beyond this length.
    #[serde(default = "default_max_unit_chars")]
    pub max_unit_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_clause_chars: default_min_clause_chars(),
            max_unit_chars: default_max_unit_chars(),
        }
    }
}

fn default_min_clause_chars() -> usize {
    24
}

fn default_max_unit_chars() -> usize {
    160
}

// --- Logging ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voxrelay_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Provider ids the inference crate knows how to build, per stage.
pub const RECOGNITION_PROVIDERS: &[&str] = &["loopback", "openai", "groq"];
pub const REASONING_PROVIDERS: &[&str] = &["loopback", "openai", "openrouter", "ollama"];
pub const SYNTHESIS_PROVIDERS: &[&str] = &["loopback", "elevenlabs"];

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config = Self::parse(&raw)?;
        tracing::debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Parse config text (JSON5), substituting `${ENV_VAR}` references.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::VoxRelayError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    pub fn media(&self) -> MediaConfig {
        self.media.clone().unwrap_or_default()
    }

    pub fn jitter(&self) -> JitterConfig {
        self.jitter.clone().unwrap_or_default()
    }

    pub fn flow(&self) -> FlowConfig {
        self.flow.clone().unwrap_or_default()
    }

    pub fn barge_in(&self) -> BargeInConfig {
        self.barge_in.clone().unwrap_or_default()
    }

    pub fn inference(&self) -> InferenceConfig {
        self.inference.clone().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.server.as_ref().map(|s| s.port).unwrap_or_else(default_port)
    }

    pub fn bind_addr(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Effective auth mode ("none" when unconfigured).
    pub fn auth_mode(&self) -> &str {
        self.server
            .as_ref()
            .and_then(|s| s.auth.as_ref())
            .map(|a| a.effective_mode())
            .unwrap_or("none")
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let server = self.server();
        if server.port == 0 {
            errors.push("Server port cannot be 0".to_string());
        }
        if server.max_violations == 0 {
            errors.push("server.max_violations must be at least 1".to_string());
        }
        match self.auth_mode() {
            "none" => {}
            "token" => {
                if server.auth.as_ref().and_then(|a| a.resolve_token()).is_none() {
                    errors.push("Auth mode 'token' but no token configured".to_string());
                }
            }
            "password" => {
                if server.auth.as_ref().and_then(|a| a.resolve_password()).is_none() {
                    errors.push("Auth mode 'password' but no password configured".to_string());
                }
            }
            other => errors.push(format!("Unknown auth mode '{other}'")),
        }

        let jitter = self.jitter();
        if jitter.min_depth_ms > jitter.max_depth_ms {
            errors.push(format!(
                "jitter.min_depth_ms ({}) exceeds jitter.max_depth_ms ({})",
                jitter.min_depth_ms, jitter.max_depth_ms
            ));
        }
        if jitter.capacity < 2 {
            errors.push("jitter.capacity must be at least 2".to_string());
        }

        let flow = self.flow();
        if flow.low >= flow.high {
            errors.push(format!(
                "flow.low ({}) must be below flow.high ({})",
                flow.low, flow.high
            ));
        }
        if flow.hard_ceiling < flow.high {
            errors.push(format!(
                "flow.hard_ceiling ({}) must not be below flow.high ({})",
                flow.hard_ceiling, flow.high
            ));
        }

        let inference = self.inference();
        for (stage, cfg, known) in [
            ("recognition", &inference.recognition, RECOGNITION_PROVIDERS),
            ("reasoning", &inference.reasoning, REASONING_PROVIDERS),
            ("synthesis", &inference.synthesis, SYNTHESIS_PROVIDERS),
        ] {
            if !known.contains(&cfg.provider.as_str()) {
                errors.push(format!("Unknown {stage} provider '{}'", cfg.provider));
            } else if !cfg.is_loopback() && cfg.provider != "ollama" && cfg.resolve_api_key().is_none() {
                warnings.push(format!(
                    "Provider '{}' for {stage} has no API key configured",
                    cfg.provider
                ));
            }
            if cfg.queue == 0 {
                errors.push(format!("inference.{stage}.queue must be at least 1"));
            }
        }
        if inference.retry.max_attempts == 0 {
            errors.push("inference.retry.max_attempts must be at least 1".to_string());
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for VoxRelay data: `~/.voxrelay/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxrelay")
}
