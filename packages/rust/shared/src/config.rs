//! Application configuration for the appraisal pipeline.
//!
//! User config lives at `~/.appraisal/appraisal.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppraisalError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "appraisal.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".appraisal";

/// Default collaborator cache file name inside the config directory.
const CACHE_FILE_NAME: &str = "collaborator-cache.db";

// ---------------------------------------------------------------------------
// Config structs (matching appraisal.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Stage sequencing and fusion policy.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Comparable sales processing.
    #[serde(default)]
    pub comparables: ComparablesConfig,

    /// Overall confidence rollup weights.
    #[serde(default)]
    pub rollup: RollupWeights,

    /// The narrative/extraction service every stage delegates to.
    #[serde(default)]
    pub collaborator: CollaboratorConfig,

    /// Optional dedicated command for the structured parcel lookup.
    #[serde(default)]
    pub structured_source: StructuredSourceConfig,

    /// Collaborator response cache.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Structured-source aggregate confidence at which it becomes authoritative.
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: f64,

    /// Run broad search as a verification pass even when the structured
    /// source is authoritative.
    #[serde(default)]
    pub verify_authoritative: bool,

    /// Upper bound for a single collaborator call.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// Sections below this confidence are flagged for human review.
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: default_promotion_threshold(),
            verify_authoritative: false,
            stage_timeout_secs: default_stage_timeout_secs(),
            review_threshold: default_review_threshold(),
        }
    }
}

fn default_promotion_threshold() -> f64 {
    0.8
}
fn default_stage_timeout_secs() -> u64 {
    120
}
fn default_review_threshold() -> f64 {
    0.6
}

/// `[comparables]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparablesConfig {
    /// Sales older than this many years before the valuation date are dropped.
    #[serde(default = "default_years_back")]
    pub years_back: u32,

    /// Comparables kept when the request does not say.
    #[serde(default = "default_number_of_comps")]
    pub default_number_of_comps: usize,
}

impl Default for ComparablesConfig {
    fn default() -> Self {
        Self {
            years_back: default_years_back(),
            default_number_of_comps: default_number_of_comps(),
        }
    }
}

fn default_years_back() -> u32 {
    3
}
fn default_number_of_comps() -> usize {
    5
}

/// `[rollup]` section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RollupWeights {
    #[serde(default = "default_attribute_weight")]
    pub attributes: f64,
    #[serde(default = "default_narrative_weight")]
    pub narratives: f64,
    #[serde(default = "default_valuation_weight")]
    pub valuations: f64,
}

impl Default for RollupWeights {
    fn default() -> Self {
        Self {
            attributes: default_attribute_weight(),
            narratives: default_narrative_weight(),
            valuations: default_valuation_weight(),
        }
    }
}

fn default_attribute_weight() -> f64 {
    0.4
}
fn default_narrative_weight() -> f64 {
    0.3
}
fn default_valuation_weight() -> f64 {
    0.3
}

/// Transport used to reach the narrative/extraction service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorKind {
    /// Long-lived subprocess speaking JSON lines.
    #[default]
    Bridge,
    /// HTTP endpoint accepting JSON requests.
    Http,
}

/// `[collaborator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    #[serde(default)]
    pub kind: CollaboratorKind,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier forwarded to the service and used as a cache key.
    #[serde(default = "default_model")]
    pub model: String,

    /// Bridge command (e.g., `bun`).
    #[serde(default = "default_bridge_cmd")]
    pub bridge_cmd: String,

    /// Bridge script path, passed as `run <script>`.
    #[serde(default = "default_bridge_script")]
    pub bridge_script: String,

    /// Working directory for the bridge (defaults to the current directory).
    #[serde(default)]
    pub bridge_working_dir: Option<String>,

    /// Endpoint for the HTTP transport.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Minimum ms between HTTP calls.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            kind: CollaboratorKind::default(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            bridge_cmd: default_bridge_cmd(),
            bridge_script: default_bridge_script(),
            bridge_working_dir: None,
            endpoint: None,
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_bridge_cmd() -> String {
    "bun".into()
}
fn default_bridge_script() -> String {
    "bridge/appraisal-bridge.ts".into()
}
fn default_min_interval_ms() -> u64 {
    500
}

/// `[structured_source]` section.
///
/// When `command` is set the structured lookup spawns it once per case
/// instead of going through the shared collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredSourceConfig {
    #[serde(default)]
    pub command: Option<String>,
    /// May contain `{address}`, `{city}`, `{county}`, `{state}`, `{zip}`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Provenance label for values from this source.
    #[serde(default = "default_structured_label")]
    pub label: String,
}

impl Default for StructuredSourceConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            label: default_structured_label(),
        }
    }
}

fn default_structured_label() -> String {
    "parcel-db".into()
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Database path (defaults to `~/.appraisal/collaborator-cache.db`).
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

fn default_true() -> bool {
    true
}

impl CacheConfig {
    /// Resolve the cache database location.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(p) => Ok(PathBuf::from(p)),
            None => Ok(config_dir()?.join(CACHE_FILE_NAME)),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline settings (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline settings, merged from the config file and CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub promotion_threshold: f64,
    pub verify_authoritative: bool,
    pub stage_timeout: Duration,
    pub years_back: u32,
    pub default_number_of_comps: usize,
    pub rollup: RollupWeights,
    /// Provenance label for structured-source values.
    pub structured_label: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            promotion_threshold: config.pipeline.promotion_threshold,
            verify_authoritative: config.pipeline.verify_authoritative,
            stage_timeout: Duration::from_secs(config.pipeline.stage_timeout_secs),
            years_back: config.comparables.years_back,
            default_number_of_comps: config.comparables.default_number_of_comps,
            rollup: config.rollup,
            structured_label: config.structured_source.label.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.appraisal/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| AppraisalError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.appraisal/appraisal.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| AppraisalError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        AppraisalError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject values the pipeline cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    let threshold = config.pipeline.promotion_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(AppraisalError::config(format!(
            "pipeline.promotion_threshold must be within [0, 1], got {threshold}"
        )));
    }
    if config.pipeline.stage_timeout_secs == 0 {
        return Err(AppraisalError::config(
            "pipeline.stage_timeout_secs must be greater than zero",
        ));
    }
    let w = &config.rollup;
    if [w.attributes, w.narratives, w.valuations]
        .iter()
        .any(|v| !v.is_finite() || *v < 0.0)
    {
        return Err(AppraisalError::config("rollup weights must be non-negative"));
    }
    if config.collaborator.kind == CollaboratorKind::Http {
        let endpoint = config.collaborator.endpoint.as_deref().ok_or_else(|| {
            AppraisalError::config("collaborator.endpoint is required for the http transport")
        })?;
        url::Url::parse(endpoint).map_err(|e| {
            AppraisalError::config(format!("collaborator.endpoint '{endpoint}' is invalid: {e}"))
        })?;
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| AppraisalError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| AppraisalError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| AppraisalError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the collaborator API key env var is set and non-empty.
///
/// Only the HTTP transport sends the key, so other transports always pass.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    if config.collaborator.kind != CollaboratorKind::Http {
        return Ok(());
    }
    let var_name = &config.collaborator.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(AppraisalError::config(format!(
            "collaborator API key not found. Set the {var_name} environment variable."
        ))),
    }
}
