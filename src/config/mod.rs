//! Layered configuration: a project file checked into the repository, a user
//! file with personal secrets and overrides, and `LLM_*` environment
//! variables on top. [`loader`] merges the layers into an immutable
//! [`MergedConfig`] snapshot.

pub mod loader;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use self::loader::{ConfigError, load, load_from};

// ---------------------------------------------------------------------------
// Model registry entries
// ---------------------------------------------------------------------------

/// Billing unit a model meters in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    #[default]
    Token,
    Image,
    AudioSecond,
    Character,
}

/// Capability flags advertised by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Vision,
    Tts,
    Asr,
    ImageGen,
    VideoGen,
    Thinking,
}

/// Per-unit pricing in USD. Token and character rates are per 1M units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub input_per_1m: f64,
    #[serde(default)]
    pub output_per_1m: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_image: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_second: Option<f64>,
    /// Cost per 1M characters, for character-metered (TTS) models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_character: Option<f64>,
}

/// Rate limits for one model. `None` means unlimited for that window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub rpm: Option<u32>,
    #[serde(default)]
    pub tpm: Option<u64>,
    #[serde(default)]
    pub rpd: Option<u32>,
}

/// Concrete model record resolved from an alias.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub alias: String,
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub unit_type: UnitType,
    #[serde(default)]
    pub pricing: Pricing,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub extra_config: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Endpoints and routing
// ---------------------------------------------------------------------------

/// Network location serving one provider, tagged with a region for
/// data-residency filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub provider: String,
    pub url: String,
    pub region: String,
}

/// A named routing strategy entry. Order in the merged list is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub name: String,
    pub strategy: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Scalar sections
// ---------------------------------------------------------------------------

/// Retry and wait tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_s")]
    pub base_delay_s: f64,
    #[serde(default = "default_max_delay_s")]
    pub max_delay_s: f64,
    #[serde(default = "default_true")]
    pub wait_on_rate_limit: bool,
    /// Total back-off sleep allowed per call.
    #[serde(default = "default_retry_budget_s")]
    pub retry_budget_s: f64,
    /// Hard ceiling on cumulative rate-limit waiting per call.
    #[serde(default = "default_max_wait_timeout_s")]
    pub max_wait_timeout_s: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_s: default_base_delay_s(),
            max_delay_s: default_max_delay_s(),
            wait_on_rate_limit: true,
            retry_budget_s: default_retry_budget_s(),
            max_wait_timeout_s: default_max_wait_timeout_s(),
        }
    }
}

/// Daily spend guardrail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Daily cap in USD. Zero rejects every call; negative disables the cap.
    #[serde(default = "default_daily_spend_limit")]
    pub daily_spend_limit_usd: f64,
    /// Fraction of the cap at which a once-per-day warning fires.
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,
    /// Strict mode records a durable hold before admitting a call.
    #[serde(default)]
    pub strict: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_spend_limit_usd: default_daily_spend_limit(),
            warn_ratio: default_warn_ratio(),
            strict: false,
        }
    }
}

/// Network shaping knobs the core passes through to adapters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub proxy_bypass_enabled: bool,
    /// Provider names whose traffic skips the configured proxy.
    #[serde(default)]
    pub bypass_proxy: Vec<String>,
}

impl NetworkConfig {
    /// Providers that bypass the proxy, empty unless bypassing is enabled.
    pub fn proxy_bypass_providers(&self) -> BTreeSet<String> {
        if self.proxy_bypass_enabled {
            self.bypass_proxy.iter().cloned().collect()
        } else {
            BTreeSet::new()
        }
    }
}

const fn default_max_retries() -> u32 {
    3
}
const fn default_base_delay_s() -> f64 {
    1.0
}
const fn default_max_delay_s() -> f64 {
    60.0
}
const fn default_true() -> bool {
    true
}
const fn default_retry_budget_s() -> f64 {
    120.0
}
const fn default_max_wait_timeout_s() -> f64 {
    300.0
}
const fn default_daily_spend_limit() -> f64 {
    1.0
}
const fn default_warn_ratio() -> f64 {
    0.8
}

// ---------------------------------------------------------------------------
// File layers
// ---------------------------------------------------------------------------

/// Repository-level layer (`llm.project.yaml` + `llm.project.d/*.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub model_registry: BTreeMap<String, ModelSpec>,
    #[serde(default)]
    pub routing_policies: Vec<RoutingPolicy>,
    #[serde(default)]
    pub data_residency: DataResidency,
    #[serde(default)]
    pub resilience: Option<ResilienceConfig>,
    #[serde(default)]
    pub budget: Option<BudgetConfig>,
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataResidency {
    /// Absent list = unrestricted. An explicitly empty list combined with
    /// configured endpoints is rejected at load time.
    #[serde(default)]
    pub allowed_regions: Option<Vec<String>>,
}

/// User-level layer (`config.yaml`): secrets, endpoints, personal overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub api_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub daily_spend_limit: Option<f64>,
    #[serde(default)]
    pub personal_model_overrides: BTreeMap<String, ModelSpec>,
    #[serde(default)]
    pub personal_routing_policies: Vec<RoutingPolicy>,
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub resilience: Option<ResilienceConfig>,
}

// ---------------------------------------------------------------------------
// Merged snapshot
// ---------------------------------------------------------------------------

/// Counters produced while merging; useful for diagnosing silently-filtered
/// configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeDiagnostics {
    /// User endpoints dropped by the residency filter.
    pub endpoints_dropped_by_residency: u32,
    /// User routing policies dropped because a project policy owns the name.
    pub policy_conflicts: u32,
}

/// Immutable merged configuration snapshot. Built once per process (or per
/// explicit reload between calls) and shared read-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergedConfig {
    pub api_keys: BTreeMap<String, String>,
    pub endpoints: Vec<Endpoint>,
    pub model_registry: BTreeMap<String, ModelSpec>,
    pub routing_policies: Vec<RoutingPolicy>,
    pub allowed_regions: Option<BTreeSet<String>>,
    pub resilience: ResilienceConfig,
    pub budget: BudgetConfig,
    pub network: NetworkConfig,
    pub diagnostics: MergeDiagnostics,
}

impl MergedConfig {
    /// Whether a region passes the residency filter.
    pub fn region_allowed(&self, region: &str) -> bool {
        match &self.allowed_regions {
            Some(set) => set.contains(region),
            None => true,
        }
    }

    /// Look up a model spec by alias.
    pub fn model(&self, alias: &str) -> Option<&ModelSpec> {
        self.model_registry.get(alias)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
