//! Loading and merging of the configuration layers.
//!
//! Precedence for scalars: explicit API argument > environment variable >
//! user file > project file > built-in default. Structured sections merge
//! with section-specific rules (overlay, append, filter) described on
//! [`merge`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use super::{MergeDiagnostics, MergedConfig, ModelSpec, ProjectConfig, UserConfig};

/// Errors detected while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("model '{alias}' references unknown provider '{provider}'")]
    UnknownProvider { alias: String, provider: String },

    #[error("model '{alias}' has a negative {field}")]
    NegativeLimit { alias: String, field: &'static str },

    #[error("data_residency.allowed_regions is empty but {endpoints} endpoint(s) are configured")]
    EmptyAllowedRegions { endpoints: usize },

    #[error("invalid value for {var}: {value}")]
    InvalidEnvValue { var: String, value: String },
}

/// Project file name at the working directory root.
pub const PROJECT_FILE: &str = "llm.project.yaml";
/// Directory of project fragments, applied in sorted order after the file.
pub const PROJECT_FRAGMENT_DIR: &str = "llm.project.d";
/// User file name looked up in the working directory first.
pub const USER_FILE: &str = "config.yaml";

/// Load and merge configuration from the conventional locations relative to
/// the current working directory, then overlay environment variables.
pub fn load() -> Result<MergedConfig, ConfigError> {
    let cwd = std::env::current_dir().map_err(|source| ConfigError::Io {
        path: PathBuf::from("."),
        source,
    })?;
    let user_path = if cwd.join(USER_FILE).exists() {
        cwd.join(USER_FILE)
    } else {
        user_config_home().join("llm-sdk").join(USER_FILE)
    };
    load_from(&cwd.join(PROJECT_FILE), &user_path)
}

/// Load and merge configuration from explicit file paths.
///
/// Either file may be missing, in which case that layer is empty. Project
/// fragments under `<project-dir>/llm.project.d/*.yaml` are overlaid onto the
/// project layer in sorted filename order, later fragments winning.
pub fn load_from(project_path: &Path, user_path: &Path) -> Result<MergedConfig, ConfigError> {
    let mut project: ProjectConfig = read_yaml(project_path)?.unwrap_or_default();

    if let Some(dir) = project_path.parent() {
        for fragment in sorted_fragments(&dir.join(PROJECT_FRAGMENT_DIR)) {
            if let Some(extra) = read_yaml::<ProjectConfig>(&fragment)? {
                overlay_project(&mut project, extra);
            }
        }
    }

    let user: UserConfig = read_yaml(user_path)?.unwrap_or_default();

    let mut merged = merge(project, user)?;
    apply_env_overrides(&mut merged)?;
    validate(&merged)?;
    Ok(merged)
}

fn user_config_home() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_yaml::from_str(&content)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn sorted_fragments(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "yaml" || ext == "yml"))
        .collect();
    paths.sort();
    paths
}

/// Overlay a project fragment onto the accumulated project layer.
fn overlay_project(base: &mut ProjectConfig, extra: ProjectConfig) {
    base.model_registry.extend(extra.model_registry);
    base.routing_policies.extend(extra.routing_policies);
    if extra.data_residency.allowed_regions.is_some() {
        base.data_residency = extra.data_residency;
    }
    if extra.resilience.is_some() {
        base.resilience = extra.resilience;
    }
    if extra.budget.is_some() {
        base.budget = extra.budget;
    }
    base.settings.extend(extra.settings);
}

/// Merge the project and user layers.
///
/// - **Model registry**: overlay, project wins on key collision. The user's
///   `personal_model_overrides` contribute only aliases the project does not
///   define.
/// - **Routing policies**: project list then user list, order preserved. A
///   user policy whose name collides with a project policy is dropped and
///   counted in `diagnostics.policy_conflicts`.
/// - **Endpoints**: the user list filtered by the project's allowed regions;
///   dropped entries are counted in `diagnostics.endpoints_dropped_by_residency`.
/// - **Scalars**: user value wins over project where the user layer carries
///   the section at all.
fn merge(project: ProjectConfig, user: UserConfig) -> Result<MergedConfig, ConfigError> {
    let mut diagnostics = MergeDiagnostics::default();

    // Model registry: user overrides first, project stamped over them.
    let mut model_registry: BTreeMap<String, ModelSpec> = user
        .personal_model_overrides
        .into_iter()
        .collect();
    for (alias, spec) in project.model_registry {
        model_registry.insert(alias, spec);
    }
    for (alias, spec) in model_registry.iter_mut() {
        spec.alias = alias.clone();
    }

    // Routing policies: project first, then non-conflicting user entries.
    let project_policy_names: BTreeSet<&str> = project
        .routing_policies
        .iter()
        .map(|p| p.name.as_str())
        .collect();
    let mut routing_policies = project.routing_policies.clone();
    for policy in user.personal_routing_policies {
        if project_policy_names.contains(policy.name.as_str()) {
            diagnostics.policy_conflicts += 1;
            tracing::warn!(
                policy = %policy.name,
                "user routing policy shadowed by project policy, dropping"
            );
        } else {
            routing_policies.push(policy);
        }
    }

    // Endpoints: residency filter over the user-supplied list. An explicitly
    // empty region set would silently discard every endpoint, so refuse it
    // here, before the filter, while the configured endpoints are still
    // visible.
    let allowed_regions: Option<BTreeSet<String>> = project
        .data_residency
        .allowed_regions
        .as_ref()
        .map(|rs| rs.iter().cloned().collect());
    if let Some(regions) = &allowed_regions {
        if regions.is_empty() && !user.endpoints.is_empty() {
            return Err(ConfigError::EmptyAllowedRegions {
                endpoints: user.endpoints.len(),
            });
        }
    }
    let mut endpoints = Vec::with_capacity(user.endpoints.len());
    for ep in user.endpoints {
        let allowed = allowed_regions
            .as_ref()
            .is_none_or(|set| set.contains(&ep.region));
        if allowed {
            endpoints.push(ep);
        } else {
            diagnostics.endpoints_dropped_by_residency += 1;
            tracing::debug!(
                endpoint = %ep.name,
                region = %ep.region,
                "endpoint dropped by data-residency filter"
            );
        }
    }

    let mut resilience = project.resilience.unwrap_or_default();
    if let Some(user_res) = user.resilience {
        resilience = user_res;
    }

    let mut budget = project.budget.unwrap_or_default();
    if let Some(limit) = user.daily_spend_limit {
        budget.daily_spend_limit_usd = limit;
    }

    Ok(MergedConfig {
        api_keys: user.api_keys,
        endpoints,
        model_registry,
        routing_policies,
        allowed_regions,
        resilience,
        budget,
        network: user.network.unwrap_or_default(),
        diagnostics,
    })
}

/// Apply `LLM_*` environment overrides to the merged snapshot.
fn apply_env_overrides(cfg: &mut MergedConfig) -> Result<(), ConfigError> {
    macro_rules! env_parse {
        ($env:expr, $field:expr) => {
            if let Ok(val) = std::env::var($env) {
                $field = val.parse().map_err(|_| ConfigError::InvalidEnvValue {
                    var: $env.to_string(),
                    value: val.clone(),
                })?;
            }
        };
    }
    macro_rules! env_bool {
        ($env:expr, $field:expr) => {
            if let Ok(val) = std::env::var($env) {
                $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
            }
        };
    }

    env_parse!("LLM_DAILY_SPEND_LIMIT", cfg.budget.daily_spend_limit_usd);
    env_parse!("LLM_WARN_RATIO", cfg.budget.warn_ratio);
    env_bool!("LLM_BUDGET_STRICT", cfg.budget.strict);
    env_parse!("LLM_MAX_RETRIES", cfg.resilience.max_retries);
    env_parse!("LLM_BASE_DELAY_S", cfg.resilience.base_delay_s);
    env_parse!("LLM_MAX_DELAY_S", cfg.resilience.max_delay_s);
    env_bool!("LLM_WAIT_ON_RATE_LIMIT", cfg.resilience.wait_on_rate_limit);
    env_parse!("LLM_RETRY_BUDGET_S", cfg.resilience.retry_budget_s);
    env_parse!("LLM_MAX_WAIT_TIMEOUT_S", cfg.resilience.max_wait_timeout_s);

    // Provider API keys: LLM_PROVIDER_<UPPER_NAME>_API_KEY.
    for (var, value) in std::env::vars() {
        if let Some(rest) = var.strip_prefix("LLM_PROVIDER_") {
            if let Some(provider) = rest.strip_suffix("_API_KEY") {
                cfg.api_keys.insert(provider.to_lowercase(), value);
            }
        }
    }

    Ok(())
}

/// Reject configurations that would make every later call fail in a way that
/// is clearer to report at load time.
fn validate(cfg: &MergedConfig) -> Result<(), ConfigError> {
    let mut known_providers: BTreeSet<&str> =
        cfg.api_keys.keys().map(String::as_str).collect();
    known_providers.extend(cfg.endpoints.iter().map(|e| e.provider.as_str()));
    // The echo provider ships in-tree and needs no key or endpoint.
    known_providers.insert("echo");

    for (alias, spec) in &cfg.model_registry {
        if !known_providers.contains(spec.provider.as_str()) {
            return Err(ConfigError::UnknownProvider {
                alias: alias.clone(),
                provider: spec.provider.clone(),
            });
        }
        if spec.pricing.input_per_1m < 0.0 || spec.pricing.output_per_1m < 0.0 {
            return Err(ConfigError::NegativeLimit {
                alias: alias.clone(),
                field: "pricing",
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataResidency, Endpoint, RoutingPolicy};

    fn model(provider: &str) -> ModelSpec {
        ModelSpec {
            provider: provider.to_string(),
            model_id: format!("{provider}-model"),
            ..Default::default()
        }
    }

    fn endpoint(name: &str, provider: &str, region: &str) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            provider: provider.to_string(),
            url: format!("https://{name}.example.com"),
            region: region.to_string(),
        }
    }

    fn policy(name: &str) -> RoutingPolicy {
        RoutingPolicy {
            name: name.to_string(),
            strategy: "priority".to_string(),
            params: BTreeMap::new(),
        }
    }

    #[test]
    fn test_registry_overlay_project_wins() {
        let mut project = ProjectConfig::default();
        project
            .model_registry
            .insert("m1".to_string(), model("dashscope"));

        let mut user = UserConfig::default();
        let mut shadow = model("google");
        shadow.model_id = "user-version".to_string();
        user.personal_model_overrides
            .insert("m1".to_string(), shadow);
        user.personal_model_overrides
            .insert("m2".to_string(), model("google"));

        let merged = merge(project, user).unwrap();
        assert_eq!(merged.model_registry["m1"].provider, "dashscope");
        assert_eq!(merged.model_registry["m2"].provider, "google");
        assert_eq!(merged.model_registry["m2"].alias, "m2");
    }

    #[test]
    fn test_routing_policies_append_with_conflict_counter() {
        let mut project = ProjectConfig::default();
        project.routing_policies.push(policy("primary"));

        let mut user = UserConfig::default();
        user.personal_routing_policies.push(policy("primary"));
        user.personal_routing_policies.push(policy("fallback"));

        let merged = merge(project, user).unwrap();
        let names: Vec<&str> = merged.routing_policies.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["primary", "fallback"]);
        assert_eq!(merged.diagnostics.policy_conflicts, 1);
    }

    #[test]
    fn test_endpoint_residency_filter_counts_drops() {
        let mut project = ProjectConfig::default();
        project.data_residency = DataResidency {
            allowed_regions: Some(vec!["eu-west".to_string()]),
        };

        let mut user = UserConfig::default();
        user.endpoints.push(endpoint("a", "google", "eu-west"));
        user.endpoints.push(endpoint("b", "google", "us-east"));

        let merged = merge(project, user).unwrap();
        assert_eq!(merged.endpoints.len(), 1);
        assert_eq!(merged.endpoints[0].name, "a");
        assert_eq!(merged.diagnostics.endpoints_dropped_by_residency, 1);
    }

    #[test]
    fn test_absent_regions_allow_everything() {
        let project = ProjectConfig::default();
        let mut user = UserConfig::default();
        user.endpoints.push(endpoint("b", "google", "us-east"));

        let merged = merge(project, user).unwrap();
        assert_eq!(merged.endpoints.len(), 1);
        assert!(merged.allowed_regions.is_none());
    }

    #[test]
    fn test_user_daily_limit_overrides_project_budget() {
        let mut project = ProjectConfig::default();
        project.budget = Some(crate::config::BudgetConfig {
            daily_spend_limit_usd: 10.0,
            warn_ratio: 0.5,
            strict: true,
        });
        let user = UserConfig {
            daily_spend_limit: Some(2.5),
            ..Default::default()
        };

        let merged = merge(project, user).unwrap();
        assert_eq!(merged.budget.daily_spend_limit_usd, 2.5);
        assert_eq!(merged.budget.warn_ratio, 0.5);
        assert!(merged.budget.strict);
    }

    #[test]
    fn test_validate_unknown_provider() {
        let mut cfg = MergedConfig::default();
        cfg.model_registry.insert("m".to_string(), model("nowhere"));
        let err = validate(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider { .. }));
    }

    #[test]
    fn test_validate_echo_provider_is_builtin() {
        let mut cfg = MergedConfig::default();
        cfg.model_registry.insert("m".to_string(), model("echo"));
        validate(&cfg).unwrap();
    }

    #[test]
    fn test_merge_rejects_empty_regions_with_endpoints() {
        let mut project = ProjectConfig::default();
        project.data_residency = DataResidency {
            allowed_regions: Some(Vec::new()),
        };
        let mut user = UserConfig::default();
        user.endpoints.push(endpoint("a", "google", "eu-west"));

        // The check must see the endpoints before the residency filter
        // would have discarded them.
        let err = merge(project, user).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyAllowedRegions { endpoints: 1 }));
    }

    #[test]
    fn test_merge_accepts_empty_regions_without_endpoints() {
        let mut project = ProjectConfig::default();
        project.data_residency = DataResidency {
            allowed_regions: Some(Vec::new()),
        };

        let merged = merge(project, UserConfig::default()).unwrap();
        assert!(merged.endpoints.is_empty());
        assert_eq!(merged.allowed_regions, Some(BTreeSet::new()));
    }

    #[test]
    fn test_load_from_rejects_empty_regions_with_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let project_path = dir.path().join(PROJECT_FILE);
        std::fs::write(
            &project_path,
            "data_residency:\n  allowed_regions: []\n",
        )
        .unwrap();
        let user_path = dir.path().join(USER_FILE);
        std::fs::write(
            &user_path,
            r#"
endpoints:
  - name: eu
    provider: echo
    url: https://eu.example.com
    region: eu-west
"#,
        )
        .unwrap();

        let err = load_from(&project_path, &user_path).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyAllowedRegions { endpoints: 1 }));
    }

    #[test]
    fn test_validate_negative_pricing() {
        let mut cfg = MergedConfig::default();
        let mut spec = model("echo");
        spec.pricing.input_per_1m = -1.0;
        cfg.model_registry.insert("m".to_string(), spec);
        let err = validate(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::NegativeLimit { .. }));
    }

    #[test]
    fn test_env_overrides_scalars_and_api_keys() {
        // SAFETY: Tests are run sequentially for env-mutating tests.
        unsafe {
            std::env::set_var("LLM_DAILY_SPEND_LIMIT", "7.5");
            std::env::set_var("LLM_MAX_RETRIES", "5");
            std::env::set_var("LLM_WAIT_ON_RATE_LIMIT", "off");
            std::env::set_var("LLM_PROVIDER_DASHSCOPE_API_KEY", "sk-from-env");
        }

        let mut cfg = MergedConfig::default();
        cfg.api_keys
            .insert("dashscope".to_string(), "sk-from-file".to_string());
        apply_env_overrides(&mut cfg).unwrap();

        assert_eq!(cfg.budget.daily_spend_limit_usd, 7.5);
        assert_eq!(cfg.resilience.max_retries, 5);
        assert!(!cfg.resilience.wait_on_rate_limit);
        assert_eq!(cfg.api_keys["dashscope"], "sk-from-env");

        unsafe {
            std::env::remove_var("LLM_DAILY_SPEND_LIMIT");
            std::env::remove_var("LLM_MAX_RETRIES");
            std::env::remove_var("LLM_WAIT_ON_RATE_LIMIT");
            std::env::remove_var("LLM_PROVIDER_DASHSCOPE_API_KEY");
        }
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        // SAFETY: Tests are run sequentially for env-mutating tests.
        unsafe { std::env::set_var("LLM_RETRY_BUDGET_S", "plenty") };
        let mut cfg = MergedConfig::default();
        let err = apply_env_overrides(&mut cfg).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvValue { .. }));
        unsafe { std::env::remove_var("LLM_RETRY_BUDGET_S") };
    }

    #[test]
    fn test_load_from_files_and_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let project_path = dir.path().join(PROJECT_FILE);
        std::fs::write(
            &project_path,
            r#"
project_name: demo
model_registry:
  fast:
    provider: echo
    model_id: echo-1
    pricing:
      input_per_1m: 1.0
      output_per_1m: 3.0
data_residency:
  allowed_regions: [eu-west]
"#,
        )
        .unwrap();

        let frag_dir = dir.path().join(PROJECT_FRAGMENT_DIR);
        std::fs::create_dir(&frag_dir).unwrap();
        std::fs::write(
            frag_dir.join("10-extra.yaml"),
            r#"
model_registry:
  smart:
    provider: echo
    model_id: echo-2
"#,
        )
        .unwrap();

        let user_path = dir.path().join(USER_FILE);
        std::fs::write(
            &user_path,
            r#"
api_keys:
  google: sk-123
endpoints:
  - name: eu
    provider: echo
    url: https://eu.example.com
    region: eu-west
  - name: us
    provider: echo
    url: https://us.example.com
    region: us-east
daily_spend_limit: 3.0
"#,
        )
        .unwrap();

        let cfg = load_from(&project_path, &user_path).unwrap();
        assert!(cfg.model_registry.contains_key("fast"));
        assert!(cfg.model_registry.contains_key("smart"));
        assert_eq!(cfg.endpoints.len(), 1);
        assert_eq!(cfg.diagnostics.endpoints_dropped_by_residency, 1);
        assert_eq!(cfg.budget.daily_spend_limit_usd, 3.0);
    }

    #[test]
    fn test_load_from_missing_files_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_from(
            &dir.path().join("absent.yaml"),
            &dir.path().join("also-absent.yaml"),
        )
        .unwrap();
        assert!(cfg.model_registry.is_empty());
        assert_eq!(cfg.budget.daily_spend_limit_usd, 1.0);
    }

    #[test]
    fn test_load_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let project_path = dir.path().join(PROJECT_FILE);
        std::fs::write(
            &project_path,
            "model_registry:\n  a:\n    provider: echo\n    model_id: e\n",
        )
        .unwrap();
        let user_path = dir.path().join(USER_FILE);

        let a = load_from(&project_path, &user_path).unwrap();
        let b = load_from(&project_path, &user_path).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
