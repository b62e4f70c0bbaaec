//! Engine configuration from defaults, environment variables or a JSON file.
//!
//! Passed explicitly into every operation; nothing reads configuration from
//! global state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Duration;

use serde::{Deserialize, Serialize};

use crate::models::flake::FlakeType;

/// Weight of each hint the default change scorer can attach to a suspect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HintWeights {
    pub added_file: u32,
    pub deleted_file: u32,
    pub renamed_file: u32,
    pub modified_file: u32,
    /// Extra weight when a modified file was cited at specific lines.
    pub modified_file_with_lines: u32,
    pub related_file: u32,
    pub dependency_roll: u32,
}

impl Default for HintWeights {
    fn default() -> Self {
        Self {
            added_file: 5,
            deleted_file: 5,
            renamed_file: 5,
            modified_file: 2,
            modified_file_with_lines: 2,
            related_file: 1,
            dependency_roll: 1,
        }
    }
}

/// Ranking weight per flake type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlakeWeights(pub BTreeMap<FlakeType, i64>);

impl FlakeWeights {
    pub fn weight(&self, flake_type: FlakeType) -> i64 {
        self.0.get(&flake_type).copied().unwrap_or(0)
    }
}

impl Default for FlakeWeights {
    fn default() -> Self {
        Self(BTreeMap::from([
            (FlakeType::CqFalseRejection, 100),
            (FlakeType::RetryWithPatch, 10),
            (FlakeType::CqHiddenFlake, 1),
            (FlakeType::CiFailedStep, 1),
        ]))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How many earlier builds the regression range tracker may visit.
    pub max_builds_to_check: usize,
    /// Projects whose compile failures pass object targets to try jobs.
    pub strict_regex_projects: BTreeSet<String>,
    /// Prefer exact ninja output nodes as compile try-job targets.
    pub use_ninja_output_log: bool,
    /// Step names handled as compile failures; every other step is a test step.
    pub compile_step_names: Vec<String>,
    /// Failed steps recorded but never scored or bisected.
    pub unsupported_step_names: BTreeSet<String>,
    pub hint_weights: HintWeights,
    pub flake_weights: FlakeWeights,
    pub flake_window_days: i64,
    /// Top suspects handed to try jobs to check first.
    pub max_suspects_for_try_job: usize,
    /// Swarming pool try jobs run in.
    pub try_job_pool: String,
    /// A pending try job with no scheduler id may be reclaimed after this.
    pub try_job_claim_timeout_seconds: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_builds_to_check: 20,
            strict_regex_projects: BTreeSet::new(),
            use_ninja_output_log: true,
            compile_step_names: vec!["compile".to_string()],
            unsupported_step_names: ["bot_update", "presubmit"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            hint_weights: HintWeights::default(),
            flake_weights: FlakeWeights::default(),
            flake_window_days: 7,
            max_suspects_for_try_job: 3,
            try_job_pool: "luci.culprit.try".to_string(),
            try_job_claim_timeout_seconds: 600,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_builds_to_check = std::env::var("CULPRIT_MAX_BUILDS_TO_CHECK")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_builds_to_check);
        let strict_regex_projects = std::env::var("CULPRIT_STRICT_REGEX_PROJECTS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let use_ninja_output_log = std::env::var("CULPRIT_USE_NINJA_OUTPUT_LOG")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.use_ninja_output_log);
        let flake_window_days = std::env::var("CULPRIT_FLAKE_WINDOW_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.flake_window_days);
        let try_job_pool =
            std::env::var("CULPRIT_TRY_JOB_POOL").unwrap_or(defaults.try_job_pool);
        let try_job_claim_timeout_seconds = std::env::var("CULPRIT_TRY_JOB_CLAIM_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.try_job_claim_timeout_seconds);

        if max_builds_to_check == 0 {
            tracing::warn!("CULPRIT_MAX_BUILDS_TO_CHECK is 0 -- no earlier builds will be checked");
        }

        Self {
            max_builds_to_check,
            strict_regex_projects,
            use_ninja_output_log,
            flake_window_days,
            try_job_pool,
            try_job_claim_timeout_seconds,
            ..defaults
        }
    }

    pub fn try_job_claim_timeout(&self) -> Duration {
        Duration::seconds(self.try_job_claim_timeout_seconds.max(0))
    }

    pub fn uses_strict_regex(&self, project: &str) -> bool {
        self.strict_regex_projects.contains(project)
    }

    pub fn is_compile_step(&self, step_name: &str) -> bool {
        self.compile_step_names.iter().any(|s| s == step_name)
    }

    pub fn is_supported_step(&self, step_name: &str) -> bool {
        !self.unsupported_step_names.contains(step_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"max_builds_to_check": 5, "strict_regex_projects": ["chromium"],
                "flake_weights": {"CQ_FALSE_REJECTION": 7}}"#,
        )
        .unwrap();
        assert_eq!(config.max_builds_to_check, 5);
        assert!(config.uses_strict_regex("chromium"));
        assert!(!config.uses_strict_regex("v8"));
        assert!(config.use_ninja_output_log);
        assert_eq!(config.flake_weights.weight(FlakeType::CqFalseRejection), 7);
        assert_eq!(config.flake_weights.weight(FlakeType::CiFailedStep), 0);
        assert_eq!(config.hint_weights, HintWeights::default());
    }

    #[test]
    fn compile_steps_are_configurable() {
        let config = EngineConfig::default();
        assert!(config.is_compile_step("compile"));
        assert!(!config.is_compile_step("browser_tests"));
        assert!(!config.is_supported_step("bot_update"));
        assert!(config.is_supported_step("browser_tests"));
    }
}
