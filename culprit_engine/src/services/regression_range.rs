//! Regression range tracking: walks earlier builds of the same builder to find
//! where each failing step (and test) last passed and first failed.

use std::collections::BTreeMap;

use crate::config::EngineConfig;
use crate::models::build::{Build, BuildResult};
use crate::models::failure::{FailedStep, TestFailure};
use crate::providers::{iterate_previous_builds, BuildHistoryProvider};

/// Tightened failed steps plus every build visited on the way, keyed by
/// build number. The current build is always included.
#[derive(Debug, Clone)]
pub struct RegressionRange {
    pub failed_steps: Vec<FailedStep>,
    pub builds: BTreeMap<i64, Build>,
}

impl RegressionRange {
    pub fn step(&self, step_name: &str) -> Option<&FailedStep> {
        self.failed_steps.iter().find(|s| s.step_name == step_name)
    }
}

/// Failed steps of `build` selected by `include`, with their failing tests
/// when the build reported them.
pub fn initial_failed_steps(
    config: &EngineConfig,
    build: &Build,
    include: impl Fn(&str) -> bool,
) -> Vec<FailedStep> {
    build
        .failed_steps
        .iter()
        .filter(|name| include(name))
        .map(|name| {
            let step = FailedStep::new(
                name.as_str(),
                build.build_number,
                config.is_supported_step(name),
            );
            match build.failed_tests_of(name) {
                Some(tests) => step.with_tests(tests.iter().cloned()),
                None => step,
            }
        })
        .collect()
}

/// Walks builds older than `current`, newest first, until every step has a
/// last pass or `max_builds_to_check` numbers were visited.
///
/// Never fails: a lookup error on an older build ends the walk with what was
/// learned so far.
pub async fn find_regression_range(
    history: &dyn BuildHistoryProvider,
    config: &EngineConfig,
    current: &Build,
    failed_steps: Vec<FailedStep>,
) -> RegressionRange {
    let mut steps = failed_steps;
    let mut builds = BTreeMap::from([(current.build_number, current.clone())]);
    let mut previous = iterate_previous_builds(
        history,
        &current.project,
        &current.builder,
        current.build_number,
        config.max_builds_to_check,
    );

    while steps.iter().any(|s| s.last_pass.is_none()) {
        let build = match previous.next().await {
            Ok(Some(build)) => build,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(
                    build = %current.key(),
                    error = %e,
                    "Stopped regression walk early, using best-effort range"
                );
                break;
            }
        };

        let number = build.build_number;
        for step in steps.iter_mut().filter(|s| s.last_pass.is_none()) {
            if build.result == BuildResult::Success || build.step_passed(&step.step_name) {
                mark_passed(step, number);
            } else if build.step_failed(&step.step_name) {
                step.first_failure = number;
                track_tests(step, &build, number);
            }
        }
        builds.insert(number, build);
    }

    for step in &steps {
        tracing::debug!(
            build = %current.key(),
            step = %step.step_name,
            first_failure = step.first_failure,
            last_pass = ?step.last_pass,
            "Regression range"
        );
    }

    RegressionRange {
        failed_steps: steps,
        builds,
    }
}

fn mark_passed(step: &mut FailedStep, build_number: i64) {
    step.last_pass = Some(build_number);
    for test in step.tests.values_mut().filter(|t| t.last_pass.is_none()) {
        test.last_pass = Some(build_number);
    }
}

/// Tightens test ranges inside a step that failed in `build`. Tests are left
/// alone when the build did not report which tests failed.
fn track_tests(step: &mut FailedStep, build: &Build, build_number: i64) {
    let Some(failing) = build.failed_tests_of(&step.step_name) else {
        return;
    };
    for test in step.tests.values_mut().filter(|t| t.last_pass.is_none()) {
        tighten_test(test, failing.contains(&test.test_name), build_number);
    }
}

fn tighten_test(test: &mut TestFailure, failed: bool, build_number: i64) {
    if failed {
        test.first_failure = build_number;
    } else {
        test.last_pass = Some(build_number);
    }
}
