//! Flake statistics over a trailing window, and the ranking score built from
//! them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::config::{EngineConfig, FlakeWeights};
use crate::error::StoreError;
use crate::metrics;
use crate::models::flake::{FlakeAggregate, FlakeOccurrence, FlakeType, FlakeTypeCount};
use crate::store::AnalysisStore;

static PATCH_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^()]*patch\)\s*$").unwrap());
static PLATFORM_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+on\s+\S.*$").unwrap());
static TEST_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:PRE_|MANUAL_|DISABLED_|FLAKY_)+").unwrap());
static PARAM_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/\d+$").unwrap());
static INSTANTIATION_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w+/(\w+\.)").unwrap());

/// `browser_tests (with patch) on Mac-10.15` → `browser_tests`.
pub fn normalize_step_name(step_name: &str) -> String {
    let name = PLATFORM_SUFFIX.replace(step_name, "");
    let name = PATCH_SUFFIX.replace(&name, "");
    name.trim().to_string()
}

/// `All/Suite.PRE_Case/3` → `Suite.Case`.
pub fn normalize_test_name(test_name: &str) -> String {
    let name = PARAM_SUFFIX.replace(test_name, "");
    let name = INSTANTIATION_PREFIX.replace(&name, "$1");
    match name.rsplit_once('.') {
        Some((suite, case)) => format!("{suite}.{}", TEST_PREFIX.replace(case, "")),
        None => TEST_PREFIX.replace(&name, "").into_owned(),
    }
}

/// Identifies one flake across builders and retries.
pub fn flake_key(step_name: &str, test_name: &str) -> String {
    format!(
        "{}::{}",
        normalize_step_name(step_name),
        normalize_test_name(test_name)
    )
}

/// Recomputes the aggregate of one flake from its occurrences.
///
/// Only occurrences in `[now - window, now)` are counted; every type seen at
/// all still gets an entry so stale types read as zero. The result depends
/// only on the arguments.
pub fn aggregate(
    occurrences: &[FlakeOccurrence],
    now: DateTime<Utc>,
    window: Duration,
    weights: &FlakeWeights,
) -> FlakeAggregate {
    let window_start = now - window;
    let mut counts: BTreeMap<FlakeType, FlakeTypeCount> = BTreeMap::new();
    let mut impacted: BTreeMap<FlakeType, BTreeSet<i64>> = BTreeMap::new();
    let mut last_occurred_time = None;

    for occurrence in occurrences {
        let count = counts.entry(occurrence.flake_type).or_default();
        if occurrence.time_happened >= now {
            continue;
        }
        last_occurred_time = last_occurred_time.max(Some(occurrence.time_happened));
        if occurrence.time_happened < window_start {
            continue;
        }
        count.occurrence_count += 1;
        let cls = impacted.entry(occurrence.flake_type).or_default();
        if occurrence.has_cl() {
            cls.insert(occurrence.gerrit_cl_id);
        }
    }

    for (flake_type, count) in counts.iter_mut() {
        count.impacted_cl_count = match impacted.get(flake_type) {
            None => 0,
            Some(cls) if cls.is_empty() => -1,
            Some(cls) => cls.len() as i64,
        };
    }

    let score = counts
        .iter()
        .map(|(flake_type, count)| count.score(weights.weight(*flake_type)))
        .sum();

    FlakeAggregate {
        counts,
        score,
        window_start,
        window_end: now,
        last_occurred_time,
    }
}

/// Groups occurrences by flake, recomputes each aggregate and overwrites the
/// stored record.
pub async fn run_aggregation(
    store: &dyn AnalysisStore,
    config: &EngineConfig,
    occurrences: &[FlakeOccurrence],
    now: DateTime<Utc>,
) -> Result<BTreeMap<String, FlakeAggregate>, StoreError> {
    let window = Duration::days(config.flake_window_days);
    let mut by_flake: BTreeMap<String, Vec<FlakeOccurrence>> = BTreeMap::new();
    for occurrence in occurrences {
        by_flake
            .entry(flake_key(&occurrence.step_name, &occurrence.test_name))
            .or_default()
            .push(occurrence.clone());
    }

    let mut aggregates = BTreeMap::new();
    for (key, group) in by_flake {
        let agg = aggregate(&group, now, window, &config.flake_weights);
        let in_window: i64 = agg.counts.values().map(|c| c.occurrence_count).sum();
        store.put_flake_aggregate(&key, &agg).await?;
        metrics::flake_aggregated(in_window as usize);
        tracing::debug!(flake = %key, score = agg.score, in_window, "Flake aggregated");
        aggregates.insert(key, agg);
    }
    tracing::info!(flakes = aggregates.len(), "Flake aggregation finished");
    Ok(aggregates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flake::NO_CL;
    use crate::store::memory::MemoryStore;

    fn occ(flake_type: FlakeType, cl: i64, hours_ago: i64, now: DateTime<Utc>) -> FlakeOccurrence {
        FlakeOccurrence {
            flake_type,
            build_id: 8_900_000 + hours_ago,
            step_name: "browser_tests (with patch)".into(),
            test_name: "Suite.Case".into(),
            time_happened: now - Duration::hours(hours_ago),
            gerrit_cl_id: cl,
        }
    }

    fn week() -> Duration {
        Duration::days(7)
    }

    #[test]
    fn counts_occurrences_and_distinct_cls() {
        let now = Utc::now();
        let occurrences = vec![
            occ(FlakeType::CqFalseRejection, 101, 1, now),
            occ(FlakeType::CqFalseRejection, 101, 2, now),
            occ(FlakeType::CqFalseRejection, 202, 3, now),
        ];
        let agg = aggregate(&occurrences, now, week(), &FlakeWeights::default());
        assert_eq!(agg.occurrence_count(FlakeType::CqFalseRejection), 3);
        assert_eq!(agg.impacted_cl_count(FlakeType::CqFalseRejection), 2);
        assert_eq!(agg.score, 200);
    }

    #[test]
    fn types_without_cls_report_minus_one_and_score_by_occurrences() {
        let now = Utc::now();
        let occurrences = vec![
            occ(FlakeType::CiFailedStep, NO_CL, 1, now),
            occ(FlakeType::CiFailedStep, NO_CL, 2, now),
            occ(FlakeType::RetryWithPatch, 7, 2, now),
        ];
        let agg = aggregate(&occurrences, now, week(), &FlakeWeights::default());
        assert_eq!(agg.impacted_cl_count(FlakeType::CiFailedStep), -1);
        assert_eq!(agg.occurrence_count(FlakeType::CiFailedStep), 2);
        assert_eq!(agg.score, 2 + 10);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let now = Utc::now();
        let occurrences = vec![
            occ(FlakeType::CqHiddenFlake, 5, 30, now),
            occ(FlakeType::RetryWithPatch, 6, 40, now),
        ];
        let a = aggregate(&occurrences, now, week(), &FlakeWeights::default());
        let b = aggregate(&occurrences, now, week(), &FlakeWeights::default());
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn flakes_cool_down_once_out_of_window() {
        let now = Utc::now();
        let occurrences = vec![
            occ(FlakeType::CqFalseRejection, 101, 24 * 8, now),
            occ(FlakeType::CqFalseRejection, 102, 24 * 9, now),
        ];
        let agg = aggregate(&occurrences, now, week(), &FlakeWeights::default());
        assert_eq!(agg.score, 0);
        assert_eq!(
            agg.counts[&FlakeType::CqFalseRejection],
            FlakeTypeCount::default()
        );
        assert_eq!(agg.last_occurred_time, Some(now - Duration::hours(24 * 8)));
    }

    #[test]
    fn window_excludes_now_and_includes_its_start() {
        let now = Utc::now();
        let mut at_now = occ(FlakeType::CqHiddenFlake, 1, 0, now);
        at_now.time_happened = now;
        let mut at_start = occ(FlakeType::CqHiddenFlake, 2, 0, now);
        at_start.time_happened = now - week();
        let agg = aggregate(&[at_now, at_start], now, week(), &FlakeWeights::default());
        assert_eq!(agg.occurrence_count(FlakeType::CqHiddenFlake), 1);
    }

    #[test]
    fn names_are_normalized() {
        assert_eq!(normalize_step_name("browser_tests (with patch)"), "browser_tests");
        assert_eq!(
            normalize_step_name("webgl_tests (retry shards with patch) on Mac-10.15"),
            "webgl_tests"
        );
        assert_eq!(normalize_step_name("unit_tests"), "unit_tests");
        assert_eq!(normalize_test_name("All/Suite.PRE_PRE_Case/3"), "Suite.Case");
        assert_eq!(normalize_test_name("Suite.DISABLED_Case"), "Suite.Case");
        assert_eq!(normalize_test_name("fast/dom/a.html"), "fast/dom/a.html");
    }

    #[tokio::test]
    async fn run_groups_retries_under_one_key_and_overwrites() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let now = Utc::now();
        let mut retry = occ(FlakeType::RetryWithPatch, 9, 1, now);
        retry.step_name = "browser_tests (retry with patch)".into();
        retry.test_name = "Suite.PRE_Case".into();
        let occurrences = vec![occ(FlakeType::CqFalseRejection, 8, 1, now), retry];

        let first = run_aggregation(&store, &config, &occurrences, now).await.unwrap();
        assert_eq!(first.len(), 1);
        let key = flake_key("browser_tests", "Suite.Case");
        assert_eq!(first[&key].score, 110);

        let later = now + Duration::days(30);
        run_aggregation(&store, &config, &occurrences, later).await.unwrap();
        let stored = store.get_flake_aggregate(&key).await.unwrap().unwrap();
        assert_eq!(stored.score, 0);
        assert_eq!(stored.window_end, later);
    }
}
