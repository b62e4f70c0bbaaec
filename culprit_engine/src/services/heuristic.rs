//! Heuristic suspect scoring: correlates failure signals with the files each
//! commit in the regression range touched.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::HintWeights;
use crate::models::analysis::StepSuspects;
use crate::models::build::Build;
use crate::models::change_log::{ChangeLog, ChangeType, DependencyRoll, DepsInfo};
use crate::models::failure::{FailedStep, FailureSignal, FailureSignals};
use crate::models::suspect::{rank_suspects, FailureRef, SuspectedCl};

/// Score of one commit against one signal. Zero means not a suspect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeScore {
    pub hints: BTreeMap<String, u32>,
}

impl ChangeScore {
    pub fn score(&self) -> u32 {
        self.hints.values().sum()
    }

    pub fn is_suspect(&self) -> bool {
        self.score() > 0
    }

    fn hint(&mut self, reason: String, weight: u32) {
        if weight > 0 {
            self.hints.entry(reason).or_insert(weight);
        }
    }
}

/// Scores a single commit. Implementations must be deterministic and never
/// score lower when the signal grows.
pub trait ChangeScorer: Send + Sync {
    fn score_change(
        &self,
        signal: &FailureSignal,
        change_log: &ChangeLog,
        deps: &[DependencyRoll],
    ) -> ChangeScore;
}

/// Default scorer: file-path overlap between the log and the commit.
#[derive(Debug, Clone, Default)]
pub struct FileOverlapScorer {
    weights: HintWeights,
}

impl FileOverlapScorer {
    pub fn new(weights: HintWeights) -> Self {
        Self { weights }
    }
}

impl ChangeScorer for FileOverlapScorer {
    fn score_change(
        &self,
        signal: &FailureSignal,
        change_log: &ChangeLog,
        deps: &[DependencyRoll],
    ) -> ChangeScore {
        let mut score = ChangeScore::default();
        if signal.files.is_empty() {
            return score;
        }

        for change in &change_log.touched_files {
            let Some(path) = change.path() else {
                continue;
            };
            // Union of lines over every matching log path.
            let mut matched = signal
                .files
                .iter()
                .filter(|(file, _)| {
                    paths_match(path, file)
                        || (change.change_type == ChangeType::Rename
                            && change.old_path.as_deref().is_some_and(|old| paths_match(old, file)))
                })
                .map(|(_, lines)| lines)
                .peekable();
            let in_log = matched.peek().is_some().then(|| {
                matched
                    .flatten()
                    .copied()
                    .collect::<BTreeSet<u32>>()
                    .into_iter()
                    .collect::<Vec<_>>()
            });

            match in_log {
                Some(lines) => match change.change_type {
                    ChangeType::Add | ChangeType::Copy => score.hint(
                        format!("added {path} (and it was in log)"),
                        self.weights.added_file,
                    ),
                    ChangeType::Delete => score.hint(
                        format!("deleted {path} (and it was in log)"),
                        self.weights.deleted_file,
                    ),
                    ChangeType::Rename => score.hint(
                        format!(
                            "renamed {} to {path} (and it was in log)",
                            change.old_path.as_deref().unwrap_or(path)
                        ),
                        self.weights.renamed_file,
                    ),
                    ChangeType::Modify if lines.is_empty() => score.hint(
                        format!("modified {path} (and it was in log)"),
                        self.weights.modified_file,
                    ),
                    ChangeType::Modify => score.hint(
                        format!("modified {path}[{}] (and it was in log)", join_lines(&lines)),
                        self.weights.modified_file + self.weights.modified_file_with_lines,
                    ),
                },
                None => {
                    if let Some(file) = signal.files.keys().find(|f| is_related(path, f)) {
                        score.hint(
                            format!("modified {path} (related to {file})"),
                            self.weights.related_file,
                        );
                    }
                }
            }
        }

        for roll in deps {
            let prefix = format!("{}/", roll.dep_path.trim_end_matches('/'));
            if signal.files.keys().any(|f| f.starts_with(&prefix)) {
                score.hint(
                    format!(
                        "rolled dep {} from {} to {}",
                        roll.dep_path,
                        roll.old_revision.as_deref().unwrap_or("none"),
                        roll.new_revision
                    ),
                    self.weights.dependency_roll,
                );
            }
        }

        score
    }
}

/// Whether one path is the other, or a `/`-boundary suffix of it.
fn paths_match(a: &str, b: &str) -> bool {
    a == b || ends_with_component(a, b) || ends_with_component(b, a)
}

fn ends_with_component(long: &str, short: &str) -> bool {
    long.len() > short.len()
        && long.ends_with(short)
        && long.as_bytes()[long.len() - short.len() - 1] == b'/'
}

const RELATED_SUFFIXES: [&str; 9] = [
    "_browsertest",
    "_unittest",
    "_perftest",
    "_test",
    "_android",
    "_linux",
    "_mac",
    "_posix",
    "_win",
];

/// `foo.h` ~ `foo.cc`, `foo_unittest.cc` ~ `foo.cc`.
fn is_related(a: &str, b: &str) -> bool {
    let (stem_a, stem_b) = (stem(a), stem(b));
    !stem_a.is_empty() && stem_a == stem_b
}

fn stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    let mut stem = name.split('.').next().unwrap_or(name);
    for suffix in RELATED_SUFFIXES {
        if let Some(stripped) = stem.strip_suffix(suffix) {
            stem = stripped;
            break;
        }
    }
    stem
}

fn join_lines(lines: &[u32]) -> String {
    lines
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Everything the scorer reads.
pub struct ScoringInput<'a> {
    pub failed_steps: &'a [FailedStep],
    pub builds: &'a BTreeMap<i64, Build>,
    pub change_logs: &'a BTreeMap<String, ChangeLog>,
    pub deps_info: &'a DepsInfo,
    pub signals: &'a FailureSignals,
}

#[derive(Debug, Clone, Default)]
pub struct ScoredSuspects {
    pub steps: Vec<StepSuspects>,
    /// Ranked, one entry per revision.
    pub suspects: Vec<SuspectedCl>,
}

/// Scores every commit in each supported step's regression range.
///
/// Per build, test-level scoring runs first; when it produces suspects the
/// step-level signal is not consulted for that build.
pub fn score_suspects(scorer: &dyn ChangeScorer, input: &ScoringInput<'_>) -> ScoredSuspects {
    let mut global: BTreeMap<String, SuspectedCl> = BTreeMap::new();
    let mut steps = Vec::new();

    for step in input.failed_steps.iter().filter(|s| s.supported) {
        let Some(step_signal) = input.signals.get(&step.step_name) else {
            continue;
        };
        if step_signal.is_empty() {
            continue;
        }

        let mut step_map: BTreeMap<String, SuspectedCl> = BTreeMap::new();
        let mut test_maps: BTreeMap<String, BTreeMap<String, SuspectedCl>> = BTreeMap::new();

        for number in step.suspect_build_range() {
            let Some(build) = input.builds.get(&number) else {
                continue;
            };
            let mut found_by_tests = false;

            for (test_name, test) in &step.tests {
                let Some(test_signal) = step_signal.tests.get(test_name) else {
                    continue;
                };
                if test_signal.is_empty() || !test.suspect_build_range().contains(&number) {
                    continue;
                }
                for suspect in score_build(scorer, input, build, test_signal) {
                    let failure = FailureRef::test(&step.step_name, test_name);
                    merge(test_maps.entry(test_name.clone()).or_default(), suspect.clone(), failure.clone());
                    merge(&mut step_map, suspect, failure);
                    found_by_tests = true;
                }
            }

            if !found_by_tests {
                for suspect in score_build(scorer, input, build, &step_signal.signal) {
                    merge(&mut step_map, suspect, FailureRef::step(&step.step_name));
                }
            }
        }

        for suspect in step_map.values() {
            for failure in &suspect.failures {
                merge(&mut global, suspect.clone(), failure.clone());
            }
        }

        steps.push(StepSuspects {
            step_name: step.step_name.clone(),
            suspects: ranked(step_map),
            tests: test_maps
                .into_iter()
                .map(|(test, map)| (test, ranked(map)))
                .collect(),
        });
    }

    ScoredSuspects {
        steps,
        suspects: ranked(global),
    }
}

fn score_build(
    scorer: &dyn ChangeScorer,
    input: &ScoringInput<'_>,
    build: &Build,
    signal: &FailureSignal,
) -> Vec<SuspectedCl> {
    build
        .blame_list
        .iter()
        .filter_map(|revision| {
            let change_log = input.change_logs.get(revision)?;
            let deps = input
                .deps_info
                .get(revision)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let score = scorer.score_change(signal, change_log, deps);
            score.is_suspect().then(|| SuspectedCl {
                repo_name: change_log.repo_name.clone(),
                revision: revision.clone(),
                commit_position: change_log.commit_position,
                build_number: build.build_number,
                score: score.score(),
                hints: score.hints,
                failures: Vec::new(),
            })
        })
        .collect()
}

/// Keeps the top score (with its hints) per revision and the union of the
/// failures it is blamed for.
fn merge(map: &mut BTreeMap<String, SuspectedCl>, candidate: SuspectedCl, failure: FailureRef) {
    let entry = map
        .entry(candidate.revision.clone())
        .or_insert_with(|| SuspectedCl {
            failures: Vec::new(),
            ..candidate.clone()
        });
    if candidate.score > entry.score {
        entry.score = candidate.score;
        entry.hints = candidate.hints;
    }
    entry.add_failure(failure);
}

fn ranked(map: BTreeMap<String, SuspectedCl>) -> Vec<SuspectedCl> {
    let mut suspects: Vec<_> = map.into_values().collect();
    rank_suspects(&mut suspects);
    suspects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::build::BuildResult;
    use crate::models::change_log::FileChange;
    use crate::models::failure::StepSignal;
    use crate::testing::{build, change_log, failed_build};

    fn signal(files: &[(&str, Option<u32>)]) -> FailureSignal {
        let mut s = FailureSignal::default();
        for (path, line) in files {
            s.add_file(*path, *line);
        }
        s
    }

    #[test]
    fn suffix_match_respects_path_boundaries() {
        assert!(paths_match("src/base/foo.cc", "base/foo.cc"));
        assert!(paths_match("base/foo.cc", "src/base/foo.cc"));
        assert!(!paths_match("base/myfoo.cc", "foo.cc"));
    }

    #[test]
    fn related_files_share_a_stem() {
        assert!(is_related("base/foo.h", "base/foo.cc"));
        assert!(is_related("base/foo_unittest.cc", "base/foo.cc"));
        assert!(!is_related("base/bar.cc", "base/foo.cc"));
    }

    #[test]
    fn modified_file_with_lines_outscores_related_file() {
        let scorer = FileOverlapScorer::default();
        let sig = signal(&[("base/foo.cc", Some(12))]);

        let direct = scorer.score_change(
            &sig,
            &change_log("r1", vec![FileChange::modified("base/foo.cc")]),
            &[],
        );
        assert_eq!(direct.score(), 4);
        assert!(direct.hints.contains_key("modified base/foo.cc[12] (and it was in log)"));

        let related = scorer.score_change(
            &sig,
            &change_log("r2", vec![FileChange::modified("base/foo.h")]),
            &[],
        );
        assert_eq!(related.score(), 1);

        let unrelated = scorer.score_change(
            &sig,
            &change_log("r3", vec![FileChange::modified("ui/bar.cc")]),
            &[],
        );
        assert!(!unrelated.is_suspect());
    }

    #[test]
    fn growing_signal_never_lowers_the_score() {
        let scorer = FileOverlapScorer::default();
        let change = change_log("r1", vec![FileChange::modified("chrome/browser/foo.cc")]);
        let small = signal(&[("chrome/browser/foo.cc", Some(12))]);
        let big = signal(&[("chrome/browser/foo.cc", Some(12)), ("browser/foo.cc", None)]);

        let before = scorer.score_change(&small, &change, &[]);
        let after = scorer.score_change(&big, &change, &[]);
        assert_eq!(before.score(), 4);
        assert!(after.score() >= before.score());
        assert!(after
            .hints
            .contains_key("modified chrome/browser/foo.cc[12] (and it was in log)"));
    }

    #[test]
    fn dependency_roll_under_a_log_path_is_hinted() {
        let scorer = FileOverlapScorer::default();
        let sig = signal(&[("third_party/skia/src/core/SkCanvas.cpp", None)]);
        let roll = DependencyRoll {
            dep_path: "third_party/skia".into(),
            repo_url: "https://skia.googlesource.com/skia".into(),
            old_revision: Some("aaa".into()),
            new_revision: "bbb".into(),
        };
        let score = scorer.score_change(&sig, &change_log("r1", Vec::new()), &[roll]);
        assert_eq!(score.score(), 1);
    }

    fn compile_input_fixture() -> (
        Vec<FailedStep>,
        BTreeMap<i64, Build>,
        BTreeMap<String, ChangeLog>,
        FailureSignals,
    ) {
        let mut step = FailedStep::new("compile", 3, true);
        step.first_failure = 2;
        step.last_pass = Some(1);
        let builds = BTreeMap::from([
            (1, build(1, BuildResult::Success)),
            (2, failed_build(2, &["compile"])),
            (3, failed_build(3, &["compile"])),
        ]);
        let logs = BTreeMap::from([
            ("r1".to_string(), change_log("r1", vec![FileChange::modified("base/foo.cc")])),
            ("r2".to_string(), change_log("r2", vec![FileChange::added("base/foo.cc")])),
            ("r3".to_string(), change_log("r3", vec![FileChange::modified("base/foo.h")])),
        ]);
        let signals = BTreeMap::from([(
            "compile".to_string(),
            StepSignal {
                signal: signal(&[("base/foo.cc", None)]),
                tests: BTreeMap::new(),
            },
        )]);
        (vec![step], builds, logs, signals)
    }

    #[test]
    fn only_commits_after_last_pass_are_scored() {
        let (steps, builds, logs, signals) = compile_input_fixture();
        let deps = DepsInfo::new();
        let scored = score_suspects(
            &FileOverlapScorer::default(),
            &ScoringInput {
                failed_steps: &steps,
                builds: &builds,
                change_logs: &logs,
                deps_info: &deps,
                signals: &signals,
            },
        );
        let revisions: Vec<_> = scored.suspects.iter().map(|s| s.revision.as_str()).collect();
        assert_eq!(revisions, vec!["r2", "r3"]);
        assert_eq!(scored.suspects[0].score, 5);
        assert_eq!(scored.suspects[0].failures, vec![FailureRef::step("compile")]);
        assert_eq!(scored.steps[0].suspects.len(), 2);
    }

    #[test]
    fn empty_signal_yields_no_suspects() {
        let (steps, builds, logs, _) = compile_input_fixture();
        let signals = BTreeMap::from([("compile".to_string(), StepSignal::default())]);
        let deps = DepsInfo::new();
        let scored = score_suspects(
            &FileOverlapScorer::default(),
            &ScoringInput {
                failed_steps: &steps,
                builds: &builds,
                change_logs: &logs,
                deps_info: &deps,
                signals: &signals,
            },
        );
        assert!(scored.suspects.is_empty());
        assert!(scored.steps.is_empty());
    }

    #[test]
    fn test_level_suspects_suppress_step_level_for_that_build() {
        let mut step = FailedStep::new("browser_tests", 2, true).with_tests(["Foo.Bar"]);
        step.last_pass = Some(1);
        step.tests.get_mut("Foo.Bar").unwrap().last_pass = Some(1);
        let mut b2 = failed_build(2, &["browser_tests"]);
        b2.blame_list = vec!["r2a".into(), "r2b".into()];
        let builds = BTreeMap::from([(1, build(1, BuildResult::Success)), (2, b2)]);
        let logs = BTreeMap::from([
            ("r2a".to_string(), change_log("r2a", vec![FileChange::modified("ui/foo_view.cc")])),
            ("r2b".to_string(), change_log("r2b", vec![FileChange::modified("base/common.cc")])),
        ]);
        let signals = BTreeMap::from([(
            "browser_tests".to_string(),
            StepSignal {
                signal: signal(&[("base/common.cc", None)]),
                tests: BTreeMap::from([("Foo.Bar".to_string(), signal(&[("ui/foo_view.cc", None)]))]),
            },
        )]);
        let deps = DepsInfo::new();
        let scored = score_suspects(
            &FileOverlapScorer::default(),
            &ScoringInput {
                failed_steps: &[step],
                builds: &builds,
                change_logs: &logs,
                deps_info: &deps,
                signals: &signals,
            },
        );
        let revisions: Vec<_> = scored.suspects.iter().map(|s| s.revision.as_str()).collect();
        assert_eq!(revisions, vec!["r2a"]);
        assert_eq!(
            scored.suspects[0].failures,
            vec![FailureRef::test("browser_tests", "Foo.Bar")]
        );
        assert_eq!(scored.steps[0].tests["Foo.Bar"].len(), 1);
    }

    #[test]
    fn build_without_change_logs_is_skipped_but_later_builds_score() {
        let mut step = FailedStep::new("compile", 3, true);
        step.first_failure = 2;
        step.last_pass = Some(1);
        let builds = BTreeMap::from([
            (1, build(1, BuildResult::Success)),
            (2, failed_build(2, &["compile"])),
            (3, failed_build(3, &["compile"])),
        ]);
        let logs = BTreeMap::from([(
            "r3".to_string(),
            change_log("r3", vec![FileChange::modified("base/foo.cc")]),
        )]);
        let signals = BTreeMap::from([(
            "compile".to_string(),
            StepSignal {
                signal: signal(&[("base/foo.cc", None)]),
                tests: BTreeMap::new(),
            },
        )]);
        let deps = DepsInfo::new();
        let scored = score_suspects(
            &FileOverlapScorer::default(),
            &ScoringInput {
                failed_steps: &[step],
                builds: &builds,
                change_logs: &logs,
                deps_info: &deps,
                signals: &signals,
            },
        );
        let revisions: Vec<_> = scored.suspects.iter().map(|s| s.revision.as_str()).collect();
        assert_eq!(revisions, vec!["r3"]);
        assert_eq!(scored.suspects[0].build_number, 3);
    }
}
