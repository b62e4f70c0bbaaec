//! Failure signal extraction from compile and test logs.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::failure::{
    FailedTarget, FailureKind, FailureSignal, FailureSignals, StepLogs, StepSignal,
};

static FILE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:^|[\s(\[:'\x22])((?:[\w.\-]+/)*[\w\-]+(?:\.[\w\-]+)*\.(?:cc|cpp|cxx|c|h|hh|hpp|mm|m|py|java|js|ts|gn|gni|proto|mojom|idl|rs|go|html)\b)(?:[:(](\d+))?",
    )
    .unwrap()
});
static NINJA_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^FAILED: (.+?)\s*$").unwrap());
static COMPILE_SOURCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s-c\s+(\S+)").unwrap());
static OUTPUT_FILE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s-o\s+(\S+)").unwrap());
static QUALIFIED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z_]\w*(?:::[A-Za-z_]\w*)+\b").unwrap());

/// Strips build-directory prefixes so log paths line up with repository paths.
pub fn normalize_path(path: &str) -> String {
    let mut p = path;
    loop {
        if let Some(rest) = p.strip_prefix("../") {
            p = rest;
        } else if let Some(rest) = p.strip_prefix("./") {
            p = rest;
        } else {
            break;
        }
    }
    p.strip_prefix("src/").unwrap_or(p).to_string()
}

fn collect_files(log: &str, signal: &mut FailureSignal) {
    for caps in FILE_REFERENCE.captures_iter(log) {
        let Some(path) = caps.get(1) else {
            continue;
        };
        let line = caps.get(2).and_then(|m| m.as_str().parse().ok());
        signal.add_file(normalize_path(path.as_str()), line);
    }
}

/// Files, ninja output nodes and failed targets of a compile log.
pub fn extract_compile_signal(log: &str) -> FailureSignal {
    let mut signal = FailureSignal::default();
    collect_files(log, &mut signal);

    let lines: Vec<&str> = log.lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = NINJA_FAILED.captures(line) else {
            continue;
        };
        let nodes: Vec<&str> = caps
            .get(1)
            .map(|m| m.as_str().split_whitespace().collect())
            .unwrap_or_default();
        signal
            .failed_output_nodes
            .extend(nodes.iter().map(|n| n.to_string()));

        let command = lines.get(idx + 1).copied().unwrap_or_default();
        let output = OUTPUT_FILE.captures(command).and_then(|c| c.get(1));
        let source = COMPILE_SOURCE.captures(command).and_then(|c| c.get(1));
        let targets: Vec<FailedTarget> = match output {
            Some(output) => vec![FailedTarget {
                source: source.map(|s| normalize_path(s.as_str())),
                target: output.as_str().to_string(),
            }],
            None => nodes
                .iter()
                .map(|n| FailedTarget {
                    source: None,
                    target: n.to_string(),
                })
                .collect(),
        };
        for target in targets {
            if !signal.failed_targets.contains(&target) {
                signal.failed_targets.push(target);
            }
        }
    }
    signal
}

/// Files and qualified identifiers of a test log.
pub fn extract_test_signal(log: &str) -> FailureSignal {
    let mut signal = FailureSignal::default();
    collect_files(log, &mut signal);
    for m in QUALIFIED_NAME.find_iter(log) {
        signal.add_keyword(m.as_str());
    }
    signal
}

/// Signals of every logged step. For test failures the step signal also
/// carries everything found in its tests' logs.
pub fn extract_signals(kind: FailureKind, logs: &StepLogs) -> FailureSignals {
    logs.iter()
        .map(|(step, step_log)| {
            let signal = match kind {
                FailureKind::Compile => StepSignal {
                    signal: extract_compile_signal(&step_log.log),
                    tests: BTreeMap::new(),
                },
                FailureKind::Test => {
                    let tests: BTreeMap<_, _> = step_log
                        .tests
                        .iter()
                        .map(|(test, log)| (test.clone(), extract_test_signal(log)))
                        .collect();
                    let mut signal = extract_test_signal(&step_log.log);
                    for test_signal in tests.values() {
                        signal.merge(test_signal);
                    }
                    StepSignal { signal, tests }
                }
            };
            (step.clone(), signal)
        })
        .collect()
}
