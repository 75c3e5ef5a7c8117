use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

#[allow(clippy::cast_precision_loss)]
fn calculate_rate(count: usize, total: usize) -> Option<f64> {
    (total > 0).then(|| count as f64 / total as f64)
}

/// Pass/fail tally of one suite over a series of runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailuresHistory {
    pub success: usize,
    pub total_run: usize,
}

impl FailuresHistory {
    pub fn add_run(&mut self, ok: bool) {
        self.total_run += 1;
        if ok {
            self.success += 1;
        }
    }

    /// Fraction of passed runs; `None` until a run has been recorded.
    pub fn pass_rate(&self) -> Option<f64> {
        calculate_rate(self.success, self.total_run)
    }

    pub fn pass_rate_str(&self) -> String {
        self.pass_rate()
            .map_or_else(|| "no data".to_string(), |rate| format!("{rate:.2}"))
    }
}

/// Pass rates keyed by `"{server_id}\t{suite_name}"`.
///
/// Shared between concurrent chain loads; the lock is never held across an
/// await point.
#[derive(Debug, Default)]
pub struct FailureRateTracker {
    suites: Mutex<BTreeMap<String, FailuresHistory>>,
}

impl FailureRateTracker {
    pub fn key(server_id: &str, suite_name: &str) -> String {
        format!("{server_id}\t{suite_name}")
    }

    pub fn add_suite_result(&self, key: String, ok: bool) {
        let mut suites = self
            .suites
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        suites.entry(key).or_default().add_run(ok);
    }

    pub fn get(&self, key: &str) -> Option<FailuresHistory> {
        self.suites
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Copy of all tallies, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, FailuresHistory> {
        self.suites
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Suites whose pass rate is strictly below `threshold`, worst first.
    ///
    /// Suites without any recorded run are never reported.
    pub fn below(&self, threshold: f64) -> Vec<(String, FailuresHistory)> {
        let mut low: Vec<(String, FailuresHistory)> = self
            .snapshot()
            .into_iter()
            .filter(|(_, h)| h.pass_rate().is_some_and(|rate| rate < threshold))
            .collect();

        low.sort_by(|(ka, a), (kb, b)| {
            a.pass_rate()
                .partial_cmp(&b.pass_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ka.cmp(kb))
        });
        low
    }
}
