use std::cmp::Reverse;
use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use super::keys::{BuildRef, BuildState};
use crate::error::PartialDataWarning;

/// Full build record as returned by a CI server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: u64,
    pub suite_id: String,
    pub branch_name: String,
    pub state: BuildState,
    pub status: Option<String>,
    /// Finish timestamp in the server's own offset.
    pub finish_date: Option<DateTime<FixedOffset>>,
    pub snapshot_dependencies: Vec<BuildRef>,
    pub web_url: Option<String>,
}

impl Build {
    pub fn to_ref(&self) -> BuildRef {
        BuildRef::new(self.id, self.suite_id.clone(), self.branch_name.clone())
            .with_state(self.state)
    }

    /// Server-local calendar day of the finish timestamp, as `YYYYMMDD`.
    pub fn finish_day(&self) -> Option<String> {
        self.finish_date.map(|d| d.format("%Y%m%d").to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    FailedTests,
    JvmCrash,
    ExecutionTimeout,
    OutOfMemory,
    Other(String),
}

impl ProblemKind {
    pub fn from_type(problem_type: &str) -> Self {
        match problem_type {
            "TC_FAILED_TESTS" => Self::FailedTests,
            "TC_JVM_CRASH" => Self::JvmCrash,
            "TC_EXECUTION_TIMEOUT" => Self::ExecutionTimeout,
            "TC_OOME" => Self::OutOfMemory,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::FailedTests => "failed tests",
            Self::JvmCrash => "JVM crash",
            Self::ExecutionTimeout => "timeout",
            Self::OutOfMemory => "OOM",
            Self::Other(t) => t,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::JvmCrash | Self::ExecutionTimeout | Self::OutOfMemory)
    }
}

/// One suite's run result within a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRunContext {
    pub build_id: u64,
    pub suite_id: String,
    pub suite_name: String,
    pub branch_name: String,
    pub state: BuildState,
    pub failed_tests: usize,
    pub muted_tests: usize,
    pub total_tests: usize,
    pub problems: Vec<ProblemKind>,
    /// Externally supplied contact for the suite, if any.
    pub contact_person: Option<String>,
    pub web_url: Option<String>,
}

impl BuildRunContext {
    /// Crash, timeout or OOM: the suite did not run to completion.
    pub fn has_critical_problem(&self) -> bool {
        self.problems.iter().any(ProblemKind::is_critical)
    }

    pub fn has_nontest_build_problem(&self) -> bool {
        self.problems.iter().any(|p| *p != ProblemKind::FailedTests)
    }

    pub fn is_running(&self) -> bool {
        !self.state.is_finished()
    }

    /// A run counts as passed when no test failed and nothing else broke the build.
    pub fn is_ok(&self) -> bool {
        self.failed_tests == 0 && !self.has_nontest_build_problem()
    }
}

/// Merged result of one or more chain roots and their sub-builds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainRunContext {
    roots: Vec<BuildRef>,
    suites: Vec<BuildRunContext>,
    warnings: Vec<PartialDataWarning>,
    #[serde(skip)]
    running: OnceLock<usize>,
}

impl ChainRunContext {
    /// Suites are ordered by name (byte order), newest build first within a suite,
    /// independent of the order they were loaded in.
    pub fn new(
        roots: Vec<BuildRef>,
        mut suites: Vec<BuildRunContext>,
        warnings: Vec<PartialDataWarning>,
    ) -> Self {
        suites.sort_by(|a, b| {
            a.suite_name
                .cmp(&b.suite_name)
                .then_with(|| Reverse(a.build_id).cmp(&Reverse(b.build_id)))
        });

        Self {
            roots,
            suites,
            warnings,
            running: OnceLock::new(),
        }
    }

    pub fn roots(&self) -> &[BuildRef] {
        &self.roots
    }

    pub fn suites(&self) -> &[BuildRunContext] {
        &self.suites
    }

    pub fn warnings(&self) -> &[PartialDataWarning] {
        &self.warnings
    }

    /// Number of suites with a problem other than failed tests.
    pub fn build_problems(&self) -> usize {
        self.suites
            .iter()
            .filter(|s| s.has_nontest_build_problem())
            .count()
    }

    pub fn failed_tests(&self) -> usize {
        self.suites.iter().map(|s| s.failed_tests).sum()
    }

    pub fn muted_tests(&self) -> usize {
        self.suites.iter().map(|s| s.muted_tests).sum()
    }

    pub fn total_tests(&self) -> usize {
        self.suites.iter().map(|s| s.total_tests).sum()
    }

    /// Sub-builds that are still queued or running.
    pub fn running_updates(&self) -> usize {
        *self
            .running
            .get_or_init(|| self.suites.iter().filter(|s| s.is_running()).count())
    }
}

/// Outcome of a deeper build-log scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCheckResult {
    pub build_id: u64,
    pub last_started_test: Option<String>,
    pub out_of_memory_lines: usize,
    pub jvm_crash_lines: usize,
}

#[cfg(test)]
pub(crate) fn suite_run(build_id: u64, suite_name: &str) -> BuildRunContext {
    BuildRunContext {
        build_id,
        suite_id: format!("{suite_name}_Id"),
        suite_name: suite_name.to_string(),
        branch_name: "master".to_string(),
        state: BuildState::Finished,
        failed_tests: 0,
        muted_tests: 0,
        total_tests: 10,
        problems: vec![],
        contact_person: None,
        web_url: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn suites_are_sorted_by_name_then_newest_build() {
        let ctx = ChainRunContext::new(
            vec![],
            vec![
                suite_run(1, "Zookeeper"),
                suite_run(2, "Basic"),
                suite_run(5, "Cache"),
                suite_run(7, "Cache"),
            ],
            vec![],
        );

        let order: Vec<(&str, u64)> = ctx
            .suites()
            .iter()
            .map(|s| (s.suite_name.as_str(), s.build_id))
            .collect();
        assert_eq!(
            order,
            vec![("Basic", 2), ("Cache", 7), ("Cache", 5), ("Zookeeper", 1)]
        );
    }

    #[test]
    fn suite_order_is_case_sensitive() {
        let ctx = ChainRunContext::new(
            vec![],
            vec![suite_run(1, "basic"), suite_run(2, "Cache")],
            vec![],
        );

        assert_eq!(ctx.suites()[0].suite_name, "Cache");
    }

    #[test]
    fn metrics_sum_over_suites() {
        let mut failing = suite_run(1, "A");
        failing.failed_tests = 3;
        failing.muted_tests = 1;
        failing.problems = vec![ProblemKind::FailedTests];

        let mut crashed = suite_run(2, "B");
        crashed.problems = vec![ProblemKind::JvmCrash];
        crashed.state = BuildState::Running;

        let ctx = ChainRunContext::new(vec![], vec![failing, crashed], vec![]);

        assert_eq!(ctx.failed_tests(), 3);
        assert_eq!(ctx.muted_tests(), 1);
        assert_eq!(ctx.total_tests(), 20);
        assert_eq!(ctx.build_problems(), 1, "failed tests alone are not a build problem");
        assert_eq!(ctx.running_updates(), 1);
    }

    #[test]
    fn ok_requires_no_failures_and_no_nontest_problem() {
        let mut run = suite_run(1, "A");
        assert!(run.is_ok());

        run.problems = vec![ProblemKind::Other("TC_EXIT_CODE".to_string())];
        assert!(!run.is_ok());

        run.problems.clear();
        run.failed_tests = 1;
        assert!(!run.is_ok());
    }

    #[test]
    fn problem_types_map_to_kinds() {
        assert_eq!(ProblemKind::from_type("TC_OOME"), ProblemKind::OutOfMemory);
        assert_eq!(
            ProblemKind::from_type("TC_EXECUTION_TIMEOUT"),
            ProblemKind::ExecutionTimeout
        );
        assert_eq!(
            ProblemKind::from_type("TC_EXIT_CODE"),
            ProblemKind::Other("TC_EXIT_CODE".to_string())
        );
    }

    #[test]
    fn finish_day_uses_server_offset() {
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        let build = Build {
            id: 1,
            suite_id: "RunAll".to_string(),
            branch_name: "master".to_string(),
            state: BuildState::Finished,
            status: Some("SUCCESS".to_string()),
            // 22:30 UTC on Feb 18 is already Feb 19 at +03:00
            finish_date: Some(offset.with_ymd_and_hms(2018, 2, 19, 1, 30, 0).unwrap()),
            snapshot_dependencies: vec![],
            web_url: None,
        };

        assert_eq!(build.finish_day().as_deref(), Some("20180219"));
    }
}
