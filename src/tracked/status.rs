use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;

use crate::cache::CacheValue;
use crate::chain::context::{BuildRunContext, ChainRunContext};
use crate::chain::failure_rate::FailuresHistory;
use crate::config::ChainAtServerTracked;
use crate::error::PartialDataWarning;

/// One suite within a tracked chain, over all merged runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteCurrentStatus {
    pub name: String,
    pub suite_id: String,
    pub branch_name: String,
    /// Build ids of the merged runs, newest first.
    pub build_ids: Vec<u64>,
    pub failed_tests: usize,
    pub muted_tests: usize,
    pub total_tests: usize,
    pub problems: Vec<String>,
    pub contact_person: Option<String>,
    pub runs: FailuresHistory,
    pub running: bool,
    pub web_url: Option<String>,
}

impl SuiteCurrentStatus {
    /// `runs` must be non-empty and belong to one suite, newest first.
    fn from_runs(runs: &[&BuildRunContext]) -> Option<Self> {
        let newest = runs.first()?;

        let mut history = FailuresHistory::default();
        let mut problems: Vec<String> = Vec::new();
        for run in runs {
            history.add_run(run.is_ok());
            for problem in &run.problems {
                let label = problem.label().to_string();
                if !problems.contains(&label) {
                    problems.push(label);
                }
            }
        }

        Some(Self {
            name: newest.suite_name.clone(),
            suite_id: newest.suite_id.clone(),
            branch_name: newest.branch_name.clone(),
            build_ids: runs.iter().map(|r| r.build_id).collect(),
            failed_tests: newest.failed_tests,
            muted_tests: newest.muted_tests,
            total_tests: newest.total_tests,
            problems,
            contact_person: runs.iter().find_map(|r| r.contact_person.clone()),
            runs: history,
            running: runs.iter().any(|r| r.is_running()),
            web_url: newest.web_url.clone(),
        })
    }

    pub fn pass_rate(&self) -> Option<f64> {
        self.runs.pass_rate()
    }
}

/// Status of one tracked (server, suite, branch) entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainAtServerStatus {
    pub server_id: String,
    pub suite_id: String,
    pub branch_name: String,
    /// Link to the newest merged chain.
    pub web_url: Option<String>,
    /// Ids of the chain roots merged into this entry, newest first.
    pub chain_ids: Vec<u64>,
    pub suites: Vec<SuiteCurrentStatus>,
    pub failed_tests: usize,
    pub muted_tests: usize,
    pub total_tests: usize,
    pub build_problems: usize,
    /// Suites that crashed, timed out or ran out of memory.
    pub failed_to_finish: usize,
    pub running_builds: usize,
    pub warnings: Vec<PartialDataWarning>,
}

impl ChainAtServerStatus {
    pub fn new(tracked: &ChainAtServerTracked) -> Self {
        Self {
            server_id: tracked.server_id.clone(),
            suite_id: tracked.suite_id.clone(),
            branch_name: tracked.branch.clone(),
            web_url: None,
            chain_ids: Vec::new(),
            suites: Vec::new(),
            failed_tests: 0,
            muted_tests: 0,
            total_tests: 0,
            build_problems: 0,
            failed_to_finish: 0,
            running_builds: 0,
            warnings: Vec::new(),
        }
    }

    /// Fills suite statuses and totals from a merged chain context.
    pub fn init_from(&mut self, ctx: &ChainRunContext) {
        self.chain_ids = ctx.roots().iter().filter_map(|r| r.id).collect();

        // Suites arrive grouped and newest-first from the context ordering
        let mut by_suite: IndexMap<&str, Vec<&BuildRunContext>> = IndexMap::new();
        for run in ctx.suites() {
            by_suite.entry(run.suite_id.as_str()).or_default().push(run);
        }
        self.suites = by_suite
            .values()
            .filter_map(|runs| SuiteCurrentStatus::from_runs(runs))
            .collect();

        self.failed_tests = self.suites.iter().map(|s| s.failed_tests).sum();
        self.muted_tests = self.suites.iter().map(|s| s.muted_tests).sum();
        self.total_tests = self.suites.iter().map(|s| s.total_tests).sum();
        self.build_problems = ctx.build_problems();
        self.failed_to_finish = ctx
            .suites()
            .iter()
            .filter(|s| s.has_critical_problem())
            .count();
        self.running_builds = ctx.running_updates();
        self.warnings.extend(ctx.warnings().iter().cloned());
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.server_id, self.suite_id)
    }
}

/// Everything known about one tracked branch across its servers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedStatus {
    pub tracked_branch: String,
    pub servers: Vec<ChainAtServerStatus>,
    pub failed_tests: usize,
    pub muted_tests: usize,
    pub total_tests: usize,
    pub build_problems: usize,
    pub warnings: Vec<PartialDataWarning>,
    pub running_updates: usize,
}

impl ConsolidatedStatus {
    pub fn new(tracked_branch: impl Into<String>) -> Self {
        Self {
            tracked_branch: tracked_branch.into(),
            servers: Vec::new(),
            failed_tests: 0,
            muted_tests: 0,
            total_tests: 0,
            build_problems: 0,
            warnings: Vec::new(),
            running_updates: 0,
        }
    }

    /// Orders entries by server then suite and computes the totals.
    pub fn post_process(&mut self, running_updates: usize) {
        self.servers.sort_by(|a, b| {
            a.server_id
                .cmp(&b.server_id)
                .then_with(|| a.suite_id.cmp(&b.suite_id))
        });

        self.failed_tests = self.servers.iter().map(|s| s.failed_tests).sum();
        self.muted_tests = self.servers.iter().map(|s| s.muted_tests).sum();
        self.total_tests = self.servers.iter().map(|s| s.total_tests).sum();
        self.build_problems = self.servers.iter().map(|s| s.build_problems).sum();
        self.running_updates = running_updates;
    }
}

impl CacheValue for ConsolidatedStatus {
    fn running_updates(&self) -> usize {
        self.running_updates
    }
}

impl fmt::Display for SuiteCurrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} failed, {} muted, {} total, pass rate {}",
            self.name,
            self.failed_tests,
            self.muted_tests,
            self.total_tests,
            self.runs.pass_rate_str()
        )?;
        if !self.problems.is_empty() {
            write!(f, " [{}]", self.problems.join(", "))?;
        }
        if self.running {
            write!(f, " (running)")?;
        }
        if let Some(contact) = &self.contact_person {
            write!(f, " contact: {contact}")?;
        }
        Ok(())
    }
}

impl fmt::Display for ChainAtServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} [{}]: {} failed, {} muted, {} total, {} build problem(s)",
            self.display_name(),
            self.branch_name,
            self.failed_tests,
            self.muted_tests,
            self.total_tests,
            self.build_problems
        )?;
        for suite in self
            .suites
            .iter()
            .filter(|s| s.runs.success < s.runs.total_run || s.running)
        {
            writeln!(f, "    {suite}")?;
        }
        for warning in &self.warnings {
            writeln!(f, "    warning: {warning}")?;
        }
        Ok(())
    }
}

impl fmt::Display for ConsolidatedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} failed, {} muted, {} total, {} build problem(s), {} running",
            self.tracked_branch,
            self.failed_tests,
            self.muted_tests,
            self.total_tests,
            self.build_problems,
            self.running_updates
        )?;
        for server in &self.servers {
            write!(f, "  {server}")?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning: {warning}")?;
        }
        Ok(())
    }
}
