//! In-memory CI server used by tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};

use super::{CiServer, ServerProvider};
use crate::auth::Credentials;
use crate::chain::context::{suite_run, Build, BuildRunContext, LogCheckResult};
use crate::chain::keys::{BuildRef, BuildState};
use crate::error::{ChainLensError, Result};

#[derive(Default)]
pub struct MockServer {
    id: String,
    finished: HashMap<(String, String), Vec<BuildRef>>,
    scheduled: HashMap<(String, String), Vec<BuildRef>>,
    builds: HashMap<u64, Build>,
    results: HashMap<u64, BuildRunContext>,
    failing: HashSet<u64>,
    delays: HashMap<u64, Duration>,
    rebuilds: HashMap<u64, BuildRef>,
    unreachable: bool,
    failing_log_analysis: bool,
    pub suite_loads: AtomicUsize,
    pub chain_fetches: AtomicUsize,
    pub log_analyses: AtomicUsize,
}

impl MockServer {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    /// Registers a chain root with its sub-builds; every sub-build gets a
    /// passing suite result named after its suite id.
    pub fn with_chain(mut self, root: BuildRef, finish: &str, subs: Vec<BuildRef>) -> Self {
        for sub in &subs {
            let sub_id = sub.id.unwrap_or_default();
            let mut run = suite_run(sub_id, &sub.suite_id);
            run.suite_id = sub.suite_id.clone();
            run.branch_name = sub.branch_name.clone();
            run.state = sub.state;
            self.results.entry(sub_id).or_insert(run);
        }

        let key = (root.suite_id.clone(), root.branch_name.clone());
        let root_id = root.id.unwrap_or_default();
        self.builds.insert(
            root_id,
            Build {
                id: root_id,
                suite_id: root.suite_id.clone(),
                branch_name: root.branch_name.clone(),
                state: root.state,
                status: Some("SUCCESS".to_string()),
                finish_date: Some(parse_date(finish)),
                snapshot_dependencies: subs,
                web_url: None,
            },
        );

        let target = if root.is_scheduled() {
            &mut self.scheduled
        } else {
            &mut self.finished
        };
        target.entry(key).or_default().push(root);
        self
    }

    /// Adds a build to the finished list without any record behind it.
    pub fn with_listed(mut self, build: BuildRef) -> Self {
        self.finished
            .entry((build.suite_id.clone(), build.branch_name.clone()))
            .or_default()
            .push(build);
        self
    }

    pub fn with_result(mut self, result: BuildRunContext) -> Self {
        self.results.insert(result.build_id, result);
        self
    }

    /// Drops the suite result of a build, as if it had been deleted.
    pub fn without_result(mut self, build_id: u64) -> Self {
        self.results.remove(&build_id);
        self
    }

    pub fn with_failing(mut self, build_id: u64) -> Self {
        self.failing.insert(build_id);
        self
    }

    pub fn with_delay(mut self, build_id: u64, delay: Duration) -> Self {
        self.delays.insert(build_id, delay);
        self
    }

    pub fn with_rebuild(mut self, original: u64, rebuild: BuildRunContext) -> Self {
        let reference = BuildRef::new(rebuild.build_id, rebuild.suite_id.clone(), rebuild.branch_name.clone());
        self.rebuilds.insert(original, reference);
        self.results.insert(rebuild.build_id, rebuild);
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn with_failing_log_analysis(mut self) -> Self {
        self.failing_log_analysis = true;
        self
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable {
            Err(ChainLensError::upstream(&self.id, "connection refused"))
        } else {
            Ok(())
        }
    }
}

pub fn parse_date(value: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_str(value, "%Y%m%dT%H%M%S%z").unwrap()
}

#[async_trait]
impl CiServer for MockServer {
    fn server_id(&self) -> &str {
        &self.id
    }

    fn build_web_url(&self, build_id: u64) -> Option<String> {
        Some(format!("https://{}/viewLog.html?buildId={build_id}", self.id))
    }

    async fn list_finished_builds(&self, suite_id: &str, branch: &str) -> Result<Vec<BuildRef>> {
        self.check_reachable()?;
        Ok(self
            .finished
            .get(&(suite_id.to_string(), branch.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_scheduled_builds(&self, suite_id: &str, branch: &str) -> Result<Vec<BuildRef>> {
        self.check_reachable()?;
        Ok(self
            .scheduled
            .get(&(suite_id.to_string(), branch.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_build(&self, build: &BuildRef) -> Result<Option<Build>> {
        self.check_reachable()?;
        Ok(build.id.and_then(|id| self.builds.get(&id).cloned()))
    }

    async fn fetch_chain_dependencies(&self, root: &BuildRef) -> Result<Vec<BuildRef>> {
        self.check_reachable()?;
        self.chain_fetches.fetch_add(1, Ordering::SeqCst);
        root.id
            .and_then(|id| self.builds.get(&id))
            .map(|b| b.snapshot_dependencies.clone())
            .ok_or_else(|| ChainLensError::not_found("chain root", root.describe()))
    }

    async fn load_suite_result(&self, build: &BuildRef) -> Result<Option<BuildRunContext>> {
        self.check_reachable()?;
        self.suite_loads.fetch_add(1, Ordering::SeqCst);
        let id = build.id.unwrap_or_default();

        if let Some(delay) = self.delays.get(&id) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&id) {
            return Err(ChainLensError::upstream(&self.id, format!("build {id} failed to load")));
        }

        Ok(self.results.get(&id).cloned().map(|mut ctx| {
            if build.state != BuildState::Finished {
                ctx.state = build.state;
            }
            ctx
        }))
    }

    async fn find_latest_rebuild(&self, build: &BuildRef) -> Result<BuildRef> {
        self.check_reachable()?;
        Ok(build
            .id
            .and_then(|id| self.rebuilds.get(&id).cloned())
            .unwrap_or_else(|| build.clone()))
    }

    async fn analyze_build_log(&self, ctx: &BuildRunContext) -> Result<LogCheckResult> {
        self.log_analyses.fetch_add(1, Ordering::SeqCst);
        if self.failing_log_analysis {
            return Err(ChainLensError::upstream(&self.id, "log download failed"));
        }
        Ok(LogCheckResult {
            build_id: ctx.build_id,
            ..LogCheckResult::default()
        })
    }
}

/// Provider over a fixed set of mock servers; access is whatever the
/// credentials list.
#[derive(Default)]
pub struct MockProvider {
    servers: HashMap<String, Arc<MockServer>>,
    pub opened: AtomicUsize,
}

impl MockProvider {
    pub fn with_server(mut self, server: MockServer) -> Self {
        self.servers.insert(server.id.clone(), Arc::new(server));
        self
    }

    pub fn mock(&self, id: &str) -> Arc<MockServer> {
        self.servers[id].clone()
    }
}

#[async_trait]
impl ServerProvider for MockProvider {
    fn has_access(&self, server_id: &str, creds: &Credentials) -> bool {
        creds.has_server(server_id)
    }

    async fn server(&self, server_id: &str, creds: &Credentials) -> Result<Arc<dyn CiServer>> {
        self.check_access(server_id, creds)?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        let server = self
            .servers
            .get(server_id)
            .cloned()
            .ok_or_else(|| ChainLensError::not_found("CI server", server_id))?;
        let handle: Arc<dyn CiServer> = server;
        Ok(handle)
    }
}
