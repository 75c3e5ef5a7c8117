use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use indexmap::IndexMap;
use log::{debug, info};
use tokio::sync::OnceCell;

use super::context::{Build, ChainRunContext};
use super::failure_rate::FailureRateTracker;
use super::keys::{ServerSuiteKey, SuiteInBranch};
use super::loader::load_chain_context;
use crate::error::{ChainLensError, Result};
use crate::providers::CiServer;

type DaySlot = Arc<OnceCell<ChainRunContext>>;

/// Per-day chain results for every collected (server, suite, branch).
///
/// Each (key, date) slot is filled at most once; whichever collector claims
/// it first supplies the value and every later attempt reuses it.
#[derive(Debug, Default)]
pub struct BuildMetricsHistory {
    builds: Mutex<IndexMap<ServerSuiteKey, BTreeMap<String, DaySlot>>>,
    failure_rates: FailureRateTracker,
}

impl BuildMetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, key: &ServerSuiteKey) {
        self.builds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default();
    }

    fn slot(&self, key: &ServerSuiteKey, date: &str) -> DaySlot {
        self.builds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .entry(date.to_string())
            .or_default()
            .clone()
    }

    /// Keys in the order they were first collected.
    pub fn keys(&self) -> Vec<ServerSuiteKey> {
        self.builds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Every date with at least one populated slot, ascending.
    pub fn dates(&self) -> BTreeSet<String> {
        self.builds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flat_map(|days| {
                days.iter()
                    .filter(|(_, slot)| slot.initialized())
                    .map(|(date, _)| date.clone())
            })
            .collect()
    }

    pub fn build(&self, key: &ServerSuiteKey, date: &str) -> Option<ChainRunContext> {
        let slot = self
            .builds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)?
            .get(date)?
            .clone();
        slot.get().cloned()
    }

    pub fn failure_rates(&self) -> &FailureRateTracker {
        &self.failure_rates
    }
}

/// Walks the finished-build history of one suite on one branch and fills the
/// day slots of `history`.
///
/// Builds that no longer exist are skipped. Per day, the earliest finished
/// build is the one that gets loaded. Days already present in `history` are
/// neither reloaded nor counted again.
///
/// # Errors
///
/// Listing failures and chain-root failures abort collection for this pair;
/// days loaded before the failure stay populated.
pub async fn collect(
    server: &Arc<dyn CiServer>,
    suite_id: &str,
    branch: &str,
    history: &BuildMetricsHistory,
) -> Result<()> {
    let key = ServerSuiteKey::new(server.server_id(), SuiteInBranch::new(suite_id, branch));
    history.register(&key);

    let refs: Vec<_> = server
        .list_finished_builds(suite_id, branch)
        .await?
        .into_iter()
        .filter(|r| !r.is_fake_stub())
        .collect();

    let builds: Vec<Build> = join_all(refs.iter().map(|r| server.fetch_build(r)))
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();

    if builds.len() < refs.len() {
        debug!(
            "{} of {} builds of {key} no longer exist",
            refs.len() - builds.len(),
            refs.len()
        );
    }

    let mut first_of_day: BTreeMap<String, Build> = BTreeMap::new();
    for build in builds {
        let Some(day) = build.finish_day() else {
            continue;
        };
        let earlier = first_of_day
            .get(&day)
            .is_some_and(|current| (current.finish_date, current.id) <= (build.finish_date, build.id));
        if !earlier {
            first_of_day.insert(day, build);
        }
    }

    let results = join_all(
        first_of_day
            .iter()
            .map(|(day, build)| populate_day(server, &key, day, build, history)),
    )
    .await;

    let loaded = results.iter().filter(|r| matches!(r, Ok(true))).count();
    info!("Collected {key}: {loaded} new day(s) of {}", first_of_day.len());

    results.into_iter().try_for_each(|r| r.map(|_| ()))
}

/// Fills one day slot unless it is already claimed. Returns whether this call
/// did the load.
async fn populate_day(
    server: &Arc<dyn CiServer>,
    key: &ServerSuiteKey,
    day: &str,
    build: &Build,
    history: &BuildMetricsHistory,
) -> Result<bool> {
    let slot = history.slot(key, day);
    if slot.initialized() {
        return Ok(false);
    }

    let loaded_here = AtomicBool::new(false);
    let loaded = &loaded_here;
    slot.get_or_try_init(|| async move {
        let ctx = load_chain_context(server, &build.to_ref(), false, false, None).await?;
        for suite in ctx.suites() {
            history.failure_rates().add_suite_result(
                FailureRateTracker::key(&key.server_id, &suite.suite_name),
                suite.is_ok(),
            );
        }
        loaded.store(true, Ordering::Relaxed);
        Ok::<_, ChainLensError>(ctx)
    })
    .await?;

    Ok(loaded_here.into_inner())
}
