use std::sync::Arc;

use futures::future::join_all;
use log::{debug, warn};

use super::aggregator::MultiServerAggregator;
use super::status::ConsolidatedStatus;
use crate::auth::Credentials;
use crate::cache::{CacheKey, Cached, QueryParams, ResultCache, UpdateInfo, CURRENT_SUMMARY, MERGED_SUMMARY};
use crate::chain::history::{collect, BuildMetricsHistory};
use crate::config::{AnalysisConfig, BranchTracked, Config, TrackedBranches};
use crate::error::{ChainLensError, PartialDataWarning, Result};
use crate::providers::ServerProvider;

/// Tracked-branch queries with caching per operation, caller and parameters.
pub struct TrackedService {
    tracked: TrackedBranches,
    analysis: AnalysisConfig,
    provider: Arc<dyn ServerProvider>,
    aggregator: Arc<MultiServerAggregator>,
    live: ResultCache<ConsolidatedStatus>,
    merged: ResultCache<ConsolidatedStatus>,
}

impl TrackedService {
    pub fn new(config: &Config, provider: Arc<dyn ServerProvider>) -> Self {
        Self {
            tracked: config.tracked_branches(),
            analysis: config.analysis.clone(),
            aggregator: Arc::new(MultiServerAggregator::new(
                Arc::clone(&provider),
                config.analysis.annotations.clone(),
            )),
            provider,
            live: ResultCache::new(config.cache.live_ttl(), true),
            merged: ResultCache::new(config.cache.merged_ttl(), false),
        }
    }

    fn resolve(&self, params: &QueryParams) -> Result<BranchTracked> {
        Ok(self.tracked.branch_mandatory(&params.branch)?.clone())
    }

    async fn cached(
        &self,
        cache: &ResultCache<ConsolidatedStatus>,
        operation: &'static str,
        params: QueryParams,
        creds: &Credentials,
    ) -> Result<Cached<ConsolidatedStatus>> {
        let tracked = self.resolve(&params)?;
        let key = CacheKey::new(operation, creds.scope(), params.clone());
        debug!("Query {key}, {} key(s) cached", cache.len());

        let aggregator = Arc::clone(&self.aggregator);
        let creds = creds.clone();
        cache
            .get(&key, move || async move {
                Ok::<_, ChainLensError>(
                    aggregator
                        .aggregate(&tracked, params.count, params.check_all_logs, &creds)
                        .await,
                )
            })
            .await
    }

    /// Live status of the latest chain per entry, refreshed in the background.
    pub async fn results(
        &self,
        branch: Option<&str>,
        check_all_logs: Option<bool>,
        creds: &Credentials,
    ) -> Result<Cached<ConsolidatedStatus>> {
        let params = QueryParams::normalize(branch, None, check_all_logs, &self.analysis).latest_only();
        self.cached(&self.live, CURRENT_SUMMARY, params, creds).await
    }

    pub async fn results_no_cache(
        &self,
        branch: Option<&str>,
        check_all_logs: Option<bool>,
        creds: &Credentials,
    ) -> Result<ConsolidatedStatus> {
        let params = QueryParams::normalize(branch, None, check_all_logs, &self.analysis);
        let tracked = self.resolve(&params)?;
        Ok(self
            .aggregator
            .aggregate(&tracked, 1, params.check_all_logs, creds)
            .await)
    }

    pub async fn updates(
        &self,
        branch: Option<&str>,
        check_all_logs: Option<bool>,
        creds: &Credentials,
    ) -> Result<UpdateInfo> {
        Ok(self.results(branch, check_all_logs, creds).await?.info)
    }

    /// Status merged over the `count` most recent chains per entry.
    pub async fn merged_results(
        &self,
        branch: Option<&str>,
        count: Option<usize>,
        check_all_logs: Option<bool>,
        creds: &Credentials,
    ) -> Result<Cached<ConsolidatedStatus>> {
        let params = QueryParams::normalize(branch, count, check_all_logs, &self.analysis);
        self.cached(&self.merged, MERGED_SUMMARY, params, creds).await
    }

    pub async fn merged_results_no_cache(
        &self,
        branch: Option<&str>,
        count: Option<usize>,
        check_all_logs: Option<bool>,
        creds: &Credentials,
    ) -> Result<ConsolidatedStatus> {
        let params = QueryParams::normalize(branch, count, check_all_logs, &self.analysis);
        let tracked = self.resolve(&params)?;
        Ok(self
            .aggregator
            .aggregate(&tracked, params.count, params.check_all_logs, creds)
            .await)
    }

    pub async fn merged_updates(
        &self,
        branch: Option<&str>,
        count: Option<usize>,
        check_all_logs: Option<bool>,
        creds: &Credentials,
    ) -> Result<UpdateInfo> {
        Ok(self
            .merged_results(branch, count, check_all_logs, creds)
            .await?
            .info)
    }

    /// Collects the day-by-day history of every accessible entry of a branch.
    ///
    /// A failing entry does not stop the others; it is reported as a warning.
    pub async fn history(
        &self,
        branch: Option<&str>,
        creds: &Credentials,
    ) -> Result<(BuildMetricsHistory, Vec<PartialDataWarning>)> {
        let params = QueryParams::normalize(branch, None, None, &self.analysis);
        let tracked = self.resolve(&params)?;
        let history = BuildMetricsHistory::new();

        let results = join_all(
            tracked
                .chains
                .iter()
                .filter(|chain| self.provider.has_access(&chain.server_id, creds))
                .map(|chain| {
                    let history = &history;
                    async move {
                        let outcome: Result<()> = async {
                            let server = self.provider.server(&chain.server_id, creds).await?;
                            collect(&server, &chain.suite_id, &chain.branch, history).await
                        }
                        .await;
                        outcome.map_err(|e| {
                            warn!(
                                "History of {} on {} incomplete: {e}",
                                chain.suite_id, chain.server_id
                            );
                            PartialDataWarning::new(format!("{} {}", chain.server_id, chain.suite_id), e)
                        })
                    }
                }),
        )
        .await;

        let warnings = results.into_iter().filter_map(std::result::Result::err).collect();
        Ok((history, warnings))
    }

    /// The tracked branch a query for `branch` resolves to.
    pub fn branch_or_default(&self, branch: Option<&str>) -> String {
        QueryParams::normalize(branch, None, None, &self.analysis).branch
    }

    pub fn low_pass_rate(&self) -> f64 {
        self.analysis.low_pass_rate
    }
}
