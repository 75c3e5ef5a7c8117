use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};

use super::status::{ChainAtServerStatus, ConsolidatedStatus};
use crate::auth::Credentials;
use crate::chain::keys::{select_chain_roots, BuildRef};
use crate::chain::loader::{process_build_chains, Annotations, ChainOptions};
use crate::config::{BranchTracked, ChainAtServerTracked};
use crate::error::{PartialDataWarning, Result};
use crate::providers::ServerProvider;

/// Builds the consolidated status of a tracked branch across its servers.
pub struct MultiServerAggregator {
    provider: Arc<dyn ServerProvider>,
    annotations: Arc<Annotations>,
}

impl MultiServerAggregator {
    pub fn new(provider: Arc<dyn ServerProvider>, annotations: Annotations) -> Self {
        Self {
            provider,
            annotations: Arc::new(annotations),
        }
    }

    /// Loads the `merge_count` most recent chains of every entry the
    /// credentials can access and merges them per entry.
    ///
    /// Entries without access are left out. An entry whose server fails is
    /// kept without data and its failure is recorded as a warning, so the
    /// result is always complete for what could be reached.
    pub async fn aggregate(
        &self,
        tracked: &BranchTracked,
        merge_count: usize,
        check_all_logs: bool,
        creds: &Credentials,
    ) -> ConsolidatedStatus {
        let options = ChainOptions::for_merge_count(merge_count, check_all_logs);

        let accessible: Vec<&ChainAtServerTracked> = tracked
            .chains
            .iter()
            .filter(|chain| {
                let allowed = self.provider.has_access(&chain.server_id, creds);
                if !allowed {
                    debug!(
                        "Skipping {} on {}: no access for {}",
                        chain.suite_id,
                        chain.server_id,
                        creds.scope()
                    );
                }
                allowed
            })
            .collect();

        let entries = join_all(
            accessible
                .iter()
                .map(|chain| self.aggregate_entry(chain, merge_count, options, creds)),
        )
        .await;

        let mut status = ConsolidatedStatus::new(&tracked.id);
        let mut running_updates = 0;

        for (chain, entry) in accessible.iter().zip(entries) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        "Dropping data of {} on {} for {}: {e}",
                        chain.suite_id, chain.server_id, tracked.id
                    );
                    let mut empty = ChainAtServerStatus::new(chain);
                    let warning = PartialDataWarning::new(format!("{} {}", chain.server_id, chain.suite_id), e);
                    empty.warnings.push(warning.clone());
                    status.warnings.push(warning);
                    empty
                }
            };
            running_updates += entry.running_builds;
            status.servers.push(entry);
        }

        status.post_process(running_updates);

        info!(
            "Aggregated {} entr(ies) of {}, {} update(s) running",
            status.servers.len(),
            tracked.id,
            status.running_updates
        );

        status
    }

    async fn aggregate_entry(
        &self,
        chain: &ChainAtServerTracked,
        merge_count: usize,
        options: ChainOptions,
        creds: &Credentials,
    ) -> Result<ChainAtServerStatus> {
        let server = self.provider.server(&chain.server_id, creds).await?;

        let mut candidates: Vec<BuildRef> = server
            .list_finished_builds(&chain.suite_id, &chain.branch)
            .await?;
        if options.include_scheduled {
            candidates.extend(
                server
                    .list_scheduled_builds(&chain.suite_id, &chain.branch)
                    .await?,
            );
        }

        let roots = select_chain_roots(&candidates, merge_count, options.include_scheduled);
        debug!(
            "{} on {}: merging {} of {} candidate chain(s)",
            chain.suite_id,
            chain.server_id,
            roots.len(),
            candidates.len()
        );

        let mut entry = ChainAtServerStatus::new(chain);
        if let Some(ctx) =
            process_build_chains(&server, &roots, options, Some(self.annotations.as_ref())).await
        {
            entry.init_from(&ctx);
            entry.web_url = entry
                .chain_ids
                .first()
                .and_then(|id| server.build_web_url(*id));
        }

        Ok(entry)
    }
}
