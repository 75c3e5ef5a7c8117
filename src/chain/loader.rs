use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::context::{BuildRunContext, ChainRunContext};
use super::keys::BuildRef;
use crate::error::{ChainLensError, PartialDataWarning, Result};
use crate::providers::CiServer;

/// Contact person per suite id.
pub type Annotations = HashMap<String, String>;

/// How recorded sub-build references are replaced by re-runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatestRebuildMode {
    /// Use the sub-builds recorded in the chain.
    None,
    /// Replace each sub-build by its most recent rebuild.
    Latest,
    /// Keep the recorded sub-build and add its most recent rebuild.
    All,
}

/// Which sub-builds get a deeper log scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessLogsMode {
    Disabled,
    /// Only suites that crashed, timed out or ran out of memory.
    SuiteNotComplete,
    All,
}

impl ProcessLogsMode {
    fn should_process(self, ctx: &BuildRunContext) -> bool {
        match self {
            Self::Disabled => false,
            Self::SuiteNotComplete => ctx.has_critical_problem(),
            Self::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainOptions {
    pub rebuild: LatestRebuildMode,
    pub logs: ProcessLogsMode,
    /// Whether queued or running builds take part.
    pub include_scheduled: bool,
}

impl ChainOptions {
    /// Processing mode for a view over the `merge_count` most recent chains.
    ///
    /// Merged views use every rebuild and only scan logs on request; the
    /// single latest view follows the newest rebuild, scans logs of
    /// incomplete suites, and includes builds that have not finished yet.
    pub fn for_merge_count(merge_count: usize, check_all_logs: bool) -> Self {
        if merge_count > 1 {
            Self {
                rebuild: LatestRebuildMode::All,
                logs: if check_all_logs {
                    ProcessLogsMode::All
                } else {
                    ProcessLogsMode::Disabled
                },
                include_scheduled: false,
            }
        } else {
            Self {
                rebuild: LatestRebuildMode::Latest,
                logs: if check_all_logs {
                    ProcessLogsMode::All
                } else {
                    ProcessLogsMode::SuiteNotComplete
                },
                include_scheduled: true,
            }
        }
    }
}

/// Loads the full chain of one root build.
///
/// Sub-builds that cannot be loaded are dropped and recorded as warnings;
/// only failures on the root itself are returned as errors.
///
/// # Errors
///
/// * `NotFound` if the root is a placeholder or no longer exists
/// * `UpstreamUnavailable` if the server cannot be reached for the root
pub async fn load_chain_context(
    server: &Arc<dyn CiServer>,
    root: &BuildRef,
    include_latest_rebuild: bool,
    process_logs: bool,
    annotations: Option<&Annotations>,
) -> Result<ChainRunContext> {
    let options = ChainOptions {
        rebuild: if include_latest_rebuild {
            LatestRebuildMode::Latest
        } else {
            LatestRebuildMode::None
        },
        logs: if process_logs {
            ProcessLogsMode::SuiteNotComplete
        } else {
            ProcessLogsMode::Disabled
        },
        include_scheduled: true,
    };

    let (suites, warnings) = load_root(server, root, options, annotations).await?;

    Ok(ChainRunContext::new(vec![root.clone()], suites, warnings))
}

/// Loads several chain roots of the same suite and merges them into one context.
///
/// Roots are loaded concurrently; a root that fails is dropped with a
/// warning. Sub-builds shared between roots are counted once. Returns `None`
/// when no root could be loaded.
pub async fn process_build_chains(
    server: &Arc<dyn CiServer>,
    roots: &[BuildRef],
    options: ChainOptions,
    annotations: Option<&Annotations>,
) -> Option<ChainRunContext> {
    let results = join_all(
        roots
            .iter()
            .map(|root| load_root(server, root, options, annotations)),
    )
    .await;

    let mut loaded_roots = Vec::new();
    let mut suites = Vec::new();
    let mut warnings = Vec::new();

    for (root, result) in roots.iter().zip(results) {
        match result {
            Ok((root_suites, root_warnings)) => {
                loaded_roots.push(root.clone());
                suites.extend(root_suites);
                warnings.extend(root_warnings);
            }
            Err(e) => {
                warn!("Dropping chain {} on {}: {e}", root.describe(), server.server_id());
                warnings.push(PartialDataWarning::new(root.describe(), e));
            }
        }
    }

    if loaded_roots.is_empty() {
        return None;
    }

    let mut seen = HashSet::new();
    suites.retain(|s| seen.insert(s.build_id));

    Some(ChainRunContext::new(loaded_roots, suites, warnings))
}

async fn load_root(
    server: &Arc<dyn CiServer>,
    root: &BuildRef,
    options: ChainOptions,
    annotations: Option<&Annotations>,
) -> Result<(Vec<BuildRunContext>, Vec<PartialDataWarning>)> {
    if root.is_fake_stub() || root.id.is_none() {
        return Err(ChainLensError::not_found("chain root", root.describe()));
    }

    let dependencies = server.fetch_chain_dependencies(root).await?;
    debug!(
        "Chain {} has {} snapshot dependencies",
        root.describe(),
        dependencies.len()
    );

    let mut warnings = Vec::new();

    let resolved = join_all(
        dependencies
            .iter()
            .filter(|dep| !dep.is_fake_stub())
            .map(|dep| resolve_rebuilds(server, dep, options.rebuild)),
    )
    .await;

    let mut seen = HashSet::new();
    let refs: Vec<BuildRef> = resolved
        .into_iter()
        .flat_map(|(refs, warning)| {
            warnings.extend(warning);
            refs
        })
        .filter(|r| options.include_scheduled || !r.is_scheduled())
        .filter(|r| seen.insert(r.id))
        .collect();

    let loads = join_all(
        refs.iter()
            .map(|r| load_sub_build(server, r, options.logs, annotations)),
    )
    .await;

    let mut suites = Vec::with_capacity(refs.len());
    for (build, result) in refs.iter().zip(loads) {
        match result {
            Ok(Some(ctx)) => suites.push(ctx),
            Ok(None) => {
                debug!("Sub-build {} no longer exists, skipping", build.describe());
                warnings.push(PartialDataWarning::new(build.describe(), "build not found"));
            }
            Err(e) => {
                warn!("Failed to load sub-build {}: {e}", build.describe());
                warnings.push(PartialDataWarning::new(build.describe(), e));
            }
        }
    }

    Ok((suites, warnings))
}

async fn resolve_rebuilds(
    server: &Arc<dyn CiServer>,
    dependency: &BuildRef,
    mode: LatestRebuildMode,
) -> (Vec<BuildRef>, Option<PartialDataWarning>) {
    if mode == LatestRebuildMode::None {
        return (vec![dependency.clone()], None);
    }

    match server.find_latest_rebuild(dependency).await {
        Ok(latest) if mode == LatestRebuildMode::All && latest.id != dependency.id => {
            (vec![dependency.clone(), latest], None)
        }
        Ok(latest) => (vec![latest], None),
        Err(e) => {
            warn!(
                "Could not look up rebuilds of {}, using recorded build: {e}",
                dependency.describe()
            );
            (
                vec![dependency.clone()],
                Some(PartialDataWarning::new(dependency.describe(), e)),
            )
        }
    }
}

async fn load_sub_build(
    server: &Arc<dyn CiServer>,
    build: &BuildRef,
    logs: ProcessLogsMode,
    annotations: Option<&Annotations>,
) -> Result<Option<BuildRunContext>> {
    let Some(mut ctx) = server.load_suite_result(build).await? else {
        return Ok(None);
    };

    if logs.should_process(&ctx) {
        spawn_log_analysis(server.clone(), ctx.clone());
    }

    if let Some(contact) = annotations.and_then(|a| a.get(&ctx.suite_id)) {
        ctx.contact_person = Some(contact.clone());
    }

    Ok(Some(ctx))
}

/// Starts a log scan that the caller never waits for.
///
/// The outcome, success or failure, is only reported through the log.
pub fn spawn_log_analysis(server: Arc<dyn CiServer>, ctx: BuildRunContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        match server.analyze_build_log(&ctx).await {
            Ok(result) => info!(
                "Log of {} #{}: last started test {:?}, {} OOM lines, {} crash lines",
                ctx.suite_name,
                ctx.build_id,
                result.last_started_test,
                result.out_of_memory_lines,
                result.jvm_crash_lines
            ),
            Err(e) => warn!(
                "Log analysis of {} #{} on {} failed: {e}",
                ctx.suite_name,
                ctx.build_id,
                server.server_id()
            ),
        }
    })
}
