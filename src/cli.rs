use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Credentials;
use crate::cache::{content_hash, Cached, UpdateInfo};
use crate::config::{Config, OutputFormat};
use crate::output::{self, HistoryReport, PhaseProgress};
use crate::providers::{ConfiguredServers, ServerProvider};
use crate::tracked::{ConsolidatedStatus, TrackedService};

#[derive(Parser)]
#[command(name = "chainlens")]
#[command(author, version, about = "Build chain status across CI servers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, env = "CHAINLENS_CONFIG")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,

    #[arg(short, long, global = true, value_enum)]
    format: Option<OutputFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Status of the latest chain of every entry of a tracked branch
    Results {
        #[arg(short, long)]
        branch: Option<String>,

        #[arg(long)]
        check_all_logs: bool,

        /// Print only the freshness descriptor
        #[arg(long)]
        updates_only: bool,

        /// Recompute instead of going through the result cache
        #[arg(long, conflicts_with = "updates_only")]
        no_cache: bool,
    },
    /// Status merged over the most recent chains of every entry
    Merged {
        #[arg(short, long)]
        branch: Option<String>,

        #[arg(short = 'n', long)]
        count: Option<usize>,

        #[arg(long)]
        check_all_logs: bool,

        #[arg(long)]
        updates_only: bool,

        #[arg(long, conflicts_with = "updates_only")]
        no_cache: bool,
    },
    /// Day-by-day history and least reliable suites
    History {
        #[arg(short, long)]
        branch: Option<String>,
    },
    /// Polls the merged status and prints it whenever it changes
    Watch {
        #[arg(short, long)]
        branch: Option<String>,

        #[arg(short = 'n', long)]
        count: Option<usize>,

        #[arg(short, long, default_value_t = 30)]
        interval: u64,

        /// Stop after this many polls
        #[arg(long)]
        iterations: Option<usize>,
    },
    /// Writes the default configuration to a file
    Init {
        #[arg(default_value = "chainlens.toml")]
        path: PathBuf,
    },
}

/// Wraps a freshly computed status so it renders like a cached one.
fn uncached(status: ConsolidatedStatus) -> Result<Cached<ConsolidatedStatus>> {
    let info = UpdateInfo {
        update_required: false,
        running_updates: status.running_updates,
        hash_code_hex: content_hash(&status)?,
    };
    Ok(Cached {
        value: Arc::new(status),
        info,
    })
}

/// Everything a query command needs, built from the loaded configuration.
struct Session {
    service: TrackedService,
    credentials: Credentials,
    format: OutputFormat,
    pretty: bool,
}

impl Cli {
    fn session(&self) -> Result<Session> {
        let config = Config::load(self.config.as_deref())?;
        config.validate().context("Invalid configuration")?;

        let provider: Arc<dyn ServerProvider> = Arc::new(ConfiguredServers::new(&config.servers));
        info!(
            "Loaded {} server(s) and {} tracked branch(es)",
            config.servers.len(),
            config.tracked.len()
        );

        Ok(Session {
            service: TrackedService::new(&config, provider),
            credentials: config.credentials(),
            format: self.format.unwrap_or(config.output.format),
            pretty: self.pretty || config.output.pretty,
        })
    }

    fn writer(&self) -> Result<Box<dyn Write>> {
        match &self.output {
            Some(path) => {
                let file = std::fs::File::create(path)
                    .with_context(|| format!("Failed to create output file: {}", path.display()))?;
                Ok(Box::new(std::io::BufWriter::new(file)))
            }
            None => Ok(Box::new(std::io::stdout())),
        }
    }

    fn finish_output(&self) {
        if let Some(path) = &self.output {
            info!("Output written to: {}", path.display());
        }
    }

    fn write_status(&self, session: &Session, cached: &Cached<ConsolidatedStatus>) -> Result<()> {
        let threshold = session.service.low_pass_rate();
        match (session.format, &self.output) {
            (OutputFormat::Summary, None) => output::print_status(cached, threshold),
            (OutputFormat::Summary, Some(_)) => {
                let mut writer = self.writer()?;
                writeln!(
                    writer,
                    "{}",
                    console::strip_ansi_codes(&output::render_status(cached, threshold))
                )?;
                writer.flush()?;
            }
            (format, _) => {
                let mut writer = self.writer()?;
                output::export_status(cached, format, session.pretty, &mut writer)?;
                writer.flush()?;
            }
        }
        self.finish_output();
        Ok(())
    }

    fn write_update_info(&self, session: &Session, info: &UpdateInfo) -> Result<()> {
        let mut writer = self.writer()?;
        output::export_update_info(info, session.pretty, &mut writer)?;
        writer.flush()?;
        self.finish_output();
        Ok(())
    }

    async fn execute_results(
        &self,
        branch: Option<&str>,
        check_all_logs: bool,
        updates_only: bool,
        no_cache: bool,
    ) -> Result<()> {
        let session = self.session()?;
        let creds = &session.credentials;

        if updates_only {
            let info = session.service.updates(branch, Some(check_all_logs), creds).await?;
            return self.write_update_info(&session, &info);
        }

        let progress = PhaseProgress::start(1, "Loading latest chains");
        let cached = if no_cache {
            uncached(
                session
                    .service
                    .results_no_cache(branch, Some(check_all_logs), creds)
                    .await?,
            )?
        } else {
            session
                .service
                .results(branch, Some(check_all_logs), creds)
                .await?
        };
        progress.finish(&format!("{} entries loaded", cached.value.servers.len()));

        self.write_status(&session, &cached)
    }

    async fn execute_merged(
        &self,
        branch: Option<&str>,
        count: Option<usize>,
        check_all_logs: bool,
        updates_only: bool,
        no_cache: bool,
    ) -> Result<()> {
        let session = self.session()?;
        let creds = &session.credentials;

        if updates_only {
            let info = session
                .service
                .merged_updates(branch, count, Some(check_all_logs), creds)
                .await?;
            return self.write_update_info(&session, &info);
        }

        let progress = PhaseProgress::start(1, "Merging recent chains");
        let cached = if no_cache {
            uncached(
                session
                    .service
                    .merged_results_no_cache(branch, count, Some(check_all_logs), creds)
                    .await?,
            )?
        } else {
            session
                .service
                .merged_results(branch, count, Some(check_all_logs), creds)
                .await?
        };
        progress.finish(&format!("{} entries merged", cached.value.servers.len()));

        self.write_status(&session, &cached)
    }

    async fn execute_history(&self, branch: Option<&str>) -> Result<()> {
        let session = self.session()?;
        let progress = PhaseProgress::start(2, "Collecting first build of each day");
        let (history, warnings) = session.service.history(branch, &session.credentials).await?;
        let progress = progress.next(
            &format!("{} day(s) collected", history.dates().len()),
            "Computing pass rates",
        );

        let tracked_branch = session.service.branch_or_default(branch);
        let report = HistoryReport::build(
            &tracked_branch,
            &history,
            warnings,
            session.service.low_pass_rate(),
        );
        progress.finish(&format!("{} unreliable suite(s)", report.low_pass_rate.len()));

        match (session.format, &self.output) {
            (OutputFormat::Summary, None) => output::print_history(&report),
            (OutputFormat::Summary, Some(_)) => {
                let mut writer = self.writer()?;
                writeln!(writer, "{}", console::strip_ansi_codes(&output::render_history(&report)))?;
                writer.flush()?;
            }
            (format, _) => {
                let mut writer = self.writer()?;
                output::export_history(&report, format, session.pretty, &mut writer)?;
                writer.flush()?;
            }
        }
        self.finish_output();
        Ok(())
    }

    async fn execute_watch(
        &self,
        branch: Option<&str>,
        count: Option<usize>,
        interval: u64,
        iterations: Option<usize>,
    ) -> Result<()> {
        let session = self.session()?;
        let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
        let mut last_hash: Option<String> = None;
        let mut polls = 0usize;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping watch");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match session
                .service
                .merged_results(branch, count, None, &session.credentials)
                .await
            {
                Ok(cached) => {
                    if last_hash.as_deref() != Some(cached.info.hash_code_hex.as_str()) {
                        self.write_status(&session, &cached)?;
                        last_hash = Some(cached.info.hash_code_hex.clone());
                    } else {
                        info!(
                            "Unchanged ({}), {} update(s) running",
                            cached.info.hash_code_hex, cached.info.running_updates
                        );
                    }
                }
                Err(e) => warn!("Poll failed: {e}"),
            }

            polls += 1;
            if iterations.is_some_and(|max| polls >= max) {
                break;
            }
        }

        Ok(())
    }

    fn execute_init(path: &std::path::Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Refusing to overwrite existing file: {}", path.display());
        }
        Config::default().save(path)?;
        info!("Default configuration written to: {}", path.display());
        Ok(())
    }

    pub async fn execute(&self) -> Result<()> {
        match &self.command {
            Commands::Results {
                branch,
                check_all_logs,
                updates_only,
                no_cache,
            } => {
                self.execute_results(branch.as_deref(), *check_all_logs, *updates_only, *no_cache)
                    .await
            }
            Commands::Merged {
                branch,
                count,
                check_all_logs,
                updates_only,
                no_cache,
            } => {
                self.execute_merged(
                    branch.as_deref(),
                    *count,
                    *check_all_logs,
                    *updates_only,
                    *no_cache,
                )
                .await
            }
            Commands::History { branch } => self.execute_history(branch.as_deref()).await,
            Commands::Watch {
                branch,
                count,
                interval,
                iterations,
            } => {
                self.execute_watch(branch.as_deref(), *count, *interval, *iterations)
                    .await
            }
            Commands::Init { path } => Self::execute_init(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "chainlens", "merged", "-b", "master", "-n", "5", "--format", "json", "--pretty",
        ])
        .unwrap();

        assert!(cli.pretty);
        assert_eq!(cli.format, Some(OutputFormat::Json));
        assert!(matches!(
            cli.command,
            Commands::Merged { count: Some(5), ref branch, .. } if branch.as_deref() == Some("master")
        ));
    }

    #[test]
    fn no_cache_conflicts_with_updates_only() {
        assert!(Cli::try_parse_from(["chainlens", "results", "--no-cache", "--updates-only"]).is_err());
    }

    #[test]
    fn uncached_status_hashes_its_content() {
        let a = uncached(ConsolidatedStatus::new("master")).unwrap();
        let b = uncached(ConsolidatedStatus::new("master")).unwrap();
        let c = uncached(ConsolidatedStatus::new("dev")).unwrap();

        assert!(!a.info.update_required);
        assert_eq!(a.info.hash_code_hex, b.info.hash_code_hex);
        assert_ne!(a.info.hash_code_hex, c.info.hash_code_hex);
    }

    #[test]
    fn watch_defaults_to_thirty_seconds() {
        let cli = Cli::try_parse_from(["chainlens", "watch"]).unwrap();

        assert!(matches!(
            cli.command,
            Commands::Watch { interval: 30, iterations: None, .. }
        ));
    }

    #[test]
    fn init_writes_a_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainlens.toml");

        tokio_test::assert_ok!(Cli::execute_init(&path));
        let loaded = tokio_test::assert_ok!(Config::load(Some(&path)));

        assert_eq!(loaded.analysis.default_branch, "master");
        tokio_test::assert_err!(Cli::execute_init(&path));
    }
}
