use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;

use crate::chain::history::BuildMetricsHistory;
use crate::error::PartialDataWarning;

/// Server-local date `YYYYMMDD` as `dd.MM.yyyy`; unparseable input is kept.
pub fn display_date(day: &str) -> String {
    NaiveDate::parse_from_str(day, "%Y%m%d")
        .map(|d| d.format("%d.%m.%Y").to_string())
        .unwrap_or_else(|_| day.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayMetrics {
    pub build_problems: usize,
    pub failed_tests: usize,
    pub muted_tests: usize,
    pub total_tests: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRow {
    pub server_id: String,
    pub suite_id: String,
    pub branch: String,
    /// One slot per report date; `None` where nothing ran that day.
    pub days: Vec<Option<DayMetrics>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LowPassRate {
    pub server_id: String,
    pub suite_name: String,
    pub pass_rate: f64,
    pub success: usize,
    pub total_run: usize,
}

/// Day-by-day metrics of a tracked branch and its least reliable suites.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReport {
    pub tracked_branch: String,
    pub dates: Vec<String>,
    pub rows: Vec<HistoryRow>,
    pub threshold: f64,
    pub low_pass_rate: Vec<LowPassRate>,
    pub warnings: Vec<PartialDataWarning>,
}

impl HistoryReport {
    pub fn build(
        tracked_branch: &str,
        history: &BuildMetricsHistory,
        warnings: Vec<PartialDataWarning>,
        threshold: f64,
    ) -> Self {
        let days: Vec<String> = history.dates().into_iter().collect();

        let rows = history
            .keys()
            .into_iter()
            .map(|key| HistoryRow {
                days: days
                    .iter()
                    .map(|day| {
                        history.build(&key, day).map(|ctx| DayMetrics {
                            build_problems: ctx.build_problems(),
                            failed_tests: ctx.failed_tests(),
                            muted_tests: ctx.muted_tests(),
                            total_tests: ctx.total_tests(),
                        })
                    })
                    .collect(),
                server_id: key.server_id,
                suite_id: key.suite.suite_id,
                branch: key.suite.branch,
            })
            .collect();

        let low_pass_rate = history
            .failure_rates()
            .below(threshold)
            .into_iter()
            .filter_map(|(key, runs)| {
                let (server_id, suite_name) = key.split_once('\t')?;
                Some(LowPassRate {
                    server_id: server_id.to_string(),
                    suite_name: suite_name.to_string(),
                    pass_rate: runs.pass_rate()?,
                    success: runs.success,
                    total_run: runs.total_run,
                })
            })
            .collect();

        Self {
            tracked_branch: tracked_branch.to_string(),
            dates: days.iter().map(|d| display_date(d)).collect(),
            rows,
            threshold,
            low_pass_rate,
            warnings,
        }
    }
}

impl fmt::Display for HistoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "History of {}", self.tracked_branch)?;
        for row in &self.rows {
            writeln!(f, "{} {} [{}]", row.server_id, row.suite_id, row.branch)?;
            for (date, day) in self.dates.iter().zip(&row.days) {
                if let Some(day) = day {
                    writeln!(
                        f,
                        "  {date}: {} build problem(s), {} failed, {} muted, {} total",
                        day.build_problems, day.failed_tests, day.muted_tests, day.total_tests
                    )?;
                }
            }
        }
        writeln!(f, "Suites with pass rate below {:.2}:", self.threshold)?;
        for suite in &self.low_pass_rate {
            writeln!(
                f,
                "  {} {}: {:.2} ({}/{})",
                suite.server_id, suite.suite_name, suite.pass_rate, suite.success, suite.total_run
            )?;
        }
        for warning in &self.warnings {
            writeln!(f, "warning: {warning}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::history::collect;
    use crate::chain::keys::BuildRef;
    use crate::providers::mock::MockServer;
    use crate::providers::CiServer;
    use std::sync::Arc;

    #[test]
    fn dates_are_shown_day_first() {
        assert_eq!(display_date("20180219"), "19.02.2018");
        assert_eq!(display_date("garbage"), "garbage");
    }

    async fn collected() -> BuildMetricsHistory {
        let mut broken = crate::chain::context::suite_run(2, "Cache");
        broken.suite_id = "Cache".to_string();
        broken.failed_tests = 1;

        let server: Arc<dyn CiServer> = Arc::new(
            MockServer::new("apache")
                .with_chain(
                    BuildRef::new(100, "RunAll", "master"),
                    "20180219T090000+0300",
                    vec![BuildRef::new(1, "Basic", "master")],
                )
                .with_chain(
                    BuildRef::new(101, "RunAll", "master"),
                    "20180220T090000+0300",
                    vec![BuildRef::new(2, "Cache", "master")],
                )
                .with_result(broken),
        );
        let history = BuildMetricsHistory::new();
        collect(&server, "RunAll", "master", &history).await.unwrap();
        history
    }

    #[tokio::test]
    async fn rows_align_with_dates() {
        let history = collected().await;

        let report = HistoryReport::build("master", &history, vec![], 0.2);

        assert_eq!(report.dates, vec!["19.02.2018", "20.02.2018"]);
        assert_eq!(report.rows.len(), 1);
        let days = &report.rows[0].days;
        assert_eq!(days[0].unwrap().failed_tests, 0);
        assert_eq!(days[1].unwrap().failed_tests, 1);
        assert_eq!(days[1].unwrap().total_tests, 10);
    }

    #[tokio::test]
    async fn low_pass_rate_lists_only_failing_suites() {
        let history = collected().await;

        let report = HistoryReport::build("master", &history, vec![], 0.2);

        assert_eq!(report.low_pass_rate.len(), 1);
        assert_eq!(report.low_pass_rate[0].suite_name, "Cache");
        assert_eq!(report.low_pass_rate[0].pass_rate, 0.0);

        let text = report.to_string();
        assert!(text.contains("19.02.2018: 0 build problem(s), 0 failed"));
        assert!(text.contains("apache Cache: 0.00 (0/1)"));
    }
}
