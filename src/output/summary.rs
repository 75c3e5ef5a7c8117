use std::fmt::Write;

use crate::cache::Cached;
use crate::tracked::{ChainAtServerStatus, ConsolidatedStatus, SuiteCurrentStatus};

use super::report::HistoryReport;
use super::styling::{bright, bright_green, bright_yellow, cyan, dim, problem_count, running_count};
use super::tables::{create_table, failure_count_cell, header, pass_rate_cell, problems_cell};
use comfy_table::Cell;

/// Prints a color-coded status of a tracked branch to stdout.
///
/// Sections:
/// - Overview: totals across all entries
/// - Entries: one row per (server, suite, branch)
/// - Needs Attention: suites that failed at least once or are still running
/// - Update Info: content hash and whether a refresh is under way
pub fn print_status(status: &Cached<ConsolidatedStatus>, low_pass_rate: f64) {
    println!("{}", render_status(status, low_pass_rate));
}

pub fn print_history(report: &HistoryReport) {
    println!("{}", render_history(report));
}

fn add_section_header(output: &mut String, emoji: &str, title: &str) {
    let _ = writeln!(output, "{} {}", bright(emoji), bright(title).underlined());
}

fn needs_attention(suite: &SuiteCurrentStatus) -> bool {
    suite.runs.success < suite.runs.total_run || suite.running || !suite.problems.is_empty()
}

fn write_warnings(output: &mut String, warnings: impl Iterator<Item = (String, String)>) {
    for (scope, warning) in warnings {
        let _ = writeln!(output, "  {} {} {}", bright_yellow("⚠"), dim(scope), warning);
    }
}

fn entry_warnings(entry: &ChainAtServerStatus) -> impl Iterator<Item = (String, String)> + '_ {
    entry
        .warnings
        .iter()
        .map(move |w| (entry.display_name(), w.to_string()))
}

pub fn render_status(cached: &Cached<ConsolidatedStatus>, low_pass_rate: f64) -> String {
    let status = &cached.value;
    let mut output = String::new();

    add_section_header(&mut output, "📊", "Overview");
    let _ = writeln!(
        output,
        "  {} {}\n  {} {}\n  {} {}\n  {} {}\n  {} {}\n  {} {}\n",
        dim("Tracked branch:"),
        cyan(&status.tracked_branch),
        dim("Entries:"),
        bright_yellow(status.servers.len()),
        dim("Failed tests:"),
        problem_count(status.failed_tests),
        dim("Muted tests:"),
        dim(status.muted_tests),
        dim("Build problems:"),
        problem_count(status.build_problems),
        dim("Running builds:"),
        running_count(status.running_updates),
    );

    if status.servers.is_empty() {
        let _ = writeln!(output, "{}", bright_yellow("No accessible entries for this branch."));
    } else {
        add_section_header(&mut output, "🔗", "Entries");
        let mut table = create_table();
        table.set_header(header(&[
            "Server", "Suite", "Branch", "Chains", "Failed", "Muted", "Total", "Problems",
            "Running",
        ]));
        for entry in &status.servers {
            table.add_row(vec![
                Cell::new(&entry.server_id),
                Cell::new(&entry.suite_id),
                Cell::new(&entry.branch_name),
                Cell::new(
                    entry
                        .chain_ids
                        .iter()
                        .map(u64::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                ),
                failure_count_cell(entry.failed_tests),
                Cell::new(entry.muted_tests),
                Cell::new(entry.total_tests),
                failure_count_cell(entry.build_problems),
                Cell::new(entry.running_builds),
            ]);
        }
        let _ = writeln!(output, "{table}\n");

        let attention: Vec<(&ChainAtServerStatus, &SuiteCurrentStatus)> = status
            .servers
            .iter()
            .flat_map(|entry| {
                entry
                    .suites
                    .iter()
                    .filter(|s| needs_attention(s))
                    .map(move |s| (entry, s))
            })
            .collect();

        add_section_header(&mut output, "🔥", "Needs Attention");
        if attention.is_empty() {
            let _ = writeln!(output, "  {}\n", bright_green("All suites passed ✓"));
        } else {
            let mut table = create_table();
            table.set_header(header(&[
                "Entry", "Suite", "Failed", "Pass Rate", "Problems", "Contact",
            ]));
            for (entry, suite) in attention {
                table.add_row(vec![
                    Cell::new(entry.display_name()),
                    Cell::new(&suite.name),
                    failure_count_cell(suite.failed_tests),
                    pass_rate_cell(suite.pass_rate(), low_pass_rate),
                    problems_cell(&suite.problems, suite.running),
                    Cell::new(suite.contact_person.as_deref().unwrap_or("-")),
                ]);
            }
            let _ = writeln!(output, "{table}\n");
        }
    }

    if !status.warnings.is_empty() || status.servers.iter().any(|e| !e.warnings.is_empty()) {
        add_section_header(&mut output, "⚠️", "Warnings");
        write_warnings(
            &mut output,
            status
                .warnings
                .iter()
                .map(|w| (w.entity.clone(), w.reason.clone())),
        );
        for entry in &status.servers {
            write_warnings(&mut output, entry_warnings(entry));
        }
        output.push('\n');
    }

    add_section_header(&mut output, "🔄", "Update Info");
    let _ = writeln!(
        output,
        "  {} {}\n  {} {}\n  {} {}",
        dim("Hash:"),
        dim(&cached.info.hash_code_hex),
        dim("Refresh in progress:"),
        if cached.info.update_required {
            bright_yellow("yes")
        } else {
            bright_green("no")
        },
        dim("Running updates:"),
        running_count(cached.info.running_updates),
    );

    output
}

pub fn render_history(report: &HistoryReport) -> String {
    let mut output = String::new();

    add_section_header(&mut output, "📅", "History");
    let _ = writeln!(
        output,
        "  {} {}\n  {} {}\n",
        dim("Tracked branch:"),
        cyan(&report.tracked_branch),
        dim("Days:"),
        bright_yellow(report.dates.len()),
    );

    if report.rows.is_empty() || report.dates.is_empty() {
        let _ = writeln!(output, "{}", bright_yellow("No finished chains found."));
    } else {
        let mut labels = vec!["Entry"];
        labels.extend(report.dates.iter().map(String::as_str));

        let mut table = create_table();
        table.set_header(header(&labels));
        for row in &report.rows {
            let mut cells = vec![Cell::new(format!(
                "{} {}\n{}",
                row.server_id, row.suite_id, row.branch
            ))];
            cells.extend(row.days.iter().map(|day| match day {
                Some(day) => Cell::new(format!(
                    "{} problem(s)\n{} failed\n{} muted\n{} total",
                    day.build_problems, day.failed_tests, day.muted_tests, day.total_tests
                )),
                None => Cell::new("-"),
            }));
            table.add_row(cells);
        }
        let _ = writeln!(output, "{table}\n");
    }

    add_section_header(
        &mut output,
        "📉",
        &format!("Pass Rate Below {:.2}", report.threshold),
    );
    if report.low_pass_rate.is_empty() {
        let _ = writeln!(output, "  {}", bright_green("No unreliable suites ✓"));
    } else {
        let mut table = create_table();
        table.set_header(header(&["Server", "Suite", "Pass Rate", "Passed", "Runs"]));
        for suite in &report.low_pass_rate {
            table.add_row(vec![
                Cell::new(&suite.server_id),
                Cell::new(&suite.suite_name),
                pass_rate_cell(Some(suite.pass_rate), report.threshold),
                Cell::new(suite.success),
                Cell::new(suite.total_run),
            ]);
        }
        let _ = writeln!(output, "{table}");
    }

    if !report.warnings.is_empty() {
        output.push('\n');
        add_section_header(&mut output, "⚠️", "Warnings");
        write_warnings(
            &mut output,
            report
                .warnings
                .iter()
                .map(|w| (w.entity.clone(), w.reason.clone())),
        );
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::UpdateInfo;
    use crate::chain::failure_rate::FailuresHistory;
    use crate::error::PartialDataWarning;
    use std::sync::Arc;

    fn suite(name: &str, failed: usize, success: usize, total_run: usize) -> SuiteCurrentStatus {
        SuiteCurrentStatus {
            name: name.to_string(),
            suite_id: format!("{name}_Id"),
            branch_name: "master".to_string(),
            build_ids: vec![1],
            failed_tests: failed,
            muted_tests: 0,
            total_tests: 10,
            problems: vec![],
            contact_person: None,
            runs: FailuresHistory { success, total_run },
            running: false,
            web_url: None,
        }
    }

    fn cached(status: ConsolidatedStatus) -> Cached<ConsolidatedStatus> {
        Cached {
            value: Arc::new(status),
            info: UpdateInfo {
                update_required: true,
                running_updates: 2,
                hash_code_hex: "abc123".to_string(),
            },
        }
    }

    fn status() -> ConsolidatedStatus {
        let mut entry = ChainAtServerStatus::new(&crate::config::ChainAtServerTracked {
            server_id: "apache".to_string(),
            suite_id: "RunAll".to_string(),
            branch: "master".to_string(),
        });
        let mut flaky = suite("Cache", 3, 1, 2);
        flaky.contact_person = Some("Anton".to_string());
        entry.suites = vec![suite("Basic", 0, 2, 2), flaky];
        entry.failed_tests = 3;
        entry
            .warnings
            .push(PartialDataWarning::new("build 7", "build not found"));

        let mut status = ConsolidatedStatus::new("master");
        status.servers.push(entry);
        status.post_process(2);
        status
    }

    #[test]
    fn status_lists_only_suites_needing_attention() {
        let rendered = console::strip_ansi_codes(&render_status(&cached(status()), 0.6)).to_string();

        assert!(rendered.contains("Needs Attention"));
        assert!(rendered.contains("Cache"));
        assert!(rendered.contains("Anton"));
        assert!(rendered.contains("0.50"));
        assert!(!rendered.contains("Basic"));
        assert!(rendered.contains("build not found"));
        assert!(rendered.contains("abc123"));
    }

    #[test]
    fn empty_status_says_so() {
        let rendered =
            console::strip_ansi_codes(&render_status(&cached(ConsolidatedStatus::new("dev")), 0.2))
                .to_string();

        assert!(rendered.contains("No accessible entries"));
        assert!(!rendered.contains("Needs Attention"));
    }

    #[test]
    fn empty_history_says_so() {
        let report = HistoryReport {
            tracked_branch: "master".to_string(),
            dates: vec![],
            rows: vec![],
            threshold: 0.2,
            low_pass_rate: vec![],
            warnings: vec![PartialDataWarning::new("down RunAll", "unreachable")],
        };

        let rendered = console::strip_ansi_codes(&render_history(&report)).to_string();

        assert!(rendered.contains("No finished chains found."));
        assert!(rendered.contains("No unreliable suites"));
        assert!(rendered.contains("down RunAll"));
    }
}
