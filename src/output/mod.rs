mod exports;
mod progress;
mod report;
mod styling;
mod summary;
mod tables;

pub use exports::{export_history, export_status, export_update_info};
pub use progress::PhaseProgress;
pub use report::HistoryReport;
pub use styling::{dim, magenta_bold};
pub use summary::{print_history, print_status, render_history, render_status};

/// Prints the `ChainLens` banner to stderr.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        magenta_bold("🔗 ChainLens"),
        dim(env!("CARGO_PKG_VERSION")),
        dim("Build chain status across CI servers")
    );
}
