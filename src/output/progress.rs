use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::styling::{bright, bright_green, bright_yellow};

/// Spinner for a sequence of named phases on stderr.
pub struct PhaseProgress {
    pb: ProgressBar,
    phase: usize,
    total: usize,
}

impl PhaseProgress {
    pub fn start(total: usize, message: &str) -> Self {
        eprintln!("{}  {}", bright("⚙️"), bright("Phases").underlined());
        Self {
            pb: create_spinner(phase_message(1, total, message)),
            phase: 1,
            total,
        }
    }

    /// Marks the current phase done and starts the next one.
    #[must_use]
    pub fn next(self, done: &str, message: &str) -> Self {
        self.finish_phase(done);
        let phase = self.phase + 1;
        Self {
            pb: create_spinner(phase_message(phase, self.total, message)),
            phase,
            total: self.total,
        }
    }

    pub fn finish(self, done: &str) {
        self.finish_phase(done);
        eprintln!();
    }

    fn finish_phase(&self, done: &str) {
        self.pb.finish_with_message(
            bright_green(format!("Phase {}/{}: {done} ✓", self.phase, self.total)).to_string(),
        );
    }
}

fn phase_message(phase: usize, total: usize, message: &str) -> String {
    bright_yellow(format!("Phase {phase}/{total}: {message}")).to_string()
}

fn create_spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("  {msg} {spinner}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}
