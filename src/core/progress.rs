//! Terminal progress feedback for downloads and registration waits

use std::io::Write;
use std::time::{Duration, Instant};

const BRAILLE_FRAMES: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
const BAR_WIDTH: usize = 30;
const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

/// Check if progress should be drawn on stderr
pub fn should_show_progress() -> bool {
    std::io::IsTerminal::is_terminal(&std::io::stderr()) && !log::log_enabled!(log::Level::Info)
}

/// Single-line spinner with a label
pub struct ProgressSpinner {
    frame_index: usize,
    label: String,
    visible: bool,
}

impl ProgressSpinner {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            frame_index: 0,
            label: label.into(),
            visible: should_show_progress(),
        }
    }

    pub fn tick(&mut self) {
        if !self.visible {
            return;
        }
        let frame = BRAILLE_FRAMES[self.frame_index];
        self.frame_index = (self.frame_index + 1) % BRAILLE_FRAMES.len();
        eprint!("\r{frame} {}", self.label);
        let _ = std::io::stderr().flush();
    }

    pub fn finish(&self) {
        if self.visible {
            eprint!("\r\x1b[2K");
            let _ = std::io::stderr().flush();
        }
    }
}

/// Drive `future` to completion while a spinner ticks on stderr
pub async fn spin_while<F: std::future::Future>(label: &str, future: F) -> F::Output {
    let mut spinner = ProgressSpinner::new(label);
    let mut ticker = tokio::time::interval(REDRAW_INTERVAL);
    tokio::pin!(future);
    let output = loop {
        tokio::select! {
            output = &mut future => break output,
            _ = ticker.tick() => spinner.tick(),
        }
    };
    spinner.finish();
    output
}

/// Byte counter for a streamed download
///
/// Draws a bar when stderr is a terminal; otherwise only counts.
pub struct DownloadProgress {
    label: String,
    total: Option<u64>,
    done: u64,
    visible: bool,
    last_draw: Option<Instant>,
}

impl DownloadProgress {
    pub fn new(label: impl Into<String>, total: Option<u64>) -> Self {
        Self {
            label: label.into(),
            total: total.filter(|t| *t > 0),
            done: 0,
            visible: should_show_progress(),
            last_draw: None,
        }
    }

    /// Counting-only progress, never drawn
    pub fn hidden(total: Option<u64>) -> Self {
        Self {
            visible: false,
            ..Self::new(String::new(), total)
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.done += bytes;
        if !self.visible {
            return;
        }
        let due = self
            .last_draw
            .map_or(true, |at| at.elapsed() >= REDRAW_INTERVAL);
        if due {
            self.draw();
            self.last_draw = Some(Instant::now());
        }
    }

    pub fn bytes(&self) -> u64 {
        self.done
    }

    pub fn finish(&mut self) {
        if self.visible {
            self.draw();
            eprintln!();
        }
    }

    fn draw(&self) {
        let line = match self.total {
            Some(total) => {
                let ratio = (self.done as f64 / total as f64).min(1.0);
                let filled = (ratio * BAR_WIDTH as f64) as usize;
                format!(
                    "{} [{}{}] {:>3}% ({}/{})",
                    self.label,
                    "=".repeat(filled),
                    " ".repeat(BAR_WIDTH - filled),
                    (ratio * 100.0) as u32,
                    human_bytes(self.done),
                    human_bytes(total)
                )
            }
            None => format!("{} {}", self.label, human_bytes(self.done)),
        };
        eprint!("\r{line}");
        let _ = std::io::stderr().flush();
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
