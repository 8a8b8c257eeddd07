//! Progress display for region downloads
//!
//! Renders [`DownloadEvent`]s from a download subscription as an indicatif
//! progress bar on a terminal, or as periodic text lines otherwise.
//!
//! # Examples
//!
//! ```rust,no_run
//! use offline_regions::app::{DownloadEvent, ProgressSnapshot};
//! use offline_regions::cli::{ProgressConfig, ProgressDisplay};
//!
//! let mut display = ProgressDisplay::new(ProgressConfig::default());
//! display.start("Oslo-kartverket", 4200);
//! display.update(&DownloadEvent::Progress(ProgressSnapshot::new(120, 4200, 2_211_840, false)));
//! display.finish();
//! ```

use std::io::IsTerminal;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use crate::app::{DownloadEvent, ProgressSnapshot};

/// Configuration for progress display
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Enable visual progress bars
    pub enable_progress_bars: bool,
    /// Minimum time between text-mode reports
    pub report_interval: Duration,
    /// Show downloaded size next to the tile count
    pub show_bytes: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enable_progress_bars: true,
            report_interval: Duration::from_secs(5),
            show_bytes: true,
        }
    }
}

/// How the download session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed(ProgressSnapshot),
    Stopped(Option<ProgressSnapshot>),
    Failed(String),
}

/// Progress display for one region download
pub struct ProgressDisplay {
    config: ProgressConfig,
    bar: Option<ProgressBar>,
    label: String,
    latest: Option<ProgressSnapshot>,
    started: Instant,
    last_report: Option<Instant>,
    is_terminal: bool,
}

impl ProgressDisplay {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            bar: None,
            label: String::new(),
            latest: None,
            started: Instant::now(),
            last_report: None,
            is_terminal: std::io::stderr().is_terminal(),
        }
    }

    /// Start displaying a download of roughly `estimated_tiles` tiles
    ///
    /// The estimate only sizes the bar until the engine reports its total.
    pub fn start(&mut self, label: &str, estimated_tiles: u64) {
        self.label = label.to_string();
        self.started = Instant::now();

        if !self.config.enable_progress_bars || !self.is_terminal {
            eprintln!("Downloading {} (~{} tiles)...", label, estimated_tiles);
            return;
        }

        let bar = ProgressBar::new(estimated_tiles.max(1));
        let template = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tiles ({eta}) {msg}";
        match ProgressStyle::default_bar().template(template) {
            Ok(style) => bar.set_style(style.progress_chars("##-")),
            Err(e) => debug!("Progress bar template error: {}", e),
        }
        bar.set_message(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        self.bar = Some(bar);
    }

    /// Apply a download event
    pub fn update(&mut self, event: &DownloadEvent) {
        match event {
            DownloadEvent::Progress(snapshot) | DownloadEvent::Completed(snapshot) => {
                self.latest = Some(*snapshot);
                self.render(snapshot);
            }
            DownloadEvent::Failed { message } => {
                if let Some(bar) = &self.bar {
                    bar.abandon_with_message(format!("{}: failed", self.label));
                }
                debug!("{}: {}", self.label, message);
            }
        }
    }

    fn render(&mut self, snapshot: &ProgressSnapshot) {
        let message = self.message(snapshot);

        if let Some(bar) = &self.bar {
            if snapshot.total_tiles > 0 {
                bar.set_length(snapshot.total_tiles);
            }
            bar.set_position(snapshot.downloaded_tiles);
            bar.set_message(message);
            return;
        }

        let due = self
            .last_report
            .map_or(true, |last| last.elapsed() >= self.config.report_interval);
        if due || snapshot.is_complete {
            eprintln!("Progress: {:.1}% {}", snapshot.percent(), message);
            self.last_report = Some(Instant::now());
        }
    }

    fn message(&self, snapshot: &ProgressSnapshot) -> String {
        if self.config.show_bytes {
            format!("{} {}", self.label, format_bytes(snapshot.downloaded_bytes))
        } else {
            self.label.clone()
        }
    }

    /// Most recent snapshot seen
    pub fn latest(&self) -> Option<ProgressSnapshot> {
        self.latest
    }

    /// Clear the bar and print a summary of the session
    pub fn finish_with(&mut self, outcome: &SessionOutcome) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }

        let elapsed = self.started.elapsed();
        match outcome {
            SessionOutcome::Completed(snapshot) => {
                eprintln!("✅ {} downloaded in {:.1?}", self.label, elapsed);
                eprintln!("   Tiles: {}", snapshot.downloaded_tiles);
                eprintln!("   Size: {}", format_bytes(snapshot.downloaded_bytes));
            }
            SessionOutcome::Stopped(snapshot) => {
                let percent = snapshot.map(|s| s.percent()).unwrap_or(0.0);
                eprintln!("⏸️  {} stopped at {:.1}%", self.label, percent);
                eprintln!("   Run the same download command again to resume.");
            }
            SessionOutcome::Failed(message) => {
                eprintln!("❌ {} failed: {}", self.label, message);
            }
        }
    }

    /// Clear the bar without a summary
    pub fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl Drop for ProgressDisplay {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

/// Human-readable byte size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> ProgressConfig {
        ProgressConfig {
            enable_progress_bars: false, // Disable for testing
            report_interval: Duration::from_millis(1),
            show_bytes: true,
        }
    }

    #[test]
    fn test_text_mode_tracks_latest_snapshot() {
        let mut display = ProgressDisplay::new(create_test_config());
        display.start("Oslo-kartverket", 100);
        assert!(display.bar.is_none());

        display.update(&DownloadEvent::Progress(ProgressSnapshot::new(10, 46, 10_000, false)));
        display.update(&DownloadEvent::Completed(ProgressSnapshot::new(46, 46, 46_000, true)));

        let latest = display.latest().unwrap();
        assert!(latest.is_complete);
        assert_eq!(latest.downloaded_tiles, 46);

        display.finish_with(&SessionOutcome::Completed(latest));
    }

    #[test]
    fn test_failure_keeps_last_progress() {
        let mut display = ProgressDisplay::new(create_test_config());
        display.start("Bergen-osm", 10);
        display.update(&DownloadEvent::Progress(ProgressSnapshot::new(3, 10, 300, false)));
        display.update(&DownloadEvent::Failed {
            message: "style could not be parsed".to_string(),
        });

        assert_eq!(display.latest().map(|s| s.downloaded_tiles), Some(3));
        display.finish_with(&SessionOutcome::Failed("style could not be parsed".to_string()));
    }

    #[test]
    fn test_progress_config_defaults() {
        let config = ProgressConfig::default();

        assert!(config.enable_progress_bars);
        assert!(config.show_bytes);
        assert!(config.report_interval > Duration::ZERO);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(22_118_400), "21.1 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
