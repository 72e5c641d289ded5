//! Per-iteration reporting.
//!
//! - [`ProgressCallback`]: progress bar with the headline losses
//! - [`MetricsJsonCallback`]: JSONL metrics sink, one object per iteration
//!
//! Callbacks run on rank 0 only.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Reduced scalars of one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StepMetrics {
    /// Iteration index.
    pub iteration: usize,
    /// Discriminator logistic loss.
    pub d: f32,
    /// Generator loss including distillation terms.
    pub g: f32,
    /// Last computed R1 penalty.
    pub r1: f32,
    /// Last computed path-length penalty.
    pub path: f32,
    /// Last mean per-sample path length.
    pub path_length: f32,
    /// Running mean path length on this process.
    pub mean_path_length: f32,
    /// Running mean path length averaged across processes.
    pub mean_path_length_avg: f32,
    /// Mean discriminator logit on real images.
    pub real_score: f32,
    /// Mean discriminator logit on generated images.
    pub fake_score: f32,
    /// Augmentation probability.
    pub ada_aug_p: f32,
    /// Adaptive augmentation sign statistic.
    pub r_t_stat: f32,
    /// Whether R1 ran this iteration.
    pub r1_computed: bool,
    /// Whether path-length regularization ran this iteration.
    pub path_computed: bool,
}

/// Hooks invoked by the training loop.
pub trait TrainingCallback {
    /// Called once before the first iteration.
    fn on_train_start(&mut self, _start_iter: usize) {}

    /// Called after every iteration with the reduced metrics.
    fn on_step_end(&mut self, _metrics: &StepMetrics) {}

    /// Called after a checkpoint is written.
    fn on_save(&mut self, _path: &Path) {}

    /// Called once when the loop finishes.
    fn on_train_end(&mut self) {}
}

/// Progress bar over `[start, iter]`.
pub struct ProgressCallback {
    progress: indicatif::ProgressBar,
}

impl ProgressCallback {
    /// Create a bar for a run ending at iteration `total`.
    pub fn new(total: usize) -> Self {
        let progress = indicatif::ProgressBar::new(total as u64 + 1);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        progress.set_style(style);
        Self { progress }
    }
}

/// One-line summary shown next to the bar.
pub fn progress_message(m: &StepMetrics) -> String {
    format!(
        "d: {:.4}; g: {:.4}; r1: {:.4}; path: {:.4}; mean path: {:.4}; augment: {:.4}",
        m.d, m.g, m.r1, m.path, m.mean_path_length_avg, m.ada_aug_p
    )
}

impl TrainingCallback for ProgressCallback {
    fn on_train_start(&mut self, start_iter: usize) {
        self.progress.set_position(start_iter as u64);
    }

    fn on_step_end(&mut self, metrics: &StepMetrics) {
        self.progress.set_position(metrics.iteration as u64 + 1);
        self.progress.set_message(progress_message(metrics));
    }

    fn on_train_end(&mut self) {
        self.progress.finish_with_message("Done!");
    }
}

/// JSONL metrics sink.
///
/// Write failures disable the sink with a warning instead of aborting the
/// run.
pub struct MetricsJsonCallback {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    config: Option<serde_json::Value>,
}

impl MetricsJsonCallback {
    /// Open (truncating) the sink at `path`.
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            path,
            config: None,
        })
    }

    /// Open the sink, or warn and return `None` if it cannot be created.
    pub fn open_or_warn(path: impl AsRef<Path>) -> Option<Self> {
        match Self::new(path.as_ref()) {
            Ok(sink) => Some(sink),
            Err(e) => {
                tracing::warn!(path = %path.as_ref().display(), error = %e, "metrics sink disabled");
                None
            }
        }
    }

    /// Record the run configuration in the first entry.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Sink location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the sink is still writing.
    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    fn write_entry(&mut self, entry: serde_json::Value, flush: bool) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = writeln!(writer, "{entry}").and_then(|_| if flush { writer.flush() } else { Ok(()) });
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "metrics sink disabled");
            self.writer = None;
        }
    }
}

impl TrainingCallback for MetricsJsonCallback {
    fn on_train_start(&mut self, start_iter: usize) {
        let mut entry = serde_json::json!({
            "event": "train_start",
            "start_iter": start_iter,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(config) = &self.config {
            entry["config"] = config.clone();
        }
        self.write_entry(entry, true);
    }

    fn on_step_end(&mut self, m: &StepMetrics) {
        let entry = serde_json::json!({
            "step": m.iteration,
            "Generator": m.g,
            "Discriminator": m.d,
            "Augment": m.ada_aug_p,
            "Rt": m.r_t_stat,
            "R1": m.r1,
            "Path Length Regularization": m.path,
            "Mean Path Length": m.mean_path_length,
            "Real Score": m.real_score,
            "Fake Score": m.fake_score,
            "Path Length": m.path_length,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.write_entry(entry, m.iteration % 10 == 0);
    }

    fn on_save(&mut self, path: &Path) {
        let entry = serde_json::json!({
            "event": "checkpoint_saved",
            "path": path.display().to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.write_entry(entry, true);
    }

    fn on_train_end(&mut self) {
        let entry = serde_json::json!({
            "event": "train_end",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.write_entry(entry, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_message_format() {
        let m = StepMetrics {
            d: 1.0,
            g: 2.0,
            r1: 0.5,
            mean_path_length_avg: 0.25,
            ..Default::default()
        };
        assert_eq!(
            progress_message(&m),
            "d: 1.0000; g: 2.0000; r1: 0.5000; path: 0.0000; mean path: 0.2500; augment: 0.0000"
        );
    }

    #[test]
    fn test_metrics_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/metrics.jsonl");
        let mut sink = MetricsJsonCallback::new(&path)
            .unwrap()
            .with_config(serde_json::json!({"batch": 2}));
        sink.on_train_start(0);
        for i in 0..3 {
            sink.on_step_end(&StepMetrics {
                iteration: i,
                g: i as f32,
                ..Default::default()
            });
        }
        sink.on_train_end();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0]["config"]["batch"], 2);
        assert_eq!(lines[3]["Generator"], 2.0);
        assert!(lines[2].get("Path Length Regularization").is_some());
    }

    #[test]
    fn test_unopenable_sink_is_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        assert!(MetricsJsonCallback::open_or_warn(blocker.join("metrics.jsonl")).is_none());
    }
}
