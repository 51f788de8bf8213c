use std::fmt::Display;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::warn;

/// Progress and error signals emitted while a run is in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The walker found a regular file
    Discovered,
    /// A hash worker finished an entry; `cached` when the digest was reused
    Hashed { cached: bool },
    /// Paranoid verification finished comparing one pair
    Compared,
    /// A file was left out of the run
    Skipped { path: PathBuf, message: String },
}

/// Cheap, cloneable handle for emitting [`PipelineEvent`]s.
///
/// Without a listener every signal is dropped, except that skipped files are
/// always logged.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    sender: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl Reporter {
    pub fn new(sender: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    fn send(&self, event: PipelineEvent) {
        if let Some(sender) = &self.sender {
            // The listener going away is not our problem
            let _ = sender.send(event);
        }
    }

    pub fn discovered(&self) {
        self.send(PipelineEvent::Discovered);
    }

    pub fn hashed(&self, cached: bool) {
        self.send(PipelineEvent::Hashed { cached });
    }

    pub fn compared(&self) {
        self.send(PipelineEvent::Compared);
    }

    pub fn skipped(&self, path: &Path, error: impl Display) {
        let message = error.to_string();
        warn!(path = %path.display(), "skipping file: {}", message);
        self.send(PipelineEvent::Skipped {
            path: path.to_path_buf(),
            message,
        });
    }
}

/// Running totals folded from the event stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressTotals {
    pub discovered: u64,
    pub hashed: u64,
    pub cache_hits: u64,
    pub compared: u64,
    pub skipped: u64,
}

impl ProgressTotals {
    pub fn apply(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Discovered => self.discovered += 1,
            PipelineEvent::Hashed { cached } => {
                self.hashed += 1;
                if *cached {
                    self.cache_hits += 1;
                }
            }
            PipelineEvent::Compared => self.compared += 1,
            PipelineEvent::Skipped { .. } => self.skipped += 1,
        }
    }
}
