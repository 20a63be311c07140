//! Training progress reporting.
//!
//! Reports observable progress during `kbe train` so users see how many
//! documents are left and which ones failed. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use kb_engine_core::models::{DocumentStatus, TrainingReport};

/// A single progress event of a training run.
#[derive(Clone, Debug)]
pub enum TrainingEvent {
    /// Documents selected for this run. `skipped` were already ready.
    Started {
        kb_id: String,
        total: u64,
        skipped: u64,
    },
    /// One document reached the end of its attempt.
    Document {
        kb_id: String,
        name: String,
        status: DocumentStatus,
        reason: Option<String>,
        n: u64,
        total: u64,
    },
    Finished { report: TrainingReport },
}

/// Reports training progress. Implementations write to stderr (human or JSON).
pub trait TrainingProgressReporter: Send + Sync {
    /// Emit a progress event. Called from training workers.
    fn report(&self, event: TrainingEvent);
}

/// Human-friendly progress on stderr: "train kb  3 / 10 documents  guide.md ready".
pub struct StderrProgress;

impl TrainingProgressReporter for StderrProgress {
    fn report(&self, event: TrainingEvent) {
        let line = match &event {
            TrainingEvent::Started {
                kb_id,
                total,
                skipped,
            } => format!(
                "train {}  {} documents to process, {} already ready\n",
                kb_id,
                format_number(*total),
                format_number(*skipped)
            ),
            TrainingEvent::Document {
                kb_id,
                name,
                status,
                reason,
                n,
                total,
            } => match reason {
                Some(reason) => format!(
                    "train {}  {} / {} documents  {} {} ({})\n",
                    kb_id,
                    format_number(*n),
                    format_number(*total),
                    name,
                    status,
                    reason
                ),
                None => format!(
                    "train {}  {} / {} documents  {} {}\n",
                    kb_id,
                    format_number(*n),
                    format_number(*total),
                    name,
                    status
                ),
            },
            TrainingEvent::Finished { report } => {
                let mut line = format!(
                    "train {}  done: {} ready, {} failed, {} skipped",
                    report.kb_id, report.ready, report.failed, report.skipped
                );
                if report.cancelled {
                    line.push_str(" (cancelled, run again to resume)");
                }
                line.push('\n');
                for w in &report.warnings {
                    line.push_str(&format!("warning: {}\n", w));
                }
                line
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl TrainingProgressReporter for JsonProgress {
    fn report(&self, event: TrainingEvent) {
        let obj = match &event {
            TrainingEvent::Started {
                kb_id,
                total,
                skipped,
            } => serde_json::json!({
                "event": "started",
                "kb_id": kb_id,
                "total": total,
                "skipped": skipped
            }),
            TrainingEvent::Document {
                kb_id,
                name,
                status,
                reason,
                n,
                total,
            } => serde_json::json!({
                "event": "document",
                "kb_id": kb_id,
                "name": name,
                "status": status,
                "reason": reason,
                "n": n,
                "total": total
            }),
            TrainingEvent::Finished { report } => serde_json::json!({
                "event": "finished",
                "report": report
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl TrainingProgressReporter for NoProgress {
    fn report(&self, _event: TrainingEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse `auto|off|human|json`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::default_for_tty()),
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn TrainingProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_modes_parse() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("loud"), None);
    }
}
