//! Import progress reporting.
//!
//! Renders [`ImportEvent`]s from the orchestrator so users see each record's
//! fate as it happens and a tally at the end. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use scoreport_core::progress::{
    ImportEvent, ImportProgressReporter, NoProgress, RecordOutcome, RunState,
};

/// Human-friendly progress on stderr: "import  #1,234  committed  R3f…".
pub struct StderrProgress;

impl ImportProgressReporter for StderrProgress {
    fn report(&self, event: ImportEvent) {
        let line = match &event {
            ImportEvent::StateChanged(state) => format!("import  {}\n", state_label(state)),
            ImportEvent::Record { index, outcome } => {
                format!(
                    "import  #{}  {}  {}\n",
                    format_number(*index as u64),
                    outcome.label(),
                    outcome_detail(outcome)
                )
            }
            ImportEvent::Finished(summary) => format!(
                "import  finished  {} attempted, {} committed, {} orphaned\n",
                format_number(summary.attempted),
                format_number(summary.committed),
                format_number(summary.orphaned)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ImportProgressReporter for JsonProgress {
    fn report(&self, event: ImportEvent) {
        let obj = match &event {
            ImportEvent::StateChanged(state) => serde_json::json!({
                "event": "state",
                "state": state,
            }),
            ImportEvent::Record { index, outcome } => serde_json::json!({
                "event": "record",
                "index": index,
                "result": outcome,
            }),
            ImportEvent::Finished(summary) => serde_json::json!({
                "event": "finished",
                "status": summary.status,
                "attempted": summary.attempted,
                "committed": summary.committed,
                "duplicates": summary.duplicates,
                "blacklisted": summary.blacklisted,
                "skipped_invalid": summary.skipped_invalid,
                "orphaned": summary.orphaned,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

fn state_label(state: &RunState) -> String {
    match state {
        RunState::Idle => "idle".to_string(),
        RunState::LockAcquired => "lock acquired".to_string(),
        RunState::Iterating => "iterating".to_string(),
        RunState::Summarizing => "summarizing".to_string(),
        RunState::LockReleased(status) => format!("lock released ({})", status.as_str()),
    }
}

fn outcome_detail(outcome: &RecordOutcome) -> &str {
    match outcome {
        RecordOutcome::Committed { score_id }
        | RecordOutcome::Duplicate { score_id }
        | RecordOutcome::Blacklisted { score_id } => score_id,
        RecordOutcome::SkippedInvalid { message } | RecordOutcome::SkippedInternal { message } => {
            message
        }
        RecordOutcome::Orphaned { orphan_id, .. } => orphan_id,
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
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

    pub fn reporter(&self) -> Box<dyn ImportProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoreport_core::progress::RunStatus;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn state_labels() {
        assert_eq!(state_label(&RunState::Iterating), "iterating");
        assert_eq!(
            state_label(&RunState::LockReleased(RunStatus::Failed)),
            "lock released (failed)"
        );
    }

    #[test]
    fn outcome_detail_names_the_record() {
        let outcome = RecordOutcome::Orphaned {
            orphan_id: "Oabc".to_string(),
            new: true,
        };
        assert_eq!(outcome_detail(&outcome), "Oabc");
    }
}
