// trace.rs - Trace subcommands: verify, tail.

use std::path::PathBuf;

use anyhow::Context;
use clap::Subcommand;
use gk_trace::{JsonlSink, TraceError, TraceEvent, TraceEventKind};
use uuid::Uuid;

#[derive(Subcommand)]
pub enum TraceCommands {
    /// Verify the trace file's hash chain.
    Verify {
        /// Path to the JSONL trace file.
        file: PathBuf,
    },
    /// Show the most recent trace events.
    Tail {
        /// Path to the JSONL trace file.
        file: PathBuf,
        /// Number of events to show.
        #[arg(short, default_value = "20")]
        n: usize,
        /// Only show events for this action id.
        #[arg(long)]
        action: Option<Uuid>,
    },
}

pub fn execute(cmd: &TraceCommands) -> anyhow::Result<()> {
    match cmd {
        TraceCommands::Verify { file } => match JsonlSink::verify_chain(file) {
            Ok(count) => {
                println!("Trace verified: {} event(s), hash chain intact.", count);
            }
            Err(TraceError::IntegrityViolation {
                line,
                expected,
                actual,
            }) => {
                println!("INTEGRITY VIOLATION at line {}:", line);
                println!("  Expected previous_hash: {}", expected);
                println!("  Actual previous_hash:   {}", actual);
                anyhow::bail!("trace integrity check failed");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", file.display()))
            }
        },

        TraceCommands::Tail { file, n, action } => {
            let events = JsonlSink::read_all(file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let recent = select(events, *n, *action);
            if recent.is_empty() {
                println!("No trace events.");
                return Ok(());
            }
            println!(
                "{:<20} {:<36} {:>4} {:<20} DETAIL",
                "TIMESTAMP", "ACTION", "SEQ", "EVENT"
            );
            println!("{}", "-".repeat(100));
            for event in &recent {
                println!(
                    "{:<20} {:<36} {:>4} {:<20} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.action_id,
                    event.sequence,
                    event.event_type(),
                    detail(&event.kind)
                );
            }
        }
    }

    Ok(())
}

/// The last `n` events, optionally restricted to one action.
fn select(events: Vec<TraceEvent>, n: usize, action: Option<Uuid>) -> Vec<TraceEvent> {
    let mut matching: Vec<TraceEvent> = events
        .into_iter()
        .filter(|e| action.map_or(true, |id| e.action_id == id))
        .collect();
    let start = matching.len().saturating_sub(n);
    matching.split_off(start)
}

fn detail(kind: &TraceEventKind) -> String {
    match kind {
        TraceEventKind::DecisionRecorded {
            effect,
            matched_rule_id,
            policy_version,
            ..
        } => format!(
            "{} by {} (v{})",
            effect,
            matched_rule_id.as_deref().unwrap_or("default"),
            policy_version
        ),
        TraceEventKind::ApprovalRequested {
            request_id,
            expires_at,
        } => format!("request {} expires {}", request_id, expires_at.format("%H:%M:%S")),
        TraceEventKind::ApprovalResolved {
            request_id,
            status,
            cancelled,
        } => {
            let suffix = if *cancelled { " (cancelled)" } else { "" };
            format!("request {} {:?}{}", request_id, status, suffix)
        }
        TraceEventKind::ExecutionAttempted { attempt } => format!("attempt {}", attempt),
        TraceEventKind::ExecutionCompleted {
            attempt,
            status,
            duration_ms,
            error_detail,
        } => match error_detail {
            Some(err) => format!("{} on attempt {}, {} ms: {}", status, attempt, duration_ms, err),
            None => format!("{} on attempt {}, {} ms", status, attempt, duration_ms),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gk_trace::{ExecutionStatus, TraceRecorder};

    fn write_trace(path: &std::path::Path) -> (Uuid, Uuid) {
        let recorder = TraceRecorder::with_sink(JsonlSink::open(path).unwrap());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        recorder
            .append(a, TraceEventKind::ExecutionAttempted { attempt: 1 })
            .unwrap();
        recorder
            .append(b, TraceEventKind::ExecutionAttempted { attempt: 1 })
            .unwrap();
        recorder
            .append(
                a,
                TraceEventKind::ExecutionCompleted {
                    attempt: 1,
                    status: ExecutionStatus::Success,
                    duration_ms: 4,
                    error_detail: None,
                },
            )
            .unwrap();
        (a, b)
    }

    #[test]
    fn tail_filters_by_action_and_keeps_the_last_n() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let (a, _) = write_trace(&path);
        let events = JsonlSink::read_all(&path).unwrap();

        let only_a = select(events.clone(), 10, Some(a));
        assert_eq!(only_a.len(), 2);
        assert!(only_a.iter().all(|e| e.action_id == a));

        let last = select(events, 1, None);
        assert_eq!(last.len(), 1);
        assert_eq!(detail(&last[0].kind), "success on attempt 1, 4 ms");
    }

    #[test]
    fn verify_fails_on_an_edited_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        write_trace(&path);
        assert!(execute(&TraceCommands::Verify { file: path.clone() }).is_ok());

        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replacen("\"attempt\":1", "\"attempt\":2", 1);
        assert_ne!(content, tampered);
        std::fs::write(&path, tampered).unwrap();
        assert!(execute(&TraceCommands::Verify { file: path }).is_err());
    }
}
