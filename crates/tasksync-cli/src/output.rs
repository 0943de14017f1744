//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use tasksync_core::storage::PendingOperation;
use tasksync_core::SyncReport;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to encode output: {}", e),
        }
    }

    /// Print the pending-operation ledger
    pub fn print_operations(&self, ops: &[PendingOperation]) {
        match self.format {
            OutputFormat::Human => {
                if ops.is_empty() {
                    println!("No pending operations.");
                    return;
                }
                for op in ops {
                    println!(
                        "{:>6} | {:<10} | {:<6} {:<24} | {:<8} | {}",
                        op.id,
                        op.status.as_str(),
                        op.operation_type.as_str(),
                        op.entity_type.as_str(),
                        truncate(&op.entity_id, 8),
                        describe_attempts(op)
                    );
                }
                println!("\n{} operation(s)", ops.len());
            }
            OutputFormat::Json => self.json(ops),
            OutputFormat::Quiet => {
                for op in ops {
                    println!("{}", op.id);
                }
            }
        }
    }

    /// Print what a sync run did
    pub fn print_report(&self, report: &SyncReport) {
        match self.format {
            OutputFormat::Human => {
                println!("Pushed:     {}", report.pushed);
                if report.remapped > 0 {
                    println!("Remapped:   {}", report.remapped);
                }
                if report.discarded > 0 {
                    println!("Discarded:  {}", report.discarded);
                }
                if report.retried > 0 {
                    println!("Retrying:   {}", report.retried);
                }
                if report.failed > 0 {
                    println!("Failed:     {}", report.failed);
                }
                println!("Pulled:     {}", report.pulled);
                if let Some(ref error) = report.pull_error {
                    println!("Pull error: {}", error);
                }
            }
            OutputFormat::Json => self.json(report),
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr (all formats except quiet)
    pub fn warn(&self, message: &str) {
        if self.format != OutputFormat::Quiet {
            eprintln!("! {}", message);
        }
    }

    /// Print a failed command's error chain and an optional hint to stderr
    pub fn error(&self, error: &anyhow::Error, hint: Option<&str>) {
        match self.format {
            OutputFormat::Json => {
                eprintln!(
                    "{}",
                    serde_json::json!({"status": "error", "message": format!("{:#}", error), "hint": hint})
                );
            }
            OutputFormat::Human | OutputFormat::Quiet => {
                eprintln!("Error: {:#}", error);
                if let Some(hint) = hint {
                    eprintln!("Hint: {}", hint);
                }
            }
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn describe_attempts(op: &PendingOperation) -> String {
    let mut parts = Vec::new();
    if op.attempts > 0 {
        parts.push(format!("{} attempt(s)", op.attempts));
    }
    if let Some(at) = op.next_attempt_at {
        parts.push(format!("next {}", at.format("%Y-%m-%d %H:%M:%S")));
    }
    if let Some(ref error) = op.last_error {
        parts.push(truncate(error, 50));
    }
    parts.join(", ")
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
