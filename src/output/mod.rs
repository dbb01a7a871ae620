use crate::models::{Session, Stats};
use crate::tracking::Consistency;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

/// Output handler for sessions and statistics
pub struct OutputHandler {
    format: OutputFormat,
    writer: Option<Box<dyn Write + Send>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Jsonl,
    Console,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "jsonl" => OutputFormat::Jsonl,
            "console" => OutputFormat::Console,
            _ => OutputFormat::Jsonl, // Default
        }
    }
}

impl OutputHandler {
    /// Create a new output handler
    pub fn new(format: OutputFormat, file_path: Option<PathBuf>) -> Result<Self, Box<dyn std::error::Error>> {
        let writer: Option<Box<dyn Write + Send>> = match (&format, file_path) {
            (OutputFormat::Console, _) => None,
            (_, Some(path)) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Some(Box::new(BufWriter::new(file)))
            }
            (_, None) => None,
        };

        Ok(OutputHandler { format, writer })
    }

    /// Handler writing into an arbitrary sink
    pub fn with_writer(format: OutputFormat, writer: Box<dyn Write + Send>) -> Self {
        OutputHandler {
            format,
            writer: Some(writer),
        }
    }

    /// Write the state of one session
    pub fn write_session(&mut self, session: &Session) -> Result<(), Box<dyn std::error::Error>> {
        let output = match self.format {
            OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(session)?),
            OutputFormat::Jsonl => format!("{}\n", serde_json::to_string(session)?),
            OutputFormat::Console => format!("{}\n", session_line(session)),
        };
        self.write_output(&output)
    }

    /// Write the aggregate statistics
    pub fn write_stats(&mut self, stats: &Stats) -> Result<(), Box<dyn std::error::Error>> {
        let output = match self.format {
            OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(stats)?),
            OutputFormat::Jsonl => format!("{}\n", serde_json::to_string(stats)?),
            OutputFormat::Console => stats_report(stats),
        };
        self.write_output(&output)
    }

    /// Write the result of a consistency check
    pub fn write_consistency(&mut self, report: &Consistency) -> Result<(), Box<dyn std::error::Error>> {
        let output = match self.format {
            OutputFormat::Json | OutputFormat::Jsonl => {
                let mismatched: Vec<_> = report
                    .mismatched
                    .iter()
                    .map(|(user, origin, expected, recorded)| {
                        serde_json::json!({
                            "user": user,
                            "origin": origin,
                            "expected": expected,
                            "recorded": recorded,
                        })
                    })
                    .collect();
                let value = serde_json::json!({
                    "consistent": report.is_consistent(),
                    "sessions": report.sessions,
                    "expected_active": report.expected_active,
                    "recorded_active": report.recorded_active,
                    "mismatched": mismatched,
                });
                if self.format == OutputFormat::Json {
                    format!("{}\n", serde_json::to_string_pretty(&value)?)
                } else {
                    format!("{}\n", value)
                }
            }
            OutputFormat::Console => consistency_report(report),
        };
        self.write_output(&output)
    }

    fn write_output(&mut self, data: &str) -> Result<(), Box<dyn std::error::Error>> {
        match &mut self.writer {
            Some(writer) => {
                writer.write_all(data.as_bytes())?;
                writer.flush()?;
            }
            None => {
                print!("{}", data);
                io::stdout().flush()?;
            }
        }
        Ok(())
    }

    /// Flush any buffered output
    pub fn flush(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

fn origin_label(origin: &str) -> &str {
    if origin.is_empty() {
        "-"
    } else {
        origin
    }
}

fn session_line(session: &Session) -> String {
    let status = session
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "none".to_string());
    let methods = session
        .auth_methods
        .iter()
        .map(|(method, n)| format!("{}={}", method, n))
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "[{}] {}@{} - active: {}, total: {}, fails: {}, methods: [{}]",
        status,
        session.username,
        origin_label(&session.remote_origin),
        session.active_count,
        session.total_count,
        session.fail_count,
        methods
    )
}

fn stats_report(stats: &Stats) -> String {
    let mut out = format!(
        "Stats since {}\n  active sessions: {}\n  total sessions:  {}\n  failed attempts: {}\n",
        stats.stats_started.to_rfc3339(),
        stats.active_sessions.count,
        stats.total_sessions.count,
        stats.fail_list.count
    );
    if let Some(last) = stats.last_login {
        out.push_str(&format!("  last login:      {}\n", last.to_rfc3339()));
    }

    for (origin, users) in &stats.active_sessions.by_origin {
        for (user, n) in users.iter().filter(|(_, n)| **n > 0) {
            out.push_str(&format!("  active {}@{}: {}\n", user, origin_label(origin), n));
        }
    }
    out
}

fn consistency_report(report: &Consistency) -> String {
    let mut out = format!(
        "{} sessions, active expected {} / recorded {}: {}\n",
        report.sessions,
        report.expected_active,
        report.recorded_active,
        if report.is_consistent() { "consistent" } else { "INCONSISTENT" }
    );
    for (user, origin, expected, recorded) in &report.mismatched {
        out.push_str(&format!(
            "  {}@{}: expected {}, recorded {}\n",
            user,
            origin_label(origin),
            expected,
            recorded
        ));
    }
    out
}
