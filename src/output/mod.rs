use crate::models::SuspiciousEntry;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Output handler for newly flagged suspicious entries
pub struct OutputHandler {
    format: OutputFormat,
    writer: Option<Box<dyn Write + Send>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Jsonl,
    Console,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "jsonl" => OutputFormat::Jsonl,
            "console" => OutputFormat::Console,
            _ => OutputFormat::Jsonl, // Default
        }
    }
}

impl OutputHandler {
    /// Create a new output handler. Without a file, output goes to stdout.
    pub fn new(format: OutputFormat, file_path: Option<PathBuf>) -> Result<Self, OutputError> {
        let writer: Option<Box<dyn Write + Send>> = match (&format, file_path) {
            (OutputFormat::Console, _) => None,
            (_, Some(path)) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Box::new(BufWriter::new(file)))
            }
            (_, None) => None,
        };

        Ok(OutputHandler { format, writer })
    }

    /// Write the entries flagged by one detection run
    ///
    /// `Json` emits the batch as one pretty-printed array, so a file holds a
    /// stream of concatenated JSON documents, one per run. `Jsonl` and
    /// `Console` write one line per entry. An empty batch writes nothing.
    pub fn write_entries(&mut self, entries: &[SuspiciousEntry]) -> Result<(), OutputError> {
        if entries.is_empty() {
            return Ok(());
        }

        let data = match &self.format {
            OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(entries)?),
            OutputFormat::Jsonl => {
                let mut data = String::new();
                for entry in entries {
                    data.push_str(&serde_json::to_string(entry)?);
                    data.push('\n');
                }
                data
            }
            OutputFormat::Console => entries.iter().map(console_line).collect(),
        };
        self.write_output(&data)
    }

    fn write_output(&mut self, data: &str) -> Result<(), OutputError> {
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
    pub fn flush(&mut self) -> Result<(), OutputError> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

fn console_line(entry: &SuspiciousEntry) -> String {
    let flagged_at = chrono::DateTime::from_timestamp(entry.flagged_at, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| entry.flagged_at.to_string());
    format!(
        "[{}] #{} {} - {}{}\n",
        flagged_at,
        entry.id,
        entry.address,
        entry.reason,
        if entry.resolved { " (resolved)" } else { "" }
    )
}
