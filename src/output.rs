use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::pipeline::{ModelReport, ProgressEvent, ProgressSink};
use crate::records::ModelRecord;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_reports(reports: &[ModelReport]) -> io::Result<()> {
        Self::print_json(&reports)
    }

    pub fn print_record(record: &ModelRecord) -> io::Result<()> {
        Self::print_json(record)
    }

    pub fn print_records(records: &[ModelRecord]) -> io::Result<()> {
        Self::print_json(&records)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress events to the log.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
