//! Output record format and the sinks records are appended to.
//!
//! A run produces a short header of `#` comment lines followed by one tab
//! separated line per sample:
//!
//! ```text
//! # Opened vacuum-2024-03-01-12-00-00.csv for output
//! # Format Version: 3.0
//! # Columns: DateTime [localtime];Elapsed [s];Pirani; High Range Capacitance Manometer; Low Range Capacitance Manometer
//! # Gauge Units: TORR Torr
//! 2024-03-01-12-00-09	9	1.00e-05	1.00e-01	1.00e-02
//! ```

use crate::capacitance::CapacitanceReading;
use chrono::{DateTime, Local};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
pub const FORMAT_VERSION_LINE: &str = "# Format Version: 3.0\n";
pub const COLUMNS_LINE: &str = "# Columns: DateTime [localtime];Elapsed [s];Pirani; High Range Capacitance Manometer; Low Range Capacitance Manometer\n";
pub const TEST_MODE_BANNER: &str = "RUNNING IN TEST MODE -- NO REAL DATA FOLLOWS\n";

pub fn opened_line(file_name: &str) -> String {
    format!("# Opened {} for output\n", file_name)
}

pub fn units_line(pirani_units: &str, capacitance_units: &str) -> String {
    format!("# Gauge Units: {} {}\n", pirani_units, capacitance_units)
}

pub fn format_timestamp(time: &DateTime<Local>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// Scientific notation with two decimals and an at least two digit, signed exponent (`1.00e-05`).
pub fn format_scientific(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let formatted = format!("{:.2e}", value);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => formatted,
    }
}

/// One poll cycle's worth of readings.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Local>,
    pub elapsed_seconds: i64,
    pub pirani: f64,
    pub capacitance: CapacitanceReading,
}

impl Sample {
    pub fn to_record_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\n",
            format_timestamp(&self.timestamp),
            self.elapsed_seconds,
            format_scientific(self.pirani),
            format_scientific(self.capacitance.high_range),
            format_scientific(self.capacitance.low_range),
        )
    }
}

/// Destination for output records.
pub trait RecordSink {
    /// Name shown in the `# Opened` header line.
    fn name(&self) -> &str;

    /// Append one newline terminated record; it is durable once this returns.
    fn append(&mut self, line: &str) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

pub type BoxedSink = Box<dyn RecordSink + Send>;

/// Writes every record to a file and echoes it to stdout.
#[derive(Debug)]
pub struct TeeSink {
    name: String,
    path: PathBuf,
    file: Option<File>,
    echo: bool,
}

impl TeeSink {
    /// Create `vacuum-<timestamp>.csv` inside `dir`.
    pub fn create_in(dir: &Path, now: &DateTime<Local>) -> io::Result<Self> {
        let name = format!("vacuum-{}.csv", format_timestamp(now));
        let path = dir.join(&name);
        log::debug!("Opening output file {}", path.display());
        let file = File::create(&path)?;

        Ok(Self {
            name,
            path,
            file: Some(file),
            echo: true,
        })
    }

    /// Stop echoing records to stdout.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for TeeSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn append(&mut self, line: &str) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "output file is closed"))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        if self.echo {
            let mut stdout = io::stdout().lock();
            stdout.write_all(line.as_bytes())?;
            stdout.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Keeps records in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn append(&mut self, line: &str) -> io::Result<()> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
        Ok(())
    }
}
