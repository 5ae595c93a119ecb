//! Turning getname probe records into `PID FILE` lines.

use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::SnoopError;
use crate::tracefs::format::FormatField;
use crate::tracefs::iterate::{EventRecord, Flow, RawReader};
use crate::tracefs::Instance;

pub const PID_HEADER: &str = "PID";
pub const FILE_HEADER: &str = "FILE";

/// Column titles, laid out like the lines under them.
pub fn header_line(pid_width: usize) -> String {
    format!("{PID_HEADER:>pid_width$} {FILE_HEADER}")
}

/// Writes one output line. The filename goes out as the kernel recorded
/// it, whatever its encoding.
pub fn write_line<W: Write>(
    out: &mut W,
    pid: u64,
    filename: &[u8],
    pid_width: usize,
) -> io::Result<()> {
    write!(out, "{pid:>pid_width$} ")?;
    out.write_all(filename)?;
    out.write_all(b"\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenEvent {
    pub pid: u64,
    pub filename: Vec<u8>,
}

/// Decodes the pid and filename of probe records. Field lookups are done on
/// the first record and remembered.
#[derive(Debug)]
pub struct OpenDecoder {
    pid_field: String,
    filename_field: String,
    fields: HashMap<String, FormatField>,
}

impl OpenDecoder {
    pub fn new(pid_field: &str, filename_field: &str) -> Self {
        OpenDecoder {
            pid_field: pid_field.to_string(),
            filename_field: filename_field.to_string(),
            fields: HashMap::new(),
        }
    }

    pub fn decode(&mut self, record: &EventRecord<'_>) -> Result<OpenEvent, SnoopError> {
        let field = lookup(&mut self.fields, record, &self.filename_field, false)?;
        let filename = field.read_str(record.data).map_err(|err| {
            SnoopError::record_decode("Fetch Filename", format!("invalid filename received: {err}"))
        })?;
        let filename = filename.to_vec();

        let field = lookup(&mut self.fields, record, &self.pid_field, true)?;
        let pid = field
            .read_u64(record.data)
            .map_err(|err| SnoopError::record_decode("Fetch PID", err))?;

        Ok(OpenEvent { pid, filename })
    }
}

fn lookup<'s>(
    fields: &'s mut HashMap<String, FormatField>,
    record: &EventRecord<'_>,
    name: &str,
    common: bool,
) -> Result<&'s FormatField, SnoopError> {
    if !fields.contains_key(name) {
        let found = if common {
            record.format.find_common_field(name)
        } else {
            record.format.find_any_field(name)
        };
        let field = found.cloned().ok_or_else(|| {
            SnoopError::record_decode(
                "Validate kprobe",
                format!(
                    "field {name} does not exist for {} kprobe event",
                    record.format.name
                ),
            )
        })?;
        debug!("resolved field {name} at offset {}", field.offset);
        fields.insert(name.to_string(), field);
    }
    Ok(&fields[name])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub passes: usize,
    pub records: usize,
    pub lines: usize,
    pub decode_failures: usize,
}

/// Streams decoded records to `out`, diagnostics to `err`.
pub struct Capture<W: Write, E: Write> {
    decoder: OpenDecoder,
    out: W,
    err: E,
    pid_width: usize,
    state: CaptureState,
    stats: CaptureStats,
    write_error: Option<io::Error>,
}

impl<W: Write, E: Write> Capture<W, E> {
    pub fn new(decoder: OpenDecoder, pid_width: usize, out: W, err: E) -> Self {
        Capture {
            decoder,
            out,
            err,
            pid_width,
            state: CaptureState::Idle,
            stats: CaptureStats::default(),
            write_error: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn into_writers(self) -> (W, E) {
        (self.out, self.err)
    }

    pub fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.out, "{}", header_line(self.pid_width))?;
        self.out.flush()
    }

    /// Prints one record. A record that does not decode is reported and
    /// skipped; only a failing output stops the capture.
    pub fn handle(&mut self, record: &EventRecord<'_>) -> Flow {
        self.stats.records += 1;
        match self.decoder.decode(record) {
            Ok(event) => {
                if let Err(err) =
                    write_line(&mut self.out, event.pid, &event.filename, self.pid_width)
                {
                    self.write_error = Some(err);
                    return Flow::Stop;
                }
                self.stats.lines += 1;
            }
            Err(err) => {
                self.stats.decode_failures += 1;
                debug!("cpu{} ts {}: {err}", record.cpu, record.ts);
                // Nowhere left to report to if stderr is gone.
                let _ = writeln!(self.err, "error: {err}");
            }
        }
        Flow::Continue
    }

    /// Polls the instance until `token` is set, sleeping `interval` whenever
    /// a poll finds the buffers empty.
    pub fn run(
        &mut self,
        reader: &mut RawReader,
        instance: &Instance,
        token: &CancelToken,
        interval: Duration,
    ) -> io::Result<CaptureStats> {
        self.state = CaptureState::Running;
        let res = self.poll(reader, instance, token, interval);
        self.state = CaptureState::Stopping;
        let flushed = self.out.flush();
        self.state = CaptureState::Idle;
        info!(
            "capture stopped after {} passes: {} records, {} lines, {} decode failures",
            self.stats.passes, self.stats.records, self.stats.lines, self.stats.decode_failures
        );
        res?;
        flushed?;
        Ok(self.stats)
    }

    fn poll(
        &mut self,
        reader: &mut RawReader,
        instance: &Instance,
        token: &CancelToken,
        interval: Duration,
    ) -> io::Result<()> {
        while !token.is_set() {
            let pass = reader.iterate(instance, |record| {
                if token.is_set() {
                    return Flow::Stop;
                }
                self.handle(record)
            })?;
            self.stats.passes += 1;
            if let Some(err) = self.write_error.take() {
                return Err(err);
            }
            if pass.stopped || token.is_set() {
                break;
            }
            self.out.flush()?;
            if pass.pages == 0 {
                token.sleep(interval);
            }
        }
        Ok(())
    }
}
