//! Draining the raw per-CPU buffers of an instance.
//!
//! Each `per_cpu/cpuN/trace_pipe_raw` is opened non-blocking and read one
//! page at a time until the kernel has nothing more. The entries of a pass
//! are merged across CPUs by timestamp before they are handed out, so the
//! callback sees events in the order they happened.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use tracing::{debug, warn};

use super::format::{EventFormat, FormatField};
use super::instance::Instance;
use crate::ringbuf::PageLayout;

// Bounds how much one pass buffers before handing records out.
const MAX_PAGES_PER_CPU: usize = 256;

/// One buffered event, valid only while the callback runs.
#[derive(Debug, Clone, Copy)]
pub struct EventRecord<'a> {
    pub format: &'a EventFormat,
    pub data: &'a [u8],
    pub cpu: usize,
    pub ts: u64,
}

/// What the callback wants the iteration to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub pages: usize,
    /// Records of a followed event handed to the callback.
    pub records: usize,
    /// Records of events nobody follows.
    pub ignored: usize,
    /// Pages on which the kernel reported dropped events.
    pub missed: usize,
    /// The pass ended early because of a stop request.
    pub stopped: bool,
}

struct CpuBuffer {
    cpu: usize,
    file: File,
}

pub struct RawReader {
    layout: PageLayout,
    cpus: Vec<CpuBuffer>,
    follow: HashMap<u16, EventFormat>,
    type_field: FormatField,
}

impl RawReader {
    /// Opens every CPU buffer of `instance`. Only records of the events in
    /// `follow` reach the callback.
    pub fn open(instance: &Instance, follow: Vec<EventFormat>) -> io::Result<Self> {
        let type_field = follow
            .iter()
            .find_map(|format| format.find_common_field("common_type"))
            .cloned()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no followed event format has a common_type field",
                )
            })?;

        let mut cpus = Vec::new();
        for (cpu, dir) in instance.cpu_dirs()? {
            let file = OpenOptions::new()
                .read(true)
                .custom_flags(OFlag::O_NONBLOCK.bits())
                .open(dir.join("trace_pipe_raw"))?;
            cpus.push(CpuBuffer { cpu, file });
        }
        if cpus.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("instance {} has no per_cpu buffers", instance.name()),
            ));
        }
        debug!("reading {} cpu buffers of {}", cpus.len(), instance.name());

        Ok(RawReader {
            layout: PageLayout::load(instance.tracefs()),
            cpus,
            follow: follow.into_iter().map(|format| (format.id, format)).collect(),
            type_field,
        })
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Drains whatever is currently buffered and feeds followed records to
    /// `callback` in timestamp order.
    ///
    /// Returns early, without further callbacks, once the instance's
    /// [`StopHandle`](super::StopHandle) fires or the callback asks to stop.
    pub fn iterate<F>(&mut self, instance: &Instance, mut callback: F) -> io::Result<PassStats>
    where
        F: FnMut(&EventRecord<'_>) -> Flow,
    {
        instance.begin_iteration();
        let mut stats = PassStats::default();

        let mut pages: Vec<(usize, Vec<u8>)> = Vec::new();
        let page_size = self.layout.page_size();
        'cpus: for buffer in self.cpus.iter_mut() {
            for _ in 0..MAX_PAGES_PER_CPU {
                if !instance.keep_going() {
                    stats.stopped = true;
                    break 'cpus;
                }
                let mut page = vec![0u8; page_size];
                match read_page(&mut buffer.file, &mut page)? {
                    0 => break,
                    len => {
                        page.truncate(len);
                        pages.push((buffer.cpu, page));
                    }
                }
            }
        }
        stats.pages = pages.len();
        if stats.stopped {
            return Ok(stats);
        }

        let mut entries = Vec::new();
        for (cpu, page) in pages.iter() {
            if self.layout.missed_events(page) {
                stats.missed += 1;
            }
            for entry in self.layout.entries(page) {
                match entry {
                    Ok(entry) => entries.push((*cpu, entry)),
                    Err(err) => warn!("cpu{cpu}: dropping rest of page: {err}"),
                }
            }
        }
        // Stable, so entries of one CPU keep their order on equal stamps.
        entries.sort_by_key(|(_, entry)| entry.ts);

        for (cpu, entry) in entries {
            if !instance.keep_going() {
                stats.stopped = true;
                break;
            }
            let format = match self
                .type_field
                .read_u64(entry.data)
                .ok()
                .and_then(|id| self.follow.get(&(id as u16)))
            {
                Some(format) => format,
                None => {
                    stats.ignored += 1;
                    continue;
                }
            };
            stats.records += 1;
            let record = EventRecord {
                format,
                data: entry.data,
                cpu,
                ts: entry.ts,
            };
            if callback(&record) == Flow::Stop {
                stats.stopped = true;
                break;
            }
        }
        if stats.missed > 0 {
            warn!("kernel dropped events on {} pages", stats.missed);
        }
        Ok(stats)
    }
}

/// Reads one page, returning 0 when the buffer is currently empty.
fn read_page(file: &mut File, page: &mut [u8]) -> io::Result<usize> {
    loop {
        match file.read(page) {
            Ok(len) => return Ok(len),
            Err(err) => match Errno::from_raw(err.raw_os_error().unwrap_or(0)) {
                Errno::EAGAIN => return Ok(0),
                Errno::EINTR => continue,
                _ => return Err(err),
            },
        }
    }
}
