//! A thin client for the kernel tracing filesystem.
//!
//! Everything here is plain file I/O against a tracefs mount: dynamic events
//! are defined by appending to `dynamic_events`, instances are directories
//! under `instances/`, and records come out of `per_cpu/cpuN/trace_pipe_raw`.
//! The root is a parameter so the same code runs against a fake tree in tests.
//!
//! - [`dynevent`]: kprobe/kretprobe descriptors and their install/remove
//! - [`instance`]: trace instances, the event filter and tracing on/off
//! - [`format`]: parsing of `events/<sys>/<event>/format` files
//! - [`iterate`]: draining the per-CPU raw buffers of an instance

pub mod dynevent;
pub mod format;
pub mod instance;
pub mod iterate;

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SnoopError};

pub use dynevent::{DynEvent, DynEventKind};
pub use format::{EventFormat, FormatField};
pub use instance::{Instance, StopHandle};

const TRACEFS_PATH: &str = "/sys/kernel/tracing";
const DEBUGFS_TRACING_PATH: &str = "/sys/kernel/debug/tracing";
const PROC_MOUNTS: &str = "/proc/mounts";

const DYNAMIC_EVENTS: &str = "dynamic_events";
const KPROBE_EVENTS: &str = "kprobe_events";
const ERROR_LOG: &str = "error_log";

#[derive(Debug, Clone)]
pub struct Tracefs {
    root: PathBuf,
}

impl Tracefs {
    /// Use the tracefs tree rooted at `root` as is.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Tracefs { root: root.into() }
    }

    /// Find where tracefs is mounted on this machine.
    pub fn mount() -> Result<Self> {
        for candidate in [TRACEFS_PATH, DEBUGFS_TRACING_PATH] {
            if Path::new(candidate).join("trace").exists() {
                return Ok(Tracefs::at(candidate));
            }
        }

        let mounts = fs::read_to_string(PROC_MOUNTS).map_err(|err| {
            SnoopError::allocation("Locate tracefs", format!("reading {PROC_MOUNTS}: {err}"))
        })?;
        match tracefs_from_mounts(&mounts) {
            Some(root) => Ok(Tracefs::at(root)),
            None => Err(SnoopError::allocation(
                "Locate tracefs",
                "tracefs is not mounted (tried /sys/kernel/tracing and /sys/kernel/debug/tracing)",
            )),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    /// Path of the file new dynamic events are written to. Older kernels only
    /// have `kprobe_events`.
    pub fn dynamic_events_path(&self) -> PathBuf {
        let dynamic = self.path(DYNAMIC_EVENTS);
        if dynamic.exists() {
            dynamic
        } else {
            self.path(KPROBE_EVENTS)
        }
    }

    /// The most recent entry of `error_log`, if the kernel recorded one.
    pub fn last_error(&self) -> Option<String> {
        let log = fs::read_to_string(self.path(ERROR_LOG)).ok()?;
        last_error_entry(&log)
    }

    /// Empties `error_log` so that the next failure's entry is unambiguous.
    pub fn clear_error_log(&self) {
        // Not every kernel has an error log, nothing to do then.
        let _ = write_file(&self.path(ERROR_LOG), "", false);
    }
}

/// Writes `data` to an existing tracefs file. Tracefs files are never
/// created by writing, so a missing file is reported as NotFound.
pub(crate) fn write_file(path: &Path, data: &str, append: bool) -> io::Result<()> {
    debug!("tracefs write {} <- {:?}", path.display(), data.trim_end());
    let mut file = OpenOptions::new()
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;
    file.write_all(data.as_bytes())
}

fn tracefs_from_mounts(mounts: &str) -> Option<PathBuf> {
    mounts.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let _source = parts.next()?;
        let target = parts.next()?;
        let fstype = parts.next()?;
        if fstype == "tracefs" {
            Some(PathBuf::from(target))
        } else {
            None
        }
    })
}

// Entries in error_log look like
//
// [  118.932110] trace_kprobe: error: Failed to register probe event
//   Command: r:kprobes/getnameprobe getnam +0(+0($retval)):string
//                                   ^
//
// and the newest entry is the last one.
fn last_error_entry(log: &str) -> Option<String> {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.iter().rposition(|line| line.starts_with('['))?;
    let entry: Vec<&str> = lines[start..]
        .iter()
        .map(|line| line.trim_end())
        .filter(|line| !line.is_empty())
        .collect();
    Some(entry.join("\n"))
}
