use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Settings for one opensnoop run. The defaults trace `getname` returns,
/// which every path-taking syscall, `open()` included, goes through.
///
/// All fields can be overridden from a JSON file:
///
/// ```json
/// {
///   "instance": "opensnoop",
///   "probe_event": "getnameprobe",
///   "probe_symbol": "getname",
///   "fetch_format": "+0(+0($retval)):string",
///   "max_active": 0,
///   "pid_width": 7,
///   "poll_interval_ms": 1000
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    #[serde(skip)]
    pub verbosity: u8,
    /// Tracefs mount to use instead of looking it up
    pub tracefs: Option<PathBuf>,
    /// Name of the trace instance
    pub instance: String,
    /// Group of the probe, `None` puts it in `kprobes`
    pub probe_system: Option<String>,
    /// Name of the probe event
    pub probe_event: String,
    /// Kernel function whose return is probed
    pub probe_symbol: String,
    /// Fetch argument extracting the filename from the return value
    pub fetch_format: String,
    /// Concurrent kretprobe instances, 0 lets the kernel pick
    pub max_active: u32,
    /// Remove the probe even if something else still has it enabled
    pub force_destroy: bool,
    /// Probe field holding the filename
    pub filename_field: String,
    /// Common field holding the pid
    pub pid_field: String,
    /// Width of the right aligned PID column
    pub pid_width: usize,
    /// Sleep between two empty polls of the buffers
    pub poll_interval_ms: u64,
    /// Start tracing without waiting for Enter
    #[serde(skip)]
    pub skip_prompt: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            tracefs: None,
            instance: "opensnoop".to_string(),
            probe_system: None,
            probe_event: "getnameprobe".to_string(),
            probe_symbol: "getname".to_string(),
            fetch_format: "+0(+0($retval)):string".to_string(),
            max_active: 0,
            force_destroy: false,
            filename_field: "arg1".to_string(),
            pid_field: "common_pid".to_string(),
            pid_width: 7,
            poll_interval_ms: 1000,
            skip_prompt: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let buf = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&buf).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_json(buf: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(buf)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pid_width == 0 || self.pid_width > 32 {
            bail!("pid_width must be between 1 and 32, got {}", self.pid_width);
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be non-zero");
        }
        if self.filename_field.is_empty() || self.pid_field.is_empty() {
            bail!("field names must not be empty");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
