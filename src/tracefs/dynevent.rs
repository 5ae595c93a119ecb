use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info};

use super::{write_file, Tracefs};
use crate::error::{describe, Result, SnoopError};

/// Group kprobes land in when no system is given.
pub const DEFAULT_KPROBE_SYSTEM: &str = "kprobes";

// Limits the kernel enforces on definitions; checking them here turns an
// opaque EINVAL at install time into an allocation error with a reason.
const MAX_EVENT_NAME_LEN: usize = 64;
const KRETPROBE_MAXACTIVE_MAX: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynEventKind {
    Kprobe,
    Kretprobe,
}

/// Description of a kprobe or kretprobe dynamic event.
///
/// Allocating one only builds the definition; nothing is visible to the
/// kernel until [`DynEvent::create`], and it stays there until
/// [`DynEvent::destroy`] (or [`uninstall`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynEvent {
    kind: DynEventKind,
    system: Option<String>,
    event: String,
    func_name: String,
    offset: u64,
    format: String,
    max_active: u32,
}

impl DynEvent {
    /// Return probe on `addr`, `format` fetches from `$retval` and friends.
    /// `max_active` of 0 leaves the number of concurrent instances to the
    /// kernel.
    pub fn kretprobe_alloc(
        system: Option<&str>,
        event: &str,
        addr: &str,
        format: &str,
        max_active: u32,
    ) -> Result<Self> {
        Self::alloc(DynEventKind::Kretprobe, system, event, addr, format, max_active)
    }

    /// Entry probe on `addr`.
    pub fn kprobe_alloc(
        system: Option<&str>,
        event: &str,
        addr: &str,
        format: &str,
    ) -> Result<Self> {
        Self::alloc(DynEventKind::Kprobe, system, event, addr, format, 0)
    }

    fn alloc(
        kind: DynEventKind,
        system: Option<&str>,
        event: &str,
        addr: &str,
        format: &str,
        max_active: u32,
    ) -> Result<Self> {
        let label = format!("{event} {kind} Alloc");

        if let Some(system) = system {
            validate_name(system).map_err(|detail| {
                SnoopError::allocation(&label, format!("invalid system {system:?}: {detail}"))
            })?;
        }
        validate_name(event).map_err(|detail| {
            SnoopError::allocation(&label, format!("invalid event {event:?}: {detail}"))
        })?;

        let (func_name, offset) = parse_addr(addr)
            .map_err(|detail| SnoopError::allocation(&label, detail))?;
        if kind == DynEventKind::Kretprobe && offset != 0 && !func_name.is_empty() {
            return Err(SnoopError::allocation(
                &label,
                format!("return probes must not have an offset: {addr}"),
            ));
        }
        if format.contains('\n') {
            return Err(SnoopError::allocation(&label, "format must be a single line"));
        }
        if max_active > KRETPROBE_MAXACTIVE_MAX {
            return Err(SnoopError::allocation(
                &label,
                format!("max active {max_active} exceeds {KRETPROBE_MAXACTIVE_MAX}"),
            ));
        }

        Ok(DynEvent {
            kind,
            system: system.map(str::to_string),
            event: event.to_string(),
            func_name,
            offset,
            format: format.trim().to_string(),
            max_active,
        })
    }

    pub fn system(&self) -> &str {
        self.system.as_deref().unwrap_or(DEFAULT_KPROBE_SYSTEM)
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Probed location as written in the definition.
    pub fn addr(&self) -> String {
        if self.func_name.is_empty() {
            format!("0x{:x}", self.offset)
        } else if self.offset != 0 {
            format!("{}+0x{:x}", self.func_name, self.offset)
        } else {
            self.func_name.clone()
        }
    }

    /// The definition line, e.g. `r:kprobes/getnameprobe getname +0(+0($retval)):string`.
    pub fn command(&self) -> String {
        let prefix = match self.kind {
            DynEventKind::Kprobe => "p".to_string(),
            DynEventKind::Kretprobe if self.max_active > 0 => format!("r{}", self.max_active),
            DynEventKind::Kretprobe => "r".to_string(),
        };
        let mut cmd = format!("{prefix}:{}/{} {}", self.system(), self.event, self.addr());
        if !self.format.is_empty() {
            cmd.push(' ');
            cmd.push_str(&self.format);
        }
        cmd
    }

    pub fn removal_command(&self) -> String {
        format!("-:{}/{}", self.system(), self.event)
    }

    /// Whether the kernel currently exposes this event.
    pub fn exists(&self, tracefs: &Tracefs) -> bool {
        tracefs
            .path("events")
            .join(self.system())
            .join(&self.event)
            .is_dir()
    }

    /// Makes the probe kernel-visible.
    pub fn create(&self, tracefs: &Tracefs) -> Result<()> {
        tracefs.clear_error_log();
        let cmd = format!("{}\n", self.command());
        write_file(&tracefs.dynamic_events_path(), &cmd, true).map_err(|err| {
            SnoopError::install(
                format!("{} dynevent Create", self.addr()),
                describe(&err, tracefs.last_error()),
            )
        })?;
        info!("installed {self}");
        Ok(())
    }

    /// Removes the probe from the kernel. Without `force` the kernel refuses
    /// while the event is enabled anywhere; with it the event is first
    /// disabled in the top level buffer and in every instance.
    pub fn destroy(&self, tracefs: &Tracefs, force: bool) -> Result<()> {
        let label = format!("{} kprobe Clean Up", self.event);
        if force {
            self.disable_everywhere(tracefs)
                .map_err(|err| SnoopError::teardown(&label, err.to_string()))?;
        }
        tracefs.clear_error_log();
        let cmd = format!("{}\n", self.removal_command());
        write_file(&tracefs.dynamic_events_path(), &cmd, true).map_err(|err| {
            SnoopError::teardown(&label, describe(&err, tracefs.last_error()))
        })?;
        info!("removed {self}");
        Ok(())
    }

    fn disable_everywhere(&self, tracefs: &Tracefs) -> io::Result<()> {
        let rel = Path::new("events").join(self.system()).join(&self.event).join("enable");
        disable_if_present(&tracefs.path(&rel))?;

        let instances = match fs::read_dir(tracefs.path("instances")) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        for entry in instances {
            disable_if_present(&entry?.path().join(&rel))?;
        }
        Ok(())
    }
}

impl fmt::Display for DynEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynEventKind::Kprobe => write!(f, "kprobe"),
            DynEventKind::Kretprobe => write!(f, "kretprobe"),
        }
    }
}

impl fmt::Display for DynEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({}/{})", self.kind, self.addr(), self.system(), self.event)
    }
}

/// Uninstalls and frees the probe held in `handle`.
///
/// The handle is emptied whatever the outcome, so a second call is a no-op
/// and a failed removal can never be retried on freed state.
pub fn uninstall(tracefs: &Tracefs, handle: &mut Option<DynEvent>, force: bool) -> Result<()> {
    match handle.take() {
        Some(probe) => probe.destroy(tracefs, force),
        None => {
            debug!("probe already uninstalled");
            Ok(())
        }
    }
}

fn disable_if_present(path: &Path) -> io::Result<()> {
    match write_file(path, "0", false) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        res => res,
    }
}

fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("empty name".to_string());
    }
    if name.len() > MAX_EVENT_NAME_LEN {
        return Err(format!("longer than {MAX_EVENT_NAME_LEN} characters"));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or('_');
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err("must start with a letter or '_'".to_string());
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err("only letters, digits and '_' are allowed".to_string());
    }
    Ok(())
}

// Accepted forms are
// <symbol>
// <symbol>+<offset>
// <address>
// with offsets and addresses in decimal or 0x hex.
fn parse_addr(addr: &str) -> std::result::Result<(String, u64), String> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err("empty probe address".to_string());
    }
    if addr.contains(char::is_whitespace) {
        return Err(format!("probe address contains whitespace: {addr:?}"));
    }

    if let Some(val) = parse_number(addr) {
        return Ok((String::new(), val));
    }

    let mut parts = addr.splitn(2, '+');
    let symbol = parts.next().unwrap_or_default();
    if symbol.is_empty() || symbol.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(format!("invalid probe symbol: {addr:?}"));
    }
    let offset = match parts.next() {
        Some(off) => parse_number(off).ok_or_else(|| format!("invalid probe offset: {addr:?}"))?,
        None => 0,
    };
    Ok((symbol.to_string(), offset))
}

fn parse_number(s: &str) -> Option<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse::<u64>().ok(),
    }
}
