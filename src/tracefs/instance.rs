use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::{write_file, Tracefs};
use crate::error::{describe, Result, SnoopError};

/// A named trace instance: its own buffers and its own set of enabled
/// events, independent of the top level and of other tools.
#[derive(Debug)]
pub struct Instance {
    tracefs: Tracefs,
    name: String,
    dir: PathBuf,
    keep_going: Arc<AtomicBool>,
}

/// Lets another context end an in-flight buffer drain of an instance.
///
/// Stopping only flips an atomic, so it is safe to call from an interrupt
/// handler, any number of times.
#[derive(Debug, Clone)]
pub struct StopHandle {
    keep_going: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.keep_going.store(false, Ordering::SeqCst);
    }
}

impl Instance {
    /// Creates `instances/<name>`, or adopts it if a previous run left it
    /// behind.
    pub fn create(tracefs: &Tracefs, name: &str) -> Result<Self> {
        let label = format!("{name} Instance Create");
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(SnoopError::allocation(
                label,
                format!("invalid instance name {name:?}"),
            ));
        }

        let dir = tracefs.path("instances").join(name);
        match fs::create_dir(&dir) {
            Ok(()) => info!("created trace instance {name}"),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!("reusing existing trace instance {name}")
            }
            Err(err) => {
                return Err(SnoopError::allocation(
                    label,
                    format!(
                        "unable to instantiate {name} tracefs instance: {}",
                        describe(&err, tracefs.last_error())
                    ),
                ))
            }
        }

        Ok(Instance {
            tracefs: tracefs.clone(),
            name: name.to_string(),
            dir,
            keep_going: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracefs(&self) -> &Tracefs {
        &self.tracefs
    }

    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.dir.join(rel)
    }

    /// Turns off every event of the instance.
    pub fn disable_all(&self) -> Result<()> {
        self.for_each_event(|_, _, enable| {
            let state = fs::read_to_string(enable)?;
            if state.trim() == "0" {
                return Ok(());
            }
            write_file(enable, "0", false)
        })
        .map_err(|err| {
            SnoopError::filter(
                "Initial Disable Events",
                format!("unable to disable events to clean environment: {err}"),
            )
        })
    }

    pub fn enable_event(&self, system: &str, event: &str) -> Result<()> {
        let enable = self.path("events").join(system).join(event).join("enable");
        write_file(&enable, "1", false).map_err(|err| {
            let detail = if err.kind() == io::ErrorKind::NotFound {
                format!("events/{system}/{event} does not exist")
            } else {
                format!(
                    "unable to enable events/{system}/{event}: {}",
                    describe(&err, self.tracefs.last_error())
                )
            };
            SnoopError::filter("Enable Event", detail)
        })?;
        debug!("enabled {system}/{event} in {}", self.name);
        Ok(())
    }

    /// The (system, event) pairs currently enabled in this instance.
    pub fn enabled_events(&self) -> io::Result<Vec<(String, String)>> {
        let mut enabled = Vec::new();
        self.for_each_event(|system, event, enable| {
            if fs::read_to_string(enable)?.trim_start().starts_with('1') {
                enabled.push((system.to_string(), event.to_string()));
            }
            Ok(())
        })?;
        enabled.sort();
        Ok(enabled)
    }

    /// Empties the instance's buffer.
    pub fn clear(&self) -> Result<()> {
        write_file(&self.path("trace"), "", false).map_err(|err| {
            SnoopError::trace_control(
                "Clean Trace",
                format!("unable to clear the trace buffer before running: {err}"),
            )
        })
    }

    pub fn trace_on(&self) -> Result<()> {
        write_file(&self.path("tracing_on"), "1", false).map_err(|err| {
            SnoopError::trace_control("Turn Tracing On", format!("unable to enable tracing: {err}"))
        })
    }

    pub fn trace_off(&self) -> Result<()> {
        write_file(&self.path("tracing_on"), "0", false).map_err(|err| {
            SnoopError::trace_control(
                "Turning Trace Off",
                format!("unable to disable tracing: {err}"),
            )
        })
    }

    pub fn is_tracing_on(&self) -> io::Result<bool> {
        Ok(fs::read_to_string(self.path("tracing_on"))?.trim() == "1")
    }

    /// Clears the buffer and then starts tracing. Tracing is left off if the
    /// clear fails.
    pub fn clear_and_start(&self) -> Result<()> {
        self.clear()?;
        self.trace_on()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            keep_going: self.keep_going.clone(),
        }
    }

    pub(crate) fn keep_going(&self) -> bool {
        self.keep_going.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_iteration(&self) {
        self.keep_going.store(true, Ordering::SeqCst);
    }

    /// `per_cpu/cpuN` directories of the instance, ordered by CPU.
    pub fn cpu_dirs(&self) -> io::Result<Vec<(usize, PathBuf)>> {
        let mut cpus = Vec::new();
        for entry in fs::read_dir(self.path("per_cpu"))? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(cpu) = name
                .to_str()
                .and_then(|name| name.strip_prefix("cpu"))
                .and_then(|num| num.parse::<usize>().ok())
            {
                cpus.push((cpu, entry.path()));
            }
        }
        cpus.sort();
        Ok(cpus)
    }

    /// Removes the instance from tracefs. The handle is consumed either way.
    pub fn destroy(self) -> Result<()> {
        fs::remove_dir(&self.dir).map_err(|err| {
            SnoopError::teardown(
                "Instance Clean Up",
                format!(
                    "unable to destroy {} tracefs instance: {}",
                    self.name,
                    describe(&err, self.tracefs.last_error())
                ),
            )
        })?;
        info!("destroyed trace instance {}", self.name);
        Ok(())
    }

    fn for_each_event<F>(&self, mut f: F) -> io::Result<()>
    where
        F: FnMut(&str, &str, &Path) -> io::Result<()>,
    {
        for system in fs::read_dir(self.path("events"))? {
            let system = system?;
            if !system.file_type()?.is_dir() {
                continue;
            }
            let system_name = system.file_name().to_string_lossy().into_owned();
            for event in fs::read_dir(system.path())? {
                let event = event?;
                if !event.file_type()?.is_dir() {
                    continue;
                }
                let enable = event.path().join("enable");
                if !enable.exists() {
                    continue;
                }
                let event_name = event.file_name().to_string_lossy().into_owned();
                f(&system_name, &event_name, &enable)?;
            }
        }
        Ok(())
    }
}

/// Destroys the instance behind `handle`, emptying the handle whatever the
/// outcome. A second call is a no-op.
pub fn destroy_instance(handle: &mut Option<Instance>) -> Result<()> {
    match handle.take() {
        Some(instance) => instance.destroy(),
        None => {
            debug!("instance already destroyed");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracefs_with_instances() -> (TempDir, Tracefs) {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("instances")).unwrap();
        let tracefs = Tracefs::at(dir.path());
        (dir, tracefs)
    }

    fn add_event(instance: &Instance, system: &str, event: &str, state: &str) {
        let dir = instance.path("events").join(system).join(event);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("enable"), state).unwrap();
    }

    #[test]
    fn test_create_and_destroy() {
        let (dir, tracefs) = tracefs_with_instances();
        let mut handle = Some(Instance::create(&tracefs, "opensnoop").unwrap());
        assert!(dir.path().join("instances/opensnoop").is_dir());

        destroy_instance(&mut handle).unwrap();
        assert!(handle.is_none());
        assert!(!dir.path().join("instances/opensnoop").exists());
        // Destroying again does nothing.
        destroy_instance(&mut handle).unwrap();
    }

    #[test]
    fn test_create_reuses_existing() {
        let (dir, tracefs) = tracefs_with_instances();
        fs::create_dir(dir.path().join("instances/opensnoop")).unwrap();
        let instance = Instance::create(&tracefs, "opensnoop").unwrap();
        assert_eq!(instance.name(), "opensnoop");
    }

    #[test]
    fn test_create_failures() {
        let dir = TempDir::new().unwrap();
        // No instances directory: not a tracefs with instance support.
        let tracefs = Tracefs::at(dir.path());
        let err = Instance::create(&tracefs, "opensnoop").unwrap_err();
        assert!(matches!(err, SnoopError::Allocation { .. }));
        assert!(Instance::create(&tracefs, "a/b").is_err());
        assert!(Instance::create(&tracefs, "").is_err());
    }

    #[test]
    fn test_disable_all_then_enable_one() {
        let (_dir, tracefs) = tracefs_with_instances();
        let instance = Instance::create(&tracefs, "opensnoop").unwrap();
        add_event(&instance, "sched", "sched_switch", "1\n");
        add_event(&instance, "syscalls", "sys_enter_openat", "1\n");
        add_event(&instance, "kprobes", "getnameprobe", "0\n");

        instance.disable_all().unwrap();
        assert!(instance.enabled_events().unwrap().is_empty());

        instance.enable_event("kprobes", "getnameprobe").unwrap();
        assert_eq!(
            instance.enabled_events().unwrap(),
            vec![("kprobes".to_string(), "getnameprobe".to_string())]
        );
    }

    #[test]
    fn test_enable_missing_event() {
        let (_dir, tracefs) = tracefs_with_instances();
        let instance = Instance::create(&tracefs, "opensnoop").unwrap();
        fs::create_dir(instance.path("events")).unwrap();
        let err = instance.enable_event("kprobes", "getnameprobe").unwrap_err();
        assert!(matches!(err, SnoopError::Filter { .. }));
        assert!(err.to_string().contains("events/kprobes/getnameprobe does not exist"));
    }

    #[test]
    fn test_disable_all_without_events_dir() {
        let (_dir, tracefs) = tracefs_with_instances();
        let instance = Instance::create(&tracefs, "opensnoop").unwrap();
        assert!(matches!(
            instance.disable_all(),
            Err(SnoopError::Filter { .. })
        ));
    }

    #[test]
    fn test_clear_and_start() {
        let (_dir, tracefs) = tracefs_with_instances();
        let instance = Instance::create(&tracefs, "opensnoop").unwrap();
        fs::write(instance.path("tracing_on"), "0").unwrap();

        // No trace file, so the clear fails and tracing stays off.
        let err = instance.clear_and_start().unwrap_err();
        assert!(matches!(err, SnoopError::TraceControl { .. }));
        assert!(!instance.is_tracing_on().unwrap());

        fs::write(instance.path("trace"), "stale data").unwrap();
        instance.clear_and_start().unwrap();
        assert!(instance.is_tracing_on().unwrap());
        assert_eq!(fs::read_to_string(instance.path("trace")).unwrap(), "");

        instance.trace_off().unwrap();
        assert!(!instance.is_tracing_on().unwrap());
    }

    #[test]
    fn test_stop_handle() {
        let (_dir, tracefs) = tracefs_with_instances();
        let instance = Instance::create(&tracefs, "opensnoop").unwrap();
        let stop = instance.stop_handle();
        assert!(instance.keep_going());
        stop.stop();
        stop.stop();
        assert!(!instance.keep_going());
        instance.begin_iteration();
        assert!(instance.keep_going());
    }

    #[test]
    fn test_cpu_dirs_sorted() {
        let (_dir, tracefs) = tracefs_with_instances();
        let instance = Instance::create(&tracefs, "opensnoop").unwrap();
        for cpu in ["cpu10", "cpu2", "cpu0", "stats"] {
            fs::create_dir_all(instance.path("per_cpu").join(cpu)).unwrap();
        }
        let cpus: Vec<usize> = instance.cpu_dirs().unwrap().into_iter().map(|(c, _)| c).collect();
        assert_eq!(cpus, vec![0, 2, 10]);
    }
}
