//! One opensnoop run: the probe, the instance and the cancellation token
//! that tie the capture together, and the order they are set up and torn
//! down in.

use std::io::Write;

use tracing::{error, info, warn};

use crate::cancel::{CancelToken, Interrupt};
use crate::config::Config;
use crate::error::{Result, SnoopError};
use crate::snoop::{Capture, CaptureStats, OpenDecoder};
use crate::tracefs::dynevent::uninstall;
use crate::tracefs::instance::destroy_instance;
use crate::tracefs::iterate::RawReader;
use crate::tracefs::{DynEvent, EventFormat, Instance, Tracefs};

pub struct Session {
    tracefs: Tracefs,
    config: Config,
    probe: Option<DynEvent>,
    installed: bool,
    instance: Option<Instance>,
    token: CancelToken,
}

impl Session {
    /// Allocates the probe, creates the instance, installs the probe and
    /// leaves exactly the probe's event enabled in the instance.
    ///
    /// On failure everything created so far is removed again before the
    /// error is returned.
    pub fn setup(tracefs: Tracefs, config: Config) -> Result<Self> {
        let probe = DynEvent::kretprobe_alloc(
            config.probe_system.as_deref(),
            &config.probe_event,
            &config.probe_symbol,
            &config.fetch_format,
            config.max_active,
        )?;

        let mut session = Session {
            tracefs,
            config,
            probe: Some(probe),
            installed: false,
            instance: None,
            token: CancelToken::new(),
        };
        if let Err(err) = session.prepare() {
            // The setup error is what the caller needs to see; cleanup
            // failures are reported on their own.
            let _ = session.teardown();
            return Err(err);
        }
        Ok(session)
    }

    fn prepare(&mut self) -> Result<()> {
        self.instance = Some(Instance::create(&self.tracefs, &self.config.instance)?);

        let probe = self.probe()?;
        probe.create(&self.tracefs)?;
        self.installed = true;

        let instance = self.instance()?;
        let probe = self.probe()?;
        instance.disable_all()?;
        instance.enable_event(probe.system(), probe.event())?;
        Ok(())
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn probe(&self) -> Result<&DynEvent> {
        self.probe
            .as_ref()
            .ok_or_else(|| SnoopError::install("kprobe", "probe was already removed"))
    }

    pub fn instance(&self) -> Result<&Instance> {
        self.instance.as_ref().ok_or_else(|| {
            SnoopError::trace_control("Trace Instance", "instance was already destroyed")
        })
    }

    /// The interrupt context for the calling thread, which must be the one
    /// that later runs [`Session::capture`].
    pub fn interrupt(&self) -> Result<Interrupt> {
        Ok(Interrupt::new(self.token.clone(), self.instance()?.stop_handle()))
    }

    /// Opens the per-CPU buffers, following only the probe's event.
    pub fn open_reader(&self) -> Result<RawReader> {
        let probe = self.probe()?;
        let format = EventFormat::load(&self.tracefs, probe.system(), probe.event())
            .map_err(|err| {
                SnoopError::install(
                    format!("Create {} System TEP", probe.system()),
                    format!(
                        "unable to read the format of {}/{}: {err}",
                        probe.system(),
                        probe.event()
                    ),
                )
            })?;
        RawReader::open(self.instance()?, vec![format]).map_err(|err| {
            SnoopError::trace_control("Open Trace Buffers", err.to_string())
        })
    }

    /// Prints the header, starts tracing and streams records until the
    /// token is set. Tracing is turned off again however the capture ends.
    pub fn capture<W: Write, E: Write>(&self, out: W, err: E) -> Result<CaptureStats> {
        let instance = self.instance()?;
        let mut reader = self.open_reader()?;
        let decoder = OpenDecoder::new(&self.config.pid_field, &self.config.filename_field);
        let mut capture = Capture::new(decoder, self.config.pid_width, out, err);

        capture
            .write_header()
            .map_err(|err| SnoopError::trace_control("Print Header", err.to_string()))?;
        instance.clear_and_start()?;
        info!("tracing {} on {} cpus", self.probe()?, reader.cpu_count());

        let res = capture
            .run(&mut reader, instance, &self.token, self.config.poll_interval())
            .map_err(|err| SnoopError::trace_control("Read Trace Buffers", err.to_string()));
        let stopped = instance.trace_off();
        if let (Err(_), Err(err)) = (&res, &stopped) {
            warn!("{err}");
        }
        let stats = res?;
        stopped?;
        Ok(stats)
    }

    /// Destroys the instance and removes the probe. Both steps always run;
    /// the first failure is returned after both were attempted.
    pub fn teardown(&mut self) -> Result<()> {
        let instance = destroy_instance(&mut self.instance);
        if let Err(err) = &instance {
            error!("{err}");
        }

        let probe = if self.installed {
            self.installed = false;
            uninstall(&self.tracefs, &mut self.probe, self.config.force_destroy)
        } else {
            // Never reached the kernel, freeing it is all there is to do.
            self.probe = None;
            Ok(())
        };
        if let Err(err) = &probe {
            error!("{err}");
        }

        instance.and(probe)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.instance.is_some() || self.probe.is_some() {
            warn!("session dropped without teardown, cleaning up");
            let _ = self.teardown();
        }
    }
}
