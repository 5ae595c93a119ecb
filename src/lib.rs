//! opensnoop library - shared modules for the opensnoop and opensnoop-cleanup
//! binaries.
//!
//! A kretprobe on `getname` records the filename every path-taking syscall
//! resolves. The probe's event is enabled in a private trace instance and
//! the instance's raw buffers are decoded into `PID FILE` lines.
//!
//! # Modules
//!
//! - [`tracefs`] - client for the tracing filesystem: probes, instances,
//!   event formats and raw buffer iteration
//! - [`ringbuf`] - decoding of ring buffer pages
//! - [`snoop`] - record decoding and output
//! - [`session`] - setup and teardown of a run
//! - [`cancel`] - cancellation token and interrupt wiring

pub mod cancel;
pub mod config;
pub mod error;
pub mod ringbuf;
pub mod session;
pub mod snoop;
pub mod tracefs;

pub use cancel::{CancelToken, Interrupt};
pub use config::Config;
pub use error::SnoopError;
pub use session::Session;
