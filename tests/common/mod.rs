//! Common test utilities for opensnoop integration tests.
//!
//! [`FakeTracefs`] lays out the parts of a tracefs mount opensnoop touches in
//! a temporary directory. Writes land in plain files, so tests can inspect
//! the command log of `dynamic_events` and the `enable` files afterwards, and
//! `trace_pipe_raw` files can be filled with hand-built ring buffer pages.

#![allow(dead_code)]

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use opensnoop::tracefs::Tracefs;
use opensnoop::Config;

pub const PAGE_SIZE: usize = 4096;
pub const GETNAME_ID: u16 = 1642;
pub const OTHER_ID: u16 = 316;

pub const HEADER_PAGE: &str = "\tfield: u64 timestamp;\toffset:0;\tsize:8;\tsigned:0;
\tfield: local_t commit;\toffset:8;\tsize:8;\tsigned:1;
\tfield: int overwrite;\toffset:8;\tsize:1;\tsigned:1;
\tfield: char data;\toffset:16;\tsize:4080;\tsigned:1;
";

pub const GETNAME_FORMAT: &str = "name: getnameprobe
ID: 1642
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:unsigned long __probe_func;\toffset:8;\tsize:8;\tsigned:0;
\tfield:unsigned long __probe_ret_ip;\toffset:16;\tsize:8;\tsigned:0;
\tfield:__data_loc char[] arg1;\toffset:24;\tsize:4;\tsigned:1;

print fmt: \"(%lx <- %lx) arg1=\\\"%s\\\"\", REC->__probe_func, REC->__probe_ret_ip, __get_str(arg1)
";

pub struct FakeTracefs {
    pub dir: TempDir,
    pub cpus: usize,
}

impl FakeTracefs {
    /// A tracefs with the getname probe's top level event and a populated
    /// `opensnoop` instance, as the kernel would show them once the probe
    /// is installed.
    pub fn new(cpus: usize) -> Self {
        let fake = Self::bare(cpus);
        fake.populate_instance("opensnoop", true);
        fake
    }

    /// Only the top level files, no instance.
    pub fn bare(cpus: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("dynamic_events"), "").unwrap();
        fs::write(root.join("error_log"), "").unwrap();
        fs::create_dir(root.join("instances")).unwrap();
        fs::create_dir_all(root.join("events/kprobes/getnameprobe")).unwrap();
        fs::write(root.join("events/header_page"), HEADER_PAGE).unwrap();
        fs::write(root.join("events/kprobes/getnameprobe/format"), GETNAME_FORMAT).unwrap();
        fs::write(root.join("events/kprobes/getnameprobe/enable"), "0\n").unwrap();
        FakeTracefs { dir, cpus }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn tracefs(&self) -> Tracefs {
        Tracefs::at(self.root())
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.root().join("instances").join(name)
    }

    /// Fills `instances/<name>` with what the kernel creates for a new
    /// instance, plus an unrelated event left enabled.
    pub fn populate_instance(&self, name: &str, with_probe_event: bool) {
        let inst = self.instance_dir(name);
        fs::create_dir_all(&inst).unwrap();
        fs::write(inst.join("trace"), "").unwrap();
        fs::write(inst.join("tracing_on"), "0\n").unwrap();

        let events = inst.join("events");
        fs::create_dir_all(events.join("sched/sched_switch")).unwrap();
        fs::write(events.join("sched/sched_switch/enable"), "1\n").unwrap();
        fs::create_dir_all(events.join("syscalls/sys_enter_openat")).unwrap();
        fs::write(events.join("syscalls/sys_enter_openat/enable"), "1\n").unwrap();
        if with_probe_event {
            fs::create_dir_all(events.join("kprobes/getnameprobe")).unwrap();
            fs::write(events.join("kprobes/getnameprobe/enable"), "0\n").unwrap();
        }

        for cpu in 0..self.cpus {
            let dir = inst.join("per_cpu").join(format!("cpu{cpu}"));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("trace_pipe_raw"), "").unwrap();
        }
    }

    /// Empties the instance directory so that `rmdir` succeeds, the way
    /// the kernel lets an instance go with all its files.
    pub fn release_instance(&self, name: &str) {
        let inst = self.instance_dir(name);
        for entry in fs::read_dir(&inst).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                fs::remove_dir_all(path).unwrap();
            } else {
                fs::remove_file(path).unwrap();
            }
        }
    }

    pub fn write_pages(&self, cpu: usize, pages: &[Vec<u8>]) {
        let path = self
            .instance_dir("opensnoop")
            .join("per_cpu")
            .join(format!("cpu{cpu}"))
            .join("trace_pipe_raw");
        let mut file = fs::File::create(path).unwrap();
        for page in pages {
            file.write_all(page).unwrap();
        }
    }

    pub fn dynamic_events_log(&self) -> String {
        fs::read_to_string(self.root().join("dynamic_events")).unwrap()
    }

    pub fn read_instance_file(&self, rel: &str) -> String {
        fs::read_to_string(self.instance_dir("opensnoop").join(rel)).unwrap()
    }

    pub fn config(&self) -> Config {
        Config {
            tracefs: Some(self.root().to_path_buf()),
            poll_interval_ms: 10,
            skip_prompt: true,
            ..Config::default()
        }
    }
}

/// Raw bytes of a getname probe record.
pub fn getname_record(pid: u32, filename: impl AsRef<[u8]>) -> Vec<u8> {
    let filename = filename.as_ref();
    let mut data = vec![0u8; 28];
    data[0..2].copy_from_slice(&GETNAME_ID.to_ne_bytes());
    data[4..8].copy_from_slice(&pid.to_ne_bytes());
    data[8..16].copy_from_slice(&0xffff_ffff_8140_0000u64.to_ne_bytes());
    let len = filename.len() as u32 + 1;
    data[24..28].copy_from_slice(&((len << 16) | 28).to_ne_bytes());
    data.extend_from_slice(filename);
    data.push(0);
    data
}

/// A record of some other event, with the same common fields.
pub fn other_record(pid: u32) -> Vec<u8> {
    let mut data = vec![0u8; 16];
    data[0..2].copy_from_slice(&OTHER_ID.to_ne_bytes());
    data[4..8].copy_from_slice(&pid.to_ne_bytes());
    data
}

/// Builds one ring buffer page the way the kernel lays it out.
pub struct PageBuilder {
    ts: u64,
    body: Vec<u8>,
}

impl PageBuilder {
    pub fn new(ts: u64) -> Self {
        PageBuilder {
            ts,
            body: Vec::new(),
        }
    }

    fn header(type_len: u32, delta: u32) -> [u8; 4] {
        (type_len | (delta << 5)).to_ne_bytes()
    }

    pub fn event(mut self, delta: u32, data: &[u8]) -> Self {
        let mut padded = data.to_vec();
        while padded.len() % 4 != 0 {
            padded.push(0);
        }
        let words = padded.len() / 4;
        if words <= 28 {
            self.body.extend_from_slice(&Self::header(words as u32, delta));
        } else {
            self.body.extend_from_slice(&Self::header(0, delta));
            self.body
                .extend_from_slice(&(data.len() as u32 + 4).to_ne_bytes());
        }
        self.body.extend_from_slice(&padded);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut page = Vec::with_capacity(PAGE_SIZE);
        page.extend_from_slice(&self.ts.to_ne_bytes());
        page.extend_from_slice(&(self.body.len() as u64).to_ne_bytes());
        page.extend_from_slice(&self.body);
        assert!(page.len() <= PAGE_SIZE, "page overflow");
        page.resize(PAGE_SIZE, 0);
        page
    }
}

/// A writer whose contents stay readable after it was handed away.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8(self.bytes()).unwrap()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
