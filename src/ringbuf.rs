//! Decoding of the kernel ring buffer pages read from `trace_pipe_raw`.
//!
//! A page starts with a header (timestamp, commit) whose layout is published
//! in `events/header_page`. The committed bytes after it are a sequence of
//! events, each with a 32 bit header of `type_len:5, time_delta:27`:
//!
//! - `type_len` 1..=28: data of `type_len * 4` bytes follows
//! - `type_len` 0: the next word holds the length, data follows it
//! - 29: padding, the next word holds its length (a zero delta means the rest
//!   of the page is padding)
//! - 30: time extend, the next word holds the upper bits of the delta
//! - 31: absolute time stamp

use std::fs;

use bitfield::bitfield;

use crate::tracefs::format::{parse_fields, FieldKind, FormatField};
use crate::tracefs::Tracefs;

const TYPE_PADDING: u32 = 29;
const TYPE_TIME_EXTEND: u32 = 30;
const TYPE_TIME_STAMP: u32 = 31;
const TS_SHIFT: u32 = 27;

/// Flags the kernel keeps in the top bits of `commit`.
pub const RB_MISSED_EVENTS: u64 = 1 << 31;
pub const RB_MISSED_STORED: u64 = 1 << 30;
const RB_MISSED_FLAGS: u64 = RB_MISSED_EVENTS | RB_MISSED_STORED;

bitfield! {
    pub struct EventHeader(u32);
    impl Debug;
    pub type_len, set_type_len: 4, 0;
    pub time_delta, set_time_delta: 31, 5;
}

/// One data entry of a page, borrowed from the page buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEntry<'a> {
    pub ts: u64,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLayout {
    timestamp: FormatField,
    commit: FormatField,
    data_offset: usize,
    page_size: usize,
}

impl Default for PageLayout {
    /// Layout of a 64 bit kernel.
    fn default() -> Self {
        let page_size = system_page_size();
        PageLayout {
            timestamp: scalar("timestamp", 0, 8),
            commit: scalar("commit", 8, 8),
            data_offset: 16,
            page_size,
        }
    }
}

impl PageLayout {
    /// Builds the layout from the text of `events/header_page`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let fields = parse_fields(text)?;
        let find = |name: &str| {
            fields
                .iter()
                .find(|field| field.name == name)
                .cloned()
                .ok_or_else(|| format!("header_page has no {name} field"))
        };
        let timestamp = find("timestamp")?;
        let commit = find("commit")?;
        let data = find("data")?;
        Ok(PageLayout {
            timestamp,
            commit,
            data_offset: data.offset,
            page_size: data.offset + data.size,
        })
    }

    /// Reads the layout from tracefs, falling back to the 64 bit defaults
    /// when `header_page` is missing or unreadable.
    pub fn load(tracefs: &Tracefs) -> Self {
        match fs::read_to_string(tracefs.path("events/header_page")) {
            Ok(text) => PageLayout::parse(&text).unwrap_or_else(|err| {
                tracing::warn!("ignoring header_page: {err}");
                PageLayout::default()
            }),
            Err(_) => PageLayout::default(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    /// Whether the kernel dropped events before this page.
    pub fn missed_events(&self, page: &[u8]) -> bool {
        self.commit
            .read_u64(page)
            .map(|commit| commit & RB_MISSED_EVENTS != 0)
            .unwrap_or(false)
    }

    /// Walks the data entries of one page.
    pub fn entries<'a>(&self, page: &'a [u8]) -> PageEntries<'a> {
        let (ts, data, error) = match self.split(page) {
            Ok((ts, data)) => (ts, data, None),
            Err(err) => (0, &page[..0], Some(err)),
        };
        PageEntries {
            data,
            pos: 0,
            ts,
            error,
        }
    }

    fn split<'a>(&self, page: &'a [u8]) -> Result<(u64, &'a [u8]), String> {
        let ts = self.timestamp.read_u64(page)?;
        let commit = (self.commit.read_u64(page)? & !RB_MISSED_FLAGS) as usize;
        let avail = page.len().saturating_sub(self.data_offset);
        if commit > avail {
            return Err(format!("page commit {commit} exceeds the {avail} data bytes read"));
        }
        Ok((ts, &page[self.data_offset..self.data_offset + commit]))
    }
}

pub struct PageEntries<'a> {
    data: &'a [u8],
    pos: usize,
    ts: u64,
    error: Option<String>,
}

impl<'a> PageEntries<'a> {
    fn word(&mut self) -> Result<u32, String> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| format!("truncated event at page offset {}", self.pos))?;
        self.pos += 4;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        let data = self.data;
        let bytes = data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| format!("event of {len} bytes runs past the page at {}", self.pos))?;
        self.pos += len;
        Ok(bytes)
    }

    fn next_entry(&mut self) -> Result<Option<RawEntry<'a>>, String> {
        while self.pos + 4 <= self.data.len() {
            let header = EventHeader(self.word()?);
            let delta = header.time_delta() as u64;
            match header.type_len() {
                TYPE_PADDING => {
                    if delta == 0 {
                        // Rest of the page is unused.
                        self.pos = self.data.len();
                        return Ok(None);
                    }
                    let len = self.word()? as usize;
                    // The length word is part of the padding it describes.
                    self.take(len.saturating_sub(4))?;
                }
                TYPE_TIME_EXTEND => {
                    let extend = self.word()? as u64;
                    self.ts += (extend << TS_SHIFT) + delta;
                }
                TYPE_TIME_STAMP => {
                    let extend = self.word()? as u64;
                    self.ts = (extend << TS_SHIFT) + delta;
                }
                0 => {
                    let len = (self.word()? as usize).saturating_sub(4);
                    let len = (len + 3) & !3;
                    self.ts += delta;
                    let data = self.take(len)?;
                    return Ok(Some(RawEntry { ts: self.ts, data }));
                }
                words => {
                    self.ts += delta;
                    let data = self.take(words as usize * 4)?;
                    return Ok(Some(RawEntry { ts: self.ts, data }));
                }
            }
        }
        Ok(None)
    }
}

impl<'a> Iterator for PageEntries<'a> {
    type Item = Result<RawEntry<'a>, String>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.error.take() {
            self.pos = self.data.len();
            return Some(Err(err));
        }
        match self.next_entry() {
            Ok(entry) => entry.map(Ok),
            Err(err) => {
                // A broken entry makes the rest of the page unreadable.
                self.pos = self.data.len();
                Some(Err(err))
            }
        }
    }
}

fn scalar(name: &str, offset: usize, size: usize) -> FormatField {
    FormatField {
        name: name.to_string(),
        type_name: String::new(),
        offset,
        size,
        signed: false,
        kind: FieldKind::Scalar,
    }
}

fn system_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}
