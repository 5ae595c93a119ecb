//! Event format files.
//!
//! Every event directory carries a `format` file describing the binary
//! layout of its records:
//!
//! ```text
//! name: getnameprobe
//! ID: 1642
//! format:
//! 	field:unsigned short common_type;	offset:0;	size:2;	signed:0;
//! 	field:unsigned char common_flags;	offset:2;	size:1;	signed:0;
//! 	field:unsigned char common_preempt_count;	offset:3;	size:1;	signed:0;
//! 	field:int common_pid;	offset:4;	size:4;	signed:1;
//!
//! 	field:unsigned long __probe_func;	offset:8;	size:8;	signed:0;
//! 	field:unsigned long __probe_ret_ip;	offset:16;	size:8;	signed:0;
//! 	field:__data_loc char[] arg1;	offset:24;	size:4;	signed:1;
//!
//! print fmt: "(%lx <- %lx) arg1=\"%s\"", REC->__probe_func, ...
//! ```
//!
//! The block before the first blank line holds the fields common to every
//! event.

use std::fs;
use std::io;
use std::sync::LazyLock;

use regex::Regex;

use super::Tracefs;

static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*field:\s*(?P<decl>[^;]+);\s*offset:\s*(?P<offset>\d+);\s*size:\s*(?P<size>\d+);(?:\s*signed:\s*(?P<signed>\d+);)?",
    )
    .expect("Invalid format field regex pattern")
});

static ARRAY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<name>\w+)\[(?P<len>\d*)\]$").expect("Invalid array regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar,
    /// Fixed size array, `char comm[16]`.
    Array(usize),
    /// Dynamic array whose 32 bit slot holds `len << 16 | offset` from the
    /// start of the record.
    DataLoc,
    /// Like `DataLoc`, with the offset relative to the end of the slot.
    RelLoc,
}

/// Where a named field lives inside a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatField {
    pub name: String,
    pub type_name: String,
    pub offset: usize,
    pub size: usize,
    pub signed: bool,
    pub kind: FieldKind,
}

impl FormatField {
    /// Reads the field as an unsigned number of its own size.
    pub fn read_u64(&self, data: &[u8]) -> Result<u64, String> {
        let bytes = self.slot(data)?;
        let val = match self.size {
            1 => bytes[0] as u64,
            2 => u16::from_ne_bytes([bytes[0], bytes[1]]) as u64,
            4 => u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
            8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                u64::from_ne_bytes(buf)
            }
            size => return Err(format!("field {} has unsupported size {size}", self.name)),
        };
        Ok(val)
    }

    /// Reads a string field, without its terminating NUL.
    pub fn read_str<'a>(&self, data: &'a [u8]) -> Result<&'a [u8], String> {
        let raw = match self.kind {
            FieldKind::DataLoc | FieldKind::RelLoc => {
                if self.size != 4 {
                    return Err(format!("dynamic field {} has size {}", self.name, self.size));
                }
                let loc = self.read_u64(data)? as u32;
                let mut start = (loc & 0xffff) as usize;
                let len = (loc >> 16) as usize;
                if self.kind == FieldKind::RelLoc {
                    start += self.offset + self.size;
                }
                data.get(start..start + len).ok_or_else(|| {
                    format!(
                        "field {} points past the record ({start}+{len} > {})",
                        self.name,
                        data.len()
                    )
                })?
            }
            FieldKind::Array(_) | FieldKind::Scalar => self.slot(data)?,
        };
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(&raw[..end])
    }

    fn slot<'a>(&self, data: &'a [u8]) -> Result<&'a [u8], String> {
        data.get(self.offset..self.offset + self.size).ok_or_else(|| {
            format!(
                "field {} ({}+{}) is outside the {} byte record",
                self.name,
                self.offset,
                self.size,
                data.len()
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFormat {
    pub system: String,
    pub name: String,
    pub id: u16,
    pub common_fields: Vec<FormatField>,
    pub fields: Vec<FormatField>,
}

impl EventFormat {
    pub fn parse(system: &str, text: &str) -> Result<Self, String> {
        let mut name = None;
        let mut id = None;
        let mut common_fields = Vec::new();
        let mut fields = Vec::new();
        let mut in_common = true;
        let mut seen_field = false;

        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("name:") {
                name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("ID:") {
                let parsed = rest
                    .trim()
                    .parse::<u16>()
                    .map_err(|err| format!("bad event id {:?}: {err}", rest.trim()))?;
                id = Some(parsed);
            } else if line.trim().is_empty() {
                if seen_field {
                    in_common = false;
                }
            } else if let Some(field) = parse_field_line(line)? {
                seen_field = true;
                if in_common {
                    common_fields.push(field);
                } else {
                    fields.push(field);
                }
            }
        }

        Ok(EventFormat {
            system: system.to_string(),
            name: name.ok_or("format has no name")?,
            id: id.ok_or("format has no ID")?,
            common_fields,
            fields,
        })
    }

    /// Loads `events/<system>/<event>/format` from the top level of tracefs.
    pub fn load(tracefs: &Tracefs, system: &str, event: &str) -> io::Result<Self> {
        let path = tracefs.path("events").join(system).join(event).join("format");
        let text = fs::read_to_string(&path)?;
        EventFormat::parse(system, &text).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: {err}", path.display()),
            )
        })
    }

    pub fn find_common_field(&self, name: &str) -> Option<&FormatField> {
        self.common_fields.iter().find(|field| field.name == name)
    }

    pub fn find_field(&self, name: &str) -> Option<&FormatField> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Searches the common fields first, then the event's own.
    pub fn find_any_field(&self, name: &str) -> Option<&FormatField> {
        self.find_common_field(name).or_else(|| self.find_field(name))
    }
}

/// Parses the field lines of a format-like file, e.g. `events/header_page`.
pub fn parse_fields(text: &str) -> Result<Vec<FormatField>, String> {
    let mut fields = Vec::new();
    for line in text.lines() {
        if let Some(field) = parse_field_line(line)? {
            fields.push(field);
        }
    }
    Ok(fields)
}

fn parse_field_line(line: &str) -> Result<Option<FormatField>, String> {
    let Some(caps) = FIELD_RE.captures(line) else {
        return Ok(None);
    };
    let number = |key: &str| -> Result<usize, String> {
        caps[key]
            .parse::<usize>()
            .map_err(|err| format!("bad {key} in {line:?}: {err}"))
    };
    let offset = number("offset")?;
    let size = number("size")?;
    let signed = caps.name("signed").is_some_and(|m| m.as_str() != "0");

    let (type_name, name, kind) = parse_decl(caps["decl"].trim())?;
    Ok(Some(FormatField {
        name,
        type_name,
        offset,
        size,
        signed,
        kind,
    }))
}

fn parse_decl(decl: &str) -> Result<(String, String, FieldKind), String> {
    let (last, type_part) = match decl.rsplit_once(char::is_whitespace) {
        Some((type_part, last)) => (last, type_part.trim()),
        None => return Err(format!("field declaration without a type: {decl:?}")),
    };

    let (name, array_len) = match ARRAY_RE.captures(last) {
        Some(caps) => (caps["name"].to_string(), caps["len"].parse::<usize>().ok()),
        None => (last.to_string(), None),
    };

    if let Some(ty) = type_part.strip_prefix("__data_loc") {
        return Ok((ty.trim().to_string(), name, FieldKind::DataLoc));
    }
    if let Some(ty) = type_part.strip_prefix("__rel_loc") {
        return Ok((ty.trim().to_string(), name, FieldKind::RelLoc));
    }
    let kind = match array_len {
        Some(len) => FieldKind::Array(len),
        None => FieldKind::Scalar,
    };
    Ok((type_part.to_string(), name, kind))
}
