//! The shared store file.
//!
//! Layout (one codec-encoded line each):
//!
//! ```text
//! [epoch, known_id, known_id, ...]                         <- header, always first
//! ["stability_ipc_ids", window_start, member, member, ...] <- stability windows
//! [sequence, json_payload, acker, acker, ...]              <- message records
//! ```
//!
//! Stability and record lines may appear in any order after the header. The
//! whole file may additionally be folded (see [`crate::codec::fold`]); reading
//! detects that automatically.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use log::warn;

use crate::codec::{decode_text_line, encode_line, fold, is_folded, unfold};
use crate::identity::ProcessId;
use crate::membership::StabilityWindow;
use crate::Result;

pub const STABILITY_TAG: &str = "stability_ipc_ids";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub epoch: u64,
    pub known_ids: Vec<ProcessId>,
}

impl Header {
    pub fn new(epoch: u64, first: ProcessId) -> Self {
        Self {
            epoch,
            known_ids: vec![first],
        }
    }

    pub fn knows(&self, id: &ProcessId) -> bool {
        self.known_ids.contains(id)
    }

    /// Adds `id` to the known set; returns `true` if it was absent.
    pub fn admit(&mut self, id: &ProcessId) -> bool {
        if self.knows(id) {
            return false;
        }
        self.known_ids.push(id.clone());
        true
    }
}

/// One in-flight notification and the processes that have seen it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub sequence: u64,
    pub payload: String,
    pub acked_by: Vec<ProcessId>,
}

impl Record {
    pub fn new(sequence: u64, payload: String, sender: ProcessId) -> Self {
        Self {
            sequence,
            payload,
            acked_by: vec![sender],
        }
    }

    pub fn is_acked_by(&self, id: &ProcessId) -> bool {
        self.acked_by.contains(id)
    }

    pub fn ack(&mut self, id: &ProcessId) {
        if !self.is_acked_by(id) {
            self.acked_by.push(id.clone());
        }
    }

    /// Whether every id in `known` has acknowledged this record.
    pub fn acked_by_all(&self, known: &[ProcessId]) -> bool {
        known.iter().all(|id| self.is_acked_by(id))
    }

    fn encode(&self) -> String {
        let mut fields = Vec::with_capacity(self.acked_by.len() + 2);
        fields.push(self.sequence.to_string());
        fields.push(self.payload.clone());
        fields.extend(self.acked_by.iter().map(|id| id.as_str().to_string()));
        encode_line(&fields)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub header: Option<Header>,
    pub windows: Vec<StabilityWindow>,
    pub records: Vec<Record>,
}

impl StoreSnapshot {
    /// Parses store content. Lines that fail to decode are dropped with a
    /// warning; they can never be acknowledged and would otherwise pin the
    /// file forever.
    pub fn parse(content: &str) -> Result<Self> {
        let plain;
        let content = if is_folded(content) {
            plain = match unfold(content) {
                Ok(plain) => plain,
                Err(err) => {
                    warn!("discarding store content that is neither plain nor folded: {err}");
                    return Ok(StoreSnapshot::default());
                }
            };
            plain.as_str()
        } else {
            content
        };

        let mut snapshot = StoreSnapshot::default();
        let mut lines = content.lines().filter(|line| !line.trim().is_empty());

        if let Some(first) = lines.next() {
            snapshot.header = parse_header(first.trim());
        }

        for line in lines {
            let fields = match decode_text_line(line.trim()) {
                Ok(fields) => fields,
                Err(err) => {
                    warn!("dropping undecodable store line: {err}");
                    continue;
                }
            };
            if fields.first().map(String::as_str) == Some(STABILITY_TAG) {
                match parse_window(&fields) {
                    Some(window) => snapshot.windows.push(window),
                    None => warn!("dropping malformed stability line"),
                }
                continue;
            }
            match parse_record(fields) {
                Some(record) => snapshot.records.push(record),
                None => warn!("dropping malformed record line"),
            }
        }

        Ok(snapshot)
    }

    /// Serializes the snapshot as plain encoded lines.
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(1 + self.windows.len() + self.records.len());
        if let Some(header) = &self.header {
            let mut fields = Vec::with_capacity(header.known_ids.len() + 1);
            fields.push(header.epoch.to_string());
            fields.extend(header.known_ids.iter().map(|id| id.as_str().to_string()));
            lines.push(encode_line(&fields));
        }
        for window in &self.windows {
            let mut fields = Vec::with_capacity(window.members.len() + 2);
            fields.push(STABILITY_TAG.to_string());
            fields.push(window.start_ms.to_string());
            fields.extend(window.members.iter().map(|id| id.as_str().to_string()));
            lines.push(encode_line(&fields));
        }
        for record in &self.records {
            lines.push(record.encode());
        }
        lines.join("\n")
    }
}

fn parse_header(line: &str) -> Option<Header> {
    let fields = match decode_text_line(line) {
        Ok(fields) => fields,
        Err(err) => {
            warn!("discarding undecodable store header: {err}");
            return None;
        }
    };
    let mut fields = fields.into_iter();
    let epoch = match fields.next().and_then(|epoch| epoch.parse::<u64>().ok()) {
        Some(epoch) => epoch,
        None => {
            warn!("discarding store header without a valid epoch");
            return None;
        }
    };
    let mut header = Header {
        epoch,
        known_ids: Vec::new(),
    };
    for id in fields {
        header.admit(&ProcessId::new(id));
    }
    Some(header)
}

fn parse_window(fields: &[String]) -> Option<StabilityWindow> {
    let start_ms = fields.get(1)?.parse::<u64>().ok()?;
    let mut window = StabilityWindow::new(start_ms);
    for id in &fields[2..] {
        window.join(&ProcessId::new(id.as_str()));
    }
    Some(window)
}

fn parse_record(fields: Vec<String>) -> Option<Record> {
    if fields.len() < 2 {
        return None;
    }
    let mut fields = fields.into_iter();
    let sequence = fields.next()?.parse::<u64>().ok()?;
    let payload = fields.next()?;
    let mut record = Record {
        sequence,
        payload,
        acked_by: Vec::new(),
    };
    for id in fields {
        record.ack(&ProcessId::new(id));
    }
    Some(record)
}

/// Handle on the shared store file.
#[derive(Debug, Clone)]
pub struct SharedStore {
    path: PathBuf,
    fold_width: Option<usize>,
}

impl SharedStore {
    pub fn new(path: impl Into<PathBuf>, fold_width: Option<usize>) -> Self {
        Self {
            path: path.into(),
            fold_width,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates an empty store file (and its directory) if missing.
    pub fn ensure_exists(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }

    /// Reads the raw content and its parsed snapshot.
    pub fn read(&self) -> Result<(String, StoreSnapshot)> {
        let raw = fs::read_to_string(&self.path)?;
        let snapshot = StoreSnapshot::parse(&raw)?;
        Ok((raw, snapshot))
    }

    /// Serializes `snapshot` in this store's on-disk form.
    pub fn serialize(&self, snapshot: &StoreSnapshot) -> String {
        let plain = snapshot.render();
        match self.fold_width {
            Some(width) => fold(&plain, width),
            None => plain,
        }
    }

    /// Writes `snapshot` unless it serializes to exactly `previous`.
    ///
    /// Returns whether the file was rewritten. The new content is published
    /// with a rename so readers never see a torn file.
    pub fn write_if_changed(&self, previous: &str, snapshot: &StoreSnapshot) -> Result<bool> {
        let content = self.serialize(snapshot);
        if content == previous {
            return Ok(false);
        }
        let tmp_path = self.temp_path();
        fs::write(&tmp_path, content.as_bytes())?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(true)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
