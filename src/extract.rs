// src/extract.rs

//! Extraction event stream
//!
//! The database core does not parse archive formats. An external extractor
//! decodes a package and feeds the install transaction an ordered stream of
//! [`ExtractEvent`]s: metadata first, then scripts and file entries in
//! archive order. The stream ends with `Ok(None)`; a mid-stream `Err`
//! (decode or identity-verification failure) aborts the transaction and
//! triggers rollback of the partially unpacked package.

use crate::checksum::Checksum;
use crate::error::Result;
use crate::package::ScriptKind;

/// Filesystem entry type of a file event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Regular,
    Symlink,
    Fifo,
    CharDev,
    BlockDev,
    Socket,
}

impl EntryKind {
    /// Entry types whose content is checksummed; device nodes, fifos and
    /// sockets have no content to digest.
    pub fn needs_checksum(&self) -> bool {
        !matches!(
            self,
            EntryKind::Fifo | EntryKind::CharDev | EntryKind::BlockDev | EntryKind::Socket
        )
    }
}

/// One decoded filesystem entry from a package archive
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Path relative to the installation root, as stored in the archive
    pub name: String,
    pub kind: EntryKind,
    /// Permission bits (lower 12 bits)
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Hard-link target (regular files) or symlink target
    pub link_target: Option<String>,
    /// Embedded content checksum; [`Checksum::NONE`] if the archive
    /// carries none
    pub digest: Checksum,
    /// Checksum over the entry's extended attributes
    pub xattr_digest: Checksum,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, kind: EntryKind, mode: u32) -> FileInfo {
        FileInfo {
            name: name.into(),
            kind,
            mode: mode & 0o7777,
            uid: 0,
            gid: 0,
            size: 0,
            link_target: None,
            digest: Checksum::NONE,
            xattr_digest: Checksum::NONE,
        }
    }
}

/// Structured (v3) install metadata, decoded by the external reader
#[derive(Debug, Clone, Default)]
pub struct InstallMeta {
    /// Raw "replaces" dependency specifications
    pub replaces: Vec<String>,
    pub replaces_priority: u32,
    pub scripts: Vec<(ScriptKind, Vec<u8>)>,
    pub triggers: Vec<String>,
}

/// One event from the extraction stream
#[derive(Debug, Clone)]
pub enum ExtractEvent {
    /// Free-form v2 metadata: newline-separated `key = value` lines
    V2Meta(String),
    /// Structured v3 metadata object
    V3Meta(InstallMeta),
    /// A lifecycle script payload
    Script { kind: ScriptKind, payload: Vec<u8> },
    /// A filesystem entry with its decoded payload
    File { info: FileInfo, payload: Vec<u8> },
}

/// Source of extraction events for one package
pub trait ExtractSource {
    /// Next event, `Ok(None)` at end of stream.
    fn next_event(&mut self) -> Result<Option<ExtractEvent>>;
}

/// In-memory event source; the natural form for callers that have already
/// decoded the package and for tests.
pub struct Events {
    events: std::vec::IntoIter<ExtractEvent>,
    /// Error injected after the queued events, simulating a decode or
    /// identity-verification failure
    fail_with: Option<crate::error::Error>,
}

impl Events {
    pub fn new(events: Vec<ExtractEvent>) -> Events {
        Events {
            events: events.into_iter(),
            fail_with: None,
        }
    }

    pub fn failing(events: Vec<ExtractEvent>, err: crate::error::Error) -> Events {
        Events {
            events: events.into_iter(),
            fail_with: Some(err),
        }
    }
}

impl ExtractSource for Events {
    fn next_event(&mut self) -> Result<Option<ExtractEvent>> {
        match self.events.next() {
            Some(ev) => Ok(Some(ev)),
            None => match self.fail_with.take() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }
}
