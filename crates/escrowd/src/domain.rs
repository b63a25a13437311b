//! The data model: [`Slot`], [`Tag`], and [`Domain`] (the daemon's
//! process-wide escrow state), plus the request validation and mutation
//! logic shared by every opcode in the session loop. Kept free of any I/O
//! so it can be exercised directly in unit tests without a real socket.

use std::os::fd::OwnedFd;

use crate::error::EscrowError;
use crate::sparse::{MAX_IDX, SparseSeq};
use crate::wire::MAX_PAYLOAD;

/// One escrowed entry: an owned descriptor (absent for a payload-only
/// deposit), the depositor's advisory "user descriptor number" (echoed
/// back verbatim, never interpreted by the daemon), and the payload bytes.
///
/// Dropping a `Slot` closes its owned descriptor, if any — this is the
/// unique place a daemon-held descriptor is closed.
pub struct Slot {
    pub fd: Option<OwnedFd>,
    pub ufd: i32,
    pub payload: Vec<u8>,
}

/// A named bucket of slots, addressed by a 20-bit index.
#[derive(Default)]
pub struct Tag {
    seq: SparseSeq<Slot>,
}

impl Tag {
    pub fn new() -> Self {
        Self { seq: SparseSeq::new() }
    }

    /// Inserts `slot` at `idx`, replacing (and thereby closing the
    /// descriptor of) whatever was there before.
    pub fn add(&mut self, idx: u32, slot: Slot) {
        self.seq.put(idx, slot);
    }

    pub fn get(&self, idx: u32) -> Option<&Slot> {
        self.seq.get(idx)
    }

    /// Removes and returns the slot at `idx`; dropping the result closes
    /// its descriptor.
    pub fn remove(&mut self, idx: u32) -> Option<Slot> {
        self.seq.take(idx)
    }

    /// Maximum populated index plus one, or 0 when empty.
    pub fn size(&self) -> u32 {
        self.seq.size()
    }

    /// Sum of payload lengths over every slot currently present.
    pub fn total_payload_bytes(&self) -> u32 {
        self.seq.iter().map(|s| s.payload.len() as u32).sum()
    }
}

/// The daemon's process-wide escrow state: a fixed-size array of tags. Tag
/// identifiers are the half-open range `[0, tags.len())`.
///
/// Deliberately holds no rendezvous path, despite teardown needing one to
/// unlink on exit: that path belongs to `daemon::install_teardown_on_signal`
/// instead, so `Domain` stays free of any I/O and exercisable directly in
/// unit tests without a real socket on disk.
pub struct Domain {
    tags: Vec<Tag>,
}

impl Domain {
    pub fn new(nr_tags: u16) -> Self {
        let mut tags = Vec::with_capacity(nr_tags as usize);
        tags.resize_with(nr_tags as usize, Tag::new);
        Self { tags }
    }

    pub fn nr_tags(&self) -> u16 {
        self.tags.len() as u16
    }

    pub fn tag(&self, tag: u16) -> Option<&Tag> {
        self.tags.get(tag as usize)
    }

    pub fn tag_mut(&mut self, tag: u16) -> Option<&mut Tag> {
        self.tags.get_mut(tag as usize)
    }

    /// Validates `tag` and `idx` against this domain's bounds.
    pub fn validate(&self, tag: u16, idx: u32) -> Result<(), EscrowError> {
        if tag as usize >= self.tags.len() {
            return Err(EscrowError::Invalid(format!(
                "tag {tag} out of range (nr_tags={})",
                self.tags.len()
            )));
        }
        if idx >= MAX_IDX {
            return Err(EscrowError::Invalid(format!("idx {idx} out of range (max {MAX_IDX})")));
        }
        Ok(())
    }
}

/// Validates an `ADD` request's payload length.
pub fn validate_payload_len(nob: usize) -> Result<(), EscrowError> {
    if nob > MAX_PAYLOAD {
        return Err(EscrowError::Invalid(format!(
            "payload length {nob} exceeds MAX_PAYLOAD ({MAX_PAYLOAD})"
        )));
    }
    Ok(())
}
