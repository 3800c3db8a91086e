//! Pack entry wire format.
//!
//! Every object in the store is persisted as one entry:
//!
//! ```text
//! +----------+---------+--------------------+----------+
//! | hash: 32 | kind: 1 | length header: 1-10| payload  |
//! +----------+---------+--------------------+----------+
//! ```
//!
//! The length header is a varint whose value covers the payload *and* the
//! header itself, so `hash + kind + header value` is the total entry length.
//! Whether a header is present at all depends on the kind: the v2 kinds and
//! (by configuration) contents carry one, the legacy v1 kinds do not and can
//! only be sized through the index.

use crate::config::ContentsLengthHeader;
use crate::error::{Error, Result};
use crate::hash::{Hash, HASH_SIZE};
use crate::varint;

/// Closed set of entry kinds, one magic byte each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Kind {
    Contents = 0,
    InodeV1Stable = 1,
    InodeV1Unstable = 2,
    InodeV2Root = 3,
    InodeV2Nonroot = 4,
    CommitV1 = 5,
    CommitV2 = 6,
    /// Placeholder left behind for a commit parent reclaimed by GC.
    DanglingParentCommit = 7,
}

impl Kind {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => Kind::Contents,
            1 => Kind::InodeV1Stable,
            2 => Kind::InodeV1Unstable,
            3 => Kind::InodeV2Root,
            4 => Kind::InodeV2Nonroot,
            5 => Kind::CommitV1,
            6 => Kind::CommitV2,
            7 => Kind::DanglingParentCommit,
            other => return Err(Error::CorruptedStore(format!("unknown entry kind {other}"))),
        })
    }

    /// Whether entries of this kind carry a length header.
    pub fn has_length_header(self, contents: ContentsLengthHeader) -> bool {
        match self {
            Kind::Contents => contents == ContentsLengthHeader::Varint,
            Kind::InodeV1Stable | Kind::InodeV1Unstable | Kind::CommitV1 => false,
            Kind::InodeV2Root | Kind::InodeV2Nonroot => true,
            // A dangling placeholder overwrites a commit in place, so it
            // keeps the commit's header to preserve entry boundaries.
            Kind::CommitV2 | Kind::DanglingParentCommit => true,
        }
    }

    pub fn is_commit(self) -> bool {
        matches!(self, Kind::CommitV1 | Kind::CommitV2)
    }

    pub fn is_inode(self) -> bool {
        matches!(
            self,
            Kind::InodeV1Stable | Kind::InodeV1Unstable | Kind::InodeV2Root | Kind::InodeV2Nonroot
        )
    }
}

/// Largest possible `hash + kind + length header` span.
pub const PREFIX_MAX: usize = HASH_SIZE + 1 + varint::MAX_LEN;

/// Smallest useful prefix read: hash and kind, no header.
pub const PREFIX_MIN: usize = HASH_SIZE + 1;

/// The decoded head of an entry, enough to identify and (when the kind has
/// a length header) size it without touching the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPrefix {
    pub hash: Hash,
    pub kind: Kind,
    /// Total entry length including hash, kind byte and header; `None` for
    /// kinds without a length header.
    pub total_length: Option<u64>,
}

impl EntryPrefix {
    /// Decode from at least [`PREFIX_MIN`] bytes. `buf` may be shorter than
    /// [`PREFIX_MAX`] only if the entry sits at the end of the data.
    pub fn decode(buf: &[u8], contents: ContentsLengthHeader) -> Result<Self> {
        if buf.len() < PREFIX_MIN {
            return Err(Error::ReadOutOfBounds);
        }
        let hash = Hash::from_slice(&buf[..HASH_SIZE]).expect("fixed width");
        let kind = Kind::from_u8(buf[HASH_SIZE])?;
        let total_length = if kind.has_length_header(contents) {
            let (header, _) = varint::decode(&buf[PREFIX_MIN..])?;
            Some(PREFIX_MIN as u64 + header)
        } else {
            None
        };
        Ok(Self {
            hash,
            kind,
            total_length,
        })
    }
}

/// Header length (hash + kind + optional varint) of an encoded entry,
/// i.e. the offset at which its payload starts.
pub fn header_len(bytes: &[u8], kind: Kind, contents: ContentsLengthHeader) -> Result<usize> {
    if !kind.has_length_header(contents) {
        return Ok(PREFIX_MIN);
    }
    let (_, consumed) = varint::decode(&bytes[PREFIX_MIN..])?;
    Ok(PREFIX_MIN + consumed)
}

/// Encode a full entry for the given payload, returning the bytes and the
/// total length.
pub fn encode_entry(
    hash: &Hash,
    kind: Kind,
    payload: &[u8],
    contents: ContentsLengthHeader,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREFIX_MIN + varint::MAX_LEN + payload.len());
    out.extend_from_slice(hash.as_bytes());
    out.push(kind.to_u8());
    if kind.has_length_header(contents) {
        varint::encode(varint::length_header(payload.len() as u64), &mut out);
    }
    out.extend_from_slice(payload);
    out
}
