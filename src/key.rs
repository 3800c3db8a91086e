//! Pack keys: hash-addressed references into the store.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::hash::Hash;

/// Where an entry lives: absolute offset and total length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: u64,
    pub length: u32,
}

impl Span {
    pub fn new(offset: u64, length: u32) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.length)
    }
}

/// A reference to a pack entry.
///
/// A key starts out *indexed* (hash only, resolvable through the index) and
/// is promoted in place to *direct* (hash + span) the first time a lookup
/// pins it down. Promotion is monotonic: the span is set at most once and
/// the hash never changes, so clones made before promotion see it too.
///
/// Equality and hashing consider only the hash; the span is a resolution
/// cache, not identity.
#[derive(Clone)]
pub struct PackKey {
    hash: Hash,
    span: Arc<OnceLock<Span>>,
}

impl PackKey {
    /// A key known only by hash.
    pub fn indexed(hash: Hash) -> Self {
        Self {
            hash,
            span: Arc::new(OnceLock::new()),
        }
    }

    /// A key carrying its location.
    pub fn direct(hash: Hash, span: Span) -> Self {
        let cell = OnceLock::new();
        cell.set(span).expect("fresh cell");
        Self {
            hash,
            span: Arc::new(cell),
        }
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The resolved location, if any.
    pub fn span(&self) -> Option<Span> {
        self.span.get().copied()
    }

    pub fn is_direct(&self) -> bool {
        self.span.get().is_some()
    }

    /// Record the resolved location. The first promotion wins; later calls
    /// with the same span are no-ops.
    pub fn promote(&self, span: Span) {
        let _ = self.span.set(span);
    }
}

impl PartialEq for PackKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for PackKey {}

impl std::hash::Hash for PackKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for PackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.span() {
            Some(span) => write!(
                f,
                "Direct({:?}, offset={}, length={})",
                self.hash, span.offset, span.length
            ),
            None => write!(f, "Indexed({:?})", self.hash),
        }
    }
}
