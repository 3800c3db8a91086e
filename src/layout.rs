//! Naming and classification of the files under a store root.
//!
//! | file | purpose |
//! |---|---|
//! | `store.control` | versioned control payload |
//! | `store.dict` | interned-string table |
//! | `store.<N>.suffix` | suffix chunk `N` |
//! | `store.prefix.<G>` | packed live image for generation `G` |
//! | `store.mapping.<G>` | offset mapping for generation `G` |
//! | `store.gc_result.<G>` | GC worker result record (ephemeral) |
//! | `store.reachable.<G>`, `store.sorted.<G>` | GC worker scratch (ephemeral) |
//! | `store.pack` | legacy monolithic pack, migrated on open |
//! | `store.lock` | writer lock |

use std::path::{Path, PathBuf};

pub fn control_path(root: &Path) -> PathBuf {
    root.join("store.control")
}

pub fn dict_path(root: &Path) -> PathBuf {
    root.join("store.dict")
}

pub fn suffix_path(root: &Path, idx: u32) -> PathBuf {
    root.join(format!("store.{idx}.suffix"))
}

pub fn prefix_path(root: &Path, generation: u64) -> PathBuf {
    root.join(format!("store.prefix.{generation}"))
}

pub fn mapping_path(root: &Path, generation: u64) -> PathBuf {
    root.join(format!("store.mapping.{generation}"))
}

pub fn gc_result_path(root: &Path, generation: u64) -> PathBuf {
    root.join(format!("store.gc_result.{generation}"))
}

pub fn reachable_path(root: &Path, generation: u64) -> PathBuf {
    root.join(format!("store.reachable.{generation}"))
}

pub fn sorted_path(root: &Path, generation: u64) -> PathBuf {
    root.join(format!("store.sorted.{generation}"))
}

pub fn index_path(root: &Path) -> PathBuf {
    root.join("store.index")
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join("store.lock")
}

pub fn legacy_pack_path(root: &Path) -> PathBuf {
    root.join("store.pack")
}

/// What a file name under the root means to `cleanup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    Control,
    Dict,
    Index,
    Lock,
    LegacyPack,
    Suffix { idx: u32 },
    Prefix { generation: u64 },
    Mapping { generation: u64 },
    GcResult { generation: u64 },
    GcScratch { generation: u64 },
    /// Not one of ours; always preserved.
    Unknown,
}

/// Classify a bare file name.
pub fn classify(name: &str) -> FileKind {
    match name {
        "store.control" => return FileKind::Control,
        "store.dict" => return FileKind::Dict,
        "store.index" => return FileKind::Index,
        "store.lock" => return FileKind::Lock,
        "store.pack" => return FileKind::LegacyPack,
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("store.") {
        if let Some(idx) = rest.strip_suffix(".suffix") {
            if let Ok(idx) = idx.parse::<u32>() {
                return FileKind::Suffix { idx };
            }
        }
        if let Some(generation) = rest.strip_prefix("prefix.") {
            if let Ok(generation) = generation.parse::<u64>() {
                return FileKind::Prefix { generation };
            }
        }
        if let Some(generation) = rest.strip_prefix("mapping.") {
            if let Ok(generation) = generation.parse::<u64>() {
                return FileKind::Mapping { generation };
            }
        }
        if let Some(generation) = rest.strip_prefix("gc_result.") {
            if let Ok(generation) = generation.parse::<u64>() {
                return FileKind::GcResult { generation };
            }
        }
        for scratch in ["reachable.", "sorted."] {
            if let Some(generation) = rest.strip_prefix(scratch) {
                if let Ok(generation) = generation.parse::<u64>() {
                    return FileKind::GcScratch { generation };
                }
            }
        }
    }
    FileKind::Unknown
}
