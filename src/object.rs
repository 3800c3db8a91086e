//! The domain values persisted as pack entries: raw contents, inodes
//! (directory nodes) and commits.
//!
//! Two encodings exist per object and they deliberately differ:
//!
//! * the **pre-hash** encoding references children by hash and feeds the
//!   content digest, so an object's identity is independent of where its
//!   children landed on disk;
//! * the **payload** encoding references children by store offset (and
//!   interns inode step names through the dict), which is what makes a GC
//!   traversal self-describing: child offsets fall out of the payload
//!   without consulting any external table.

use crate::dict::Dict;
use crate::entry::Kind;
use crate::error::{Error, Result};
use crate::hash::{Hash, HASH_SIZE};
use crate::key::PackKey;
use crate::varint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    /// Opaque leaf bytes.
    Contents(Vec<u8>),
    /// A directory node: named references to children (inodes or contents).
    Inode {
        root: bool,
        children: Vec<(Vec<u8>, PackKey)>,
    },
    /// A commit: the root node of its tree plus parent commits.
    Commit {
        node: PackKey,
        parents: Vec<PackKey>,
        message: Vec<u8>,
    },
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Object::Contents(_) => Kind::Contents,
            Object::Inode { root: true, .. } => Kind::InodeV2Root,
            Object::Inode { root: false, .. } => Kind::InodeV2Nonroot,
            Object::Commit { .. } => Kind::CommitV2,
        }
    }

    /// Content digest over the pre-hash encoding.
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::new();
        buf.push(self.kind().to_u8());
        match self {
            Object::Contents(bytes) => buf.extend_from_slice(bytes),
            Object::Inode { children, .. } => {
                varint::encode(children.len() as u64, &mut buf);
                for (name, key) in children {
                    varint::encode(name.len() as u64, &mut buf);
                    buf.extend_from_slice(name);
                    buf.extend_from_slice(key.hash().as_bytes());
                }
            }
            Object::Commit {
                node,
                parents,
                message,
            } => {
                buf.extend_from_slice(node.hash().as_bytes());
                varint::encode(parents.len() as u64, &mut buf);
                for parent in parents {
                    buf.extend_from_slice(parent.hash().as_bytes());
                }
                varint::encode(message.len() as u64, &mut buf);
                buf.extend_from_slice(message);
            }
        }
        Hash::digest(&buf)
    }

    /// Encode the on-disk payload. `offset_of_key` pins every referenced
    /// key to an offset, consulting the index for keys that are still bare
    /// hashes.
    pub fn encode_payload(
        &self,
        dict: &mut Dict,
        offset_of_key: &mut dyn FnMut(&PackKey) -> Result<u64>,
    ) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Object::Contents(bytes) => buf.extend_from_slice(bytes),
            Object::Inode { children, .. } => {
                varint::encode(children.len() as u64, &mut buf);
                for (name, key) in children {
                    let id = dict.index(name)?;
                    varint::encode(u64::from(id), &mut buf);
                    varint::encode(offset_of_key(key)?, &mut buf);
                }
            }
            Object::Commit {
                node,
                parents,
                message,
            } => {
                varint::encode(offset_of_key(node)?, &mut buf);
                varint::encode(parents.len() as u64, &mut buf);
                for parent in parents {
                    varint::encode(offset_of_key(parent)?, &mut buf);
                }
                varint::encode(message.len() as u64, &mut buf);
                buf.extend_from_slice(message);
            }
        }
        Ok(buf)
    }

    /// Decode a payload. `key_of_offset` materialises child offsets into
    /// keys by reading entry prefixes.
    pub fn decode_payload(
        kind: Kind,
        payload: &[u8],
        dict: &Dict,
        key_of_offset: &mut dyn FnMut(u64) -> Result<PackKey>,
    ) -> Result<Object> {
        let mut cursor = Cursor::new(payload);
        match kind {
            Kind::Contents => Ok(Object::Contents(payload.to_vec())),
            Kind::InodeV1Stable
            | Kind::InodeV1Unstable
            | Kind::InodeV2Root
            | Kind::InodeV2Nonroot => {
                let count = cursor.varint()?;
                let mut children = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let id = cursor.varint()?;
                    let name = dict
                        .find(id as u32)
                        .ok_or_else(|| {
                            Error::CorruptedStore(format!("inode references unknown dict id {id}"))
                        })?
                        .to_vec();
                    let offset = cursor.varint()?;
                    children.push((name, key_of_offset(offset)?));
                }
                let root = matches!(kind, Kind::InodeV1Stable | Kind::InodeV2Root);
                Ok(Object::Inode { root, children })
            }
            Kind::CommitV1 | Kind::CommitV2 => {
                let node = key_of_offset(cursor.varint()?)?;
                let parent_count = cursor.varint()?;
                let mut parents = Vec::with_capacity(parent_count as usize);
                for _ in 0..parent_count {
                    parents.push(key_of_offset(cursor.varint()?)?);
                }
                let message = cursor.bytes()?;
                Ok(Object::Commit {
                    node,
                    parents,
                    message,
                })
            }
            Kind::DanglingParentCommit => Err(Error::DanglingKey(
                "decoding a gced commit placeholder".to_string(),
            )),
        }
    }

    /// Approximate in-memory footprint, used as the LRU weight.
    pub fn weight(&self) -> u64 {
        match self {
            Object::Contents(bytes) => 32 + bytes.len() as u64,
            Object::Inode { children, .. } => {
                32 + children
                    .iter()
                    .map(|(name, _)| name.len() as u64 + HASH_SIZE as u64 + 24)
                    .sum::<u64>()
            }
            Object::Commit {
                parents, message, ..
            } => 64 + message.len() as u64 + parents.len() as u64 * (HASH_SIZE as u64 + 24),
        }
    }
}

/// Offsets referenced by a payload, for the GC traversal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChildOffsets {
    /// Offsets the object needs live: inode children, a commit's root node.
    pub children: Vec<u64>,
    /// A commit's parent offsets; kept addressable but not traversed.
    pub parents: Vec<u64>,
}

/// Extract the referenced offsets without touching the dict.
pub fn child_offsets(kind: Kind, payload: &[u8]) -> Result<ChildOffsets> {
    let mut cursor = Cursor::new(payload);
    let mut out = ChildOffsets::default();
    match kind {
        Kind::Contents | Kind::DanglingParentCommit => {}
        Kind::InodeV1Stable | Kind::InodeV1Unstable | Kind::InodeV2Root | Kind::InodeV2Nonroot => {
            let count = cursor.varint()?;
            for _ in 0..count {
                let _dict_id = cursor.varint()?;
                out.children.push(cursor.varint()?);
            }
        }
        Kind::CommitV1 | Kind::CommitV2 => {
            out.children.push(cursor.varint()?);
            let parent_count = cursor.varint()?;
            for _ in 0..parent_count {
                out.parents.push(cursor.varint()?);
            }
        }
    }
    Ok(out)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn varint(&mut self) -> Result<u64> {
        let (value, consumed) = varint::decode(&self.buf[self.pos..])?;
        self.pos += consumed;
        Ok(value)
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.varint()? as usize;
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(Error::ReadOutOfBounds);
        }
        let out = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Span;
    use crate::tmpfs::TempDir;

    fn test_dict(dir: &TempDir) -> Dict {
        Dict::create_rw(&dir.file("store.dict"), false, 1024).unwrap()
    }

    fn direct(payload: &[u8], offset: u64) -> PackKey {
        PackKey::direct(Hash::digest(payload), Span::new(offset, 40))
    }

    #[test]
    fn test_contents_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut dict = test_dict(&dir);
        let obj = Object::Contents(b"file body".to_vec());

        let payload = obj
            .encode_payload(&mut dict, &mut |_| unreachable!("no references"))
            .unwrap();
        let back = Object::decode_payload(Kind::Contents, &payload, &dict, &mut |_| {
            unreachable!("no references")
        })
        .unwrap();
        assert_eq!(obj, back);
        assert_eq!(obj.hash(), back.hash());
    }

    #[test]
    fn test_inode_roundtrip_interns_names() {
        let dir = TempDir::new().unwrap();
        let mut dict = test_dict(&dir);
        let a = direct(b"a", 10);
        let b = direct(b"b", 50);
        let obj = Object::Inode {
            root: true,
            children: vec![(b"lib.rs".to_vec(), a.clone()), (b"main.rs".to_vec(), b.clone())],
        };

        let payload = obj
            .encode_payload(&mut dict, &mut |k| Ok(k.span().unwrap().offset))
            .unwrap();
        assert_eq!(dict.len(), 2);

        let keys = [a, b];
        let back = Object::decode_payload(Kind::InodeV2Root, &payload, &dict, &mut |off| {
            Ok(keys.iter().find(|k| k.span().unwrap().offset == off).unwrap().clone())
        })
        .unwrap();
        assert_eq!(obj, back);
    }

    #[test]
    fn test_commit_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut dict = test_dict(&dir);
        let node = direct(b"root node", 100);
        let parent = direct(b"parent commit", 20);
        let obj = Object::Commit {
            node: node.clone(),
            parents: vec![parent.clone()],
            message: b"import everything".to_vec(),
        };

        let payload = obj
            .encode_payload(&mut dict, &mut |k| Ok(k.span().unwrap().offset))
            .unwrap();
        let keys = [node, parent];
        let back = Object::decode_payload(Kind::CommitV2, &payload, &dict, &mut |off| {
            Ok(keys.iter().find(|k| k.span().unwrap().offset == off).unwrap().clone())
        })
        .unwrap();
        assert_eq!(obj, back);
    }

    #[test]
    fn test_hash_ignores_offsets() {
        // The same logical commit written in two stores at different
        // offsets must digest identically.
        let node_hash = Hash::digest(b"node");
        let a = Object::Commit {
            node: PackKey::direct(node_hash, Span::new(0, 10)),
            parents: vec![],
            message: b"m".to_vec(),
        };
        let b = Object::Commit {
            node: PackKey::direct(node_hash, Span::new(9999, 10)),
            parents: vec![],
            message: b"m".to_vec(),
        };
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_depends_on_children() {
        let base = Object::Inode {
            root: false,
            children: vec![(b"x".to_vec(), direct(b"1", 0))],
        };
        let other = Object::Inode {
            root: false,
            children: vec![(b"x".to_vec(), direct(b"2", 0))],
        };
        assert_ne!(base.hash(), other.hash());
    }

    #[test]
    fn test_child_offsets_extraction() {
        let dir = TempDir::new().unwrap();
        let mut dict = test_dict(&dir);

        let inode = Object::Inode {
            root: true,
            children: vec![
                (b"one".to_vec(), direct(b"1", 11)),
                (b"two".to_vec(), direct(b"2", 22)),
            ],
        };
        let payload = inode
            .encode_payload(&mut dict, &mut |k| Ok(k.span().unwrap().offset))
            .unwrap();
        let offsets = child_offsets(Kind::InodeV2Root, &payload).unwrap();
        assert_eq!(offsets.children, vec![11, 22]);
        assert!(offsets.parents.is_empty());

        let commit = Object::Commit {
            node: direct(b"n", 33),
            parents: vec![direct(b"p1", 1), direct(b"p2", 2)],
            message: b"msg".to_vec(),
        };
        let payload = commit
            .encode_payload(&mut dict, &mut |k| Ok(k.span().unwrap().offset))
            .unwrap();
        let offsets = child_offsets(Kind::CommitV2, &payload).unwrap();
        assert_eq!(offsets.children, vec![33]);
        assert_eq!(offsets.parents, vec![1, 2]);
    }

    #[test]
    fn test_decode_dangling_placeholder_is_refused() {
        let dir = TempDir::new().unwrap();
        let dict = test_dict(&dir);
        let err = Object::decode_payload(Kind::DanglingParentCommit, &[], &dict, &mut |_| {
            unreachable!()
        });
        assert!(matches!(err, Err(Error::DanglingKey(_))));
    }
}
