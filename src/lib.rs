//! A content-addressed, append-only pack store with concurrent
//! mark-and-copy garbage collection.
//!
//! Objects (contents, inodes, commits) are persisted as immutable pack
//! entries in a chunked append-only suffix; a small control file anchors
//! the layout; commits are registered in an index so bare hashes stay
//! resolvable. A GC copies everything reachable from a chosen commit into
//! a fresh prefix + mapping while the writer keeps appending, then swaps
//! the generation in atomically through the control file.
//!
//! ```no_run
//! use packstore::{Config, Gc, Object, PackStore};
//!
//! # async fn demo() -> packstore::Result<()> {
//! let mut store = PackStore::open(&Config::new("./data").fresh(true))?;
//! let file = store.add(&Object::Contents(b"hello".to_vec()))?;
//! let node = store.add(&Object::Inode {
//!     root: true,
//!     children: vec![(b"file".to_vec(), file)],
//! })?;
//! let commit = store.add(&Object::Commit {
//!     node,
//!     parents: vec![],
//!     message: b"first".to_vec(),
//! })?;
//! store.flush()?;
//!
//! let mut gc = Gc::start(&mut store, &commit)?;
//! let stats = gc.wait(&mut store).await?;
//! println!("reclaimed down to {} live bytes", stats.copied_bytes);
//! # Ok(())
//! # }
//! ```

pub mod append;
pub mod cache;
pub mod config;
pub mod control;
pub mod dict;
pub mod dispatcher;
pub mod entry;
pub mod error;
pub mod flock;
pub mod gc;
pub mod hash;
pub mod index;
pub mod io;
pub mod key;
pub mod layout;
pub mod manager;
pub mod mapping;
pub mod object;
pub mod pack;
pub mod prefix;
pub mod suffix;
pub mod tmpfs;
pub mod varint;

pub use config::{Config, ContentsLengthHeader, InodeChildOrder, MergeThrottle};
pub use error::{Error, Result};
pub use gc::{Gc, GcStats, GcStatus};
pub use hash::Hash;
pub use index::IndexingStrategy;
pub use key::{PackKey, Span};
pub use manager::FileManager;
pub use object::Object;
pub use pack::PackStore;
