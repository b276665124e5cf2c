#![forbid(unsafe_code)]

//! sable — an embedded, single-file key/value storage engine.
//!
//! The engine maps fixed-size pages inside one database file and provides
//! ordered key access via cursors that merge committed on-disk state with
//! the pending mutations of an in-memory transaction overlay. The moving
//! parts, leaves first: a block [`device`], the byte-budgeted page
//! [`cache`], the [`freelist`] with its persisted state-page encoding, the
//! [`page_manager`] tying those together, the [`btree`] with its
//! coupled/uncoupled cursors, the [`txn`] op-tree, and the hybrid
//! [`cursor`] walking both ordered stores at once.
//!
//! ```no_run
//! use sable::{CursorMove, DbConfig, Env, EnvConfig};
//!
//! # fn main() -> sable::Result<()> {
//! let env = Env::open("books.sable", EnvConfig::default())?;
//! let db = env.create_db(1, DbConfig::default())?;
//! db.insert(None, b"moby dick", b"melville")?;
//!
//! let txn = env.txn_begin()?;
//! db.insert(Some(&txn), b"neuromancer", b"gibson")?;
//! let mut cursor = db.cursor(Some(&txn));
//! let (key, _record) = cursor.move_to(CursorMove::First, false)?;
//! assert_eq!(key, b"moby dick");
//! env.txn_commit(txn)?;
//! env.close()?;
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod btree;
pub mod cache;
pub mod changeset;
pub mod config;
pub mod cursor;
pub mod db;
pub mod device;
pub mod env;
pub mod error;
pub mod extkey;
pub mod freelist;
pub mod header;
pub mod page;
pub mod page_manager;
pub mod txn;

pub use btree::cursor::CursorMove;
pub use btree::InsertFlags;
pub use config::{DbConfig, EnvConfig};
pub use cursor::Cursor;
pub use db::Db;
pub use env::Env;
pub use error::{Error, Result};
pub use page::{Page, PageKind};
pub use page_manager::{PageFlags, PageManager};
pub use txn::Txn;
