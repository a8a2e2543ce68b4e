//! # nxfs
//!
//! Read-only virtual filesystem over Nintendo Switch content containers.
//!
//! Five formats are supported: PFS0, HFS0, RomFS, NCA and XCI. A host file
//! in any of them is probed, decrypted where needed and mounted as a lazy
//! tree that can be listed, searched, read from or served through a FUSE
//! host. Nested containers mount recursively: a read at a path may resolve
//! through a RomFS inside an NCA inside an HFS partition inside an XCI, a
//! chain of offset and decrypt views stacked over one file handle.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nxfs::{FileSystem, KeySet, Keys};
//!
//! let mut keyset = KeySet::default();
//! keyset.set_key("header_key", "<hex>");
//! // ... remaining console keys, typically fed from a prod.keys file
//!
//! let fs = FileSystem::new("game.xci", Arc::new(Keys::new(keyset)))?;
//! fs.walk(
//!     "/",
//!     usize::MAX,
//!     &mut |dir| { println!("{dir}/"); false },
//!     &mut |file| { println!("{file}"); false },
//! );
//! # Ok::<(), nxfs::Error>(())
//! ```

pub mod containers;
pub mod crypto;
pub mod error;
pub mod formats;
pub mod io;
pub mod keys;
pub mod vfs;

pub use error::{Error, Result};
pub use keys::{KeySet, Keys, TitleKeySet};
pub use vfs::{FileSystem, Stat};
