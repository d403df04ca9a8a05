//! Compact object-format codec and static linker/archiver core.
//!
//! `format` implements the on-disk OBJ record layouts (header, section,
//! symbol, relocation, import) with runtime-determined endianness.
//! `symtab`, `sections`, and `reloc` implement the link driver's three
//! pillars — symbol resolution, output section layout and merging, and
//! relocation patching — orchestrated by [`link::LinkDriver`].
//! `compress` and `archive` implement the archiver's block codec and
//! container format.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod arena;
pub mod archive;
pub mod compress;
pub mod error;
pub mod format;
pub mod link;
pub mod reloc;
pub mod sections;
pub mod strtab;
pub mod symtab;

pub use error::{Error, Result};
pub use format::object::Object;
pub use link::{LinkDriver, LinkOptions, LinkOutput, OutputType};
