//! `weave_core` locates comment anchors in source files and weaves stored
//! code fragments in right after them, writing a transformed copy of the
//! tree and never touching the originals.
//!
//! ## Processing Pipeline
//!
//! ```text
//! Source tree
//!   → Discovery (walks the root, filters by extension, skips earlier run output)
//!   → Encoding resolver (BOM, statistical detection, candidate list, lossy UTF-8)
//!   → Anchor grammar (embedded `// TC1 STEP1:` + `// code:` or referenced `// TC1 STEP1 seg`)
//!   → Fragment repository (case → step → segment → code, loaded from YAML)
//!   → Injector (indents to the anchor, appends the provenance marker)
//!   → Backup tree + woven output tree + `weave-run.json`
//! ```
//!
//! The reverse direction, [`extract`], rebuilds a repository document from
//! already-woven source by following the provenance markers.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from `weave.toml`.
//! - [`encoding`]: Byte decoding with fallback and re-encoding in the original encoding.
//! - [`grammar`]: Anchor recognition.
//! - [`pipeline`]: Batch runs over a directory tree.
//!
//! ## Key Types
//!
//! - [`Anchor`]: A located marker with its `(case, step, segment)` key or embedded payload.
//! - [`FragmentRepository`]: The in-memory three-level fragment index.
//! - [`RepositoryHandle`]: An atomically swappable repository snapshot.
//! - [`Injector`]: Weaves resolved fragments into a line sequence.
//! - [`Pipeline`]: One run over a root, producing [`RunStats`].
//! - [`ExtractReport`]: The result of reverse extraction, including key collisions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! let stats = weave_core::weave_tree(Path::new("src"), None, None).unwrap();
//! println!(
//! 	"{} fragment(s) woven, {} anchor(s) unresolved",
//! 	stats.fragments_injected,
//! 	stats.unresolved.len()
//! );
//! ```

pub use config::*;
pub use document::*;
pub use encoding::Decoded;
pub use encoding::EncodingResolver;
pub use error::*;
pub use extract::*;
pub use grammar::*;
pub use inject::*;
pub use pipeline::*;
pub use repository::*;

pub mod config;
pub mod discovery;
mod document;
pub mod encoding;
#[allow(unused_assignments)]
mod error;
mod extract;
pub mod grammar;
mod inject;
pub mod pipeline;
mod repository;

#[cfg(test)]
mod __fixtures;
