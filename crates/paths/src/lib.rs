//! Cache identity for library roots and the files inside them.
//!
//! Every cached row is keyed by a `(root, file)` pair of strings. Over the
//! life of the application those strings have been written in several shapes
//! (absolute, relative, before and after case normalization), so this crate
//! turns whatever a caller supplies into the canonical key **plus** every
//! legacy form a lookup may need to fall back to.
//!
//! Nothing here touches the filesystem or the database.

mod resolve;
mod style;

pub use crate::resolve::{LIBRARY_SEGMENT, PathResolver, ResolvedPath};
pub use crate::style::PathStyle;
