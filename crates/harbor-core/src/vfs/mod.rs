//! Virtual filesystem layer
//!
//! Storage backends, path normalization and mount resolution.

mod backend;
mod local;
mod path;
mod resolver;

pub use backend::{
    Backend, BackendHandle, BackendReader, BackendWriter, DirEntry, DiskUsage, FileStat,
};
pub use local::LocalFs;
pub use path::{is_within, join, normalize, relativize};
pub use resolver::{ResolvedPath, Resolver};
