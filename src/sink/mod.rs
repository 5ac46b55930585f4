//! Persistent storage of fetched artifacts
//!
//! - [`LocalDirSink`]: moves files into a local output directory
//! - [`NoOpSink`]: leaves files in the scratch directory

mod local;
mod noop;
mod traits;

pub use local::LocalDirSink;
pub use noop::NoOpSink;
pub use traits::StorageSink;
