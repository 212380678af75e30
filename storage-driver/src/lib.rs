//! # Storage driver
//!
//! The capability trait implemented by every storage backend, and the error
//! type they share.

mod driver;
mod error;

pub use driver::splice_at;
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;
