pub mod config;
pub mod error;
pub mod types;

pub use error::{InokeyError, InokeyResult};
pub use types::{
    ContextError, EncryptionContext, EncryptionMode, InodeKind, KeyDescriptor, MasterKeyPayload,
    PayloadError,
};
