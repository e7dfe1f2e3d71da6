//! SMB2 protocol definitions

pub mod header;
pub mod messages;
pub mod smb2_constants;

pub use header::{split_compound, FileId, Smb2Header};
