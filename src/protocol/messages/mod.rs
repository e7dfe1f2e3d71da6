//! SMB2 message bodies organized by category

pub mod common;
pub mod file_ops;
pub mod info;
pub mod ioctl;
pub mod negotiate;
pub mod session;
pub mod tree;

// Re-export commonly used types
pub use common::{Smb2EmptyBody, Smb2ErrorResponse, SmbMessage};
pub use file_ops::{Smb2CloseRequest, Smb2CloseResponse, Smb2CreateRequest, Smb2CreateResponse};
pub use file_ops::{Smb2FlushRequest, Smb2ReadRequest, Smb2ReadResponse};
pub use file_ops::{Smb2WriteRequest, Smb2WriteResponse};
pub use info::{Smb2QueryInfoRequest, Smb2QueryInfoResponse};
pub use ioctl::{Smb2IoctlRequest, Smb2IoctlResponse};
pub use negotiate::{NegotiateContext, Smb2NegotiateRequest, Smb2NegotiateResponse};
pub use session::{Smb2SessionSetupRequest, Smb2SessionSetupResponse};
pub use tree::{ShareType, Smb2TreeConnectRequest, Smb2TreeConnectResponse};
