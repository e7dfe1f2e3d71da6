//! Message integrity and confidentiality: signing keys, MACs, the
//! pre-auth hash and SMB 3.x encryption

pub mod encryption;
pub mod kdf;
pub mod preauth;
pub mod signing;

pub use encryption::{CipherAlgorithm, SessionCipher};
pub use preauth::PreauthHash;
pub use signing::{Signer, SigningAlgorithm};
