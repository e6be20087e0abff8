//! Identity: who a user is and how they prove it.
//!
//! - [`UserId`]: stable `did:haven:z...` identifier derived from signing keys
//! - [`SigningKeypair`] / [`SigningPublicKey`]: hybrid Ed25519 + ML-DSA
//!   signing
//! - [`MessageSignature`]: detached signature stored next to each envelope
//! - [`IdentityKeys`] / [`PublicKeys`]: the complete private material and
//!   its shareable bundle (signing plus X25519 + ML-KEM key agreement)

mod did;
mod keypair;
mod keys;
mod signature;

pub use did::UserId;
pub use keypair::{SigningKeypair, SigningPublicKey};
pub use keys::{IdentityKeys, PublicKeys};
pub use signature::MessageSignature;
