//! Cryptographic capabilities for the sync engine
//!
//! The engine only talks to `CryptoProvider`. Two implementations ship:
//! `LocalCryptoProvider` for authenticated peers and `NullCryptoProvider`
//! for running without identities.

pub mod capability;
pub mod did;
pub mod errors;
pub mod key_material;
pub mod local_provider;
pub mod null_provider;
pub mod provider;

pub use capability::{covers, Capability, UcanClaims};
pub use did::Did;
pub use errors::{CryptoError, CryptoResult};
pub use key_material::{KeyMaterial, KeySource};
pub use local_provider::LocalCryptoProvider;
pub use null_provider::NullCryptoProvider;
pub use provider::{CryptoProvider, PublicIdentity, SealedPayload};
