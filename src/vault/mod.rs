//! CredentialVault (spec.md §4.3): the only place in the process that ever
//! holds plaintext API credentials outside the isolated address space's
//! stack. `crypto` is the pure cryptographic core; `store` wires it to the
//! connection repository and enforces the duplicate-credential invariant.

pub mod crypto;
pub mod store;

pub use crypto::{MasterKey, VaultError};
pub use store::{CredentialVault, DecryptedCredentials};
