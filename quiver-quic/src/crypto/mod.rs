//! Packet protection keys and the TLS adapter contract.

pub mod keys;
pub mod tls;

pub use keys::{initial_ctxs, CipherCtx, AEAD_TAG_LEN, SAMPLE_LEN};
pub use tls::{KeyInstall, StubTls, TlsProgress, TlsSession};
