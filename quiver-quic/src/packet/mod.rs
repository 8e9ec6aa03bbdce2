//! Packet coder and packet-number spaces: header parse/encode, header
//! protection, AEAD, coalescing, per-epoch numbering.

pub mod coder;
pub mod header;
pub mod number;
pub mod space;

pub use coder::{can_coalesce, coalesced_len, protect, unprotect, UnprotectError};
pub use header::{Header, HeaderError, PacketType};
pub use space::{PnSpace, SentMeta, StreamDataRef};
