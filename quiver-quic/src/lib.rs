//! # quiver-quic: draft-era QUIC transport protocol core
//!
//! A pure protocol state machine for QUIC long/short header packets with
//! 1-RTT, 0-RTT plumbing and version negotiation: no sockets, no timers,
//! no I/O. Datagrams and time go in; datagrams and events come out. The
//! companion `quiver` crate supplies the UDP run loop, the timer wheel and
//! the blocking endpoint API.
//!
//! ## Layout
//!
//! ```text
//! quiver-quic/
//! ├── varint      - 1/2/4/8-byte variable-length integers
//! ├── ranges      - merged-interval sets for acknowledgement bookkeeping
//! ├── frames      - frame types, zero-copy parsing, encoding
//! ├── packet      - headers, packet numbers, spaces, AEAD + header protection
//! ├── crypto      - key schedule and the TLS adapter contract
//! ├── recovery    - RTT estimation, loss detection, NewReno
//! ├── stream      - reassembly, retransmission queues, stream states
//! ├── cid         - connection-id sets, retirement, voluntary switching
//! ├── transport   - transport parameters
//! ├── token       - retry and stateless-reset tokens
//! └── connection  - the connection state machine (RX pipeline, TX scheduler)
//! ```
//!
//! ## Design notes
//!
//! - The connection is deterministic given inputs and clock readings; all
//!   suspension points live in the runtime crate.
//! - Frame parsing borrows from the decrypted packet; stream data is copied
//!   once, into the reassembly buffers.
//! - The TLS 1.3 handshake itself is an external collaborator behind
//!   [`crypto::TlsSession`]; [`crypto::StubTls`] is a deterministic
//!   loopback stand-in for tests and demos.

#![forbid(unsafe_code)]

pub mod cid;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod frames;
pub mod packet;
pub mod ranges;
pub mod recovery;
pub mod stream;
pub mod token;
pub mod transport;
pub mod types;
pub mod varint;

pub use connection::{
    ConnConfig, ConnState, Connection, Event, Transmit, GREASE_VERSION, SUPPORTED_VERSIONS,
};
pub use error::{CloseReason, TransportError};
pub use transport::TransportParams;
pub use types::{ConnectionId, Epoch, PnSpaceId, Side, StreamId, MAX_DATAGRAM_SIZE};
