//! Frame coder: wire types, zero-copy parsing and encoding.

pub mod encode;
pub mod parse;
pub mod types;

pub use parse::FrameParser;
pub use types::{
    frame_bit, permitted_in_epoch, AckBlock, AckFrame, ConnectionCloseFrame, CryptoFrame,
    EcnCounts, Frame, NewConnectionIdFrame, ResetStreamFrame, StopSendingFrame, StreamFrame,
};
