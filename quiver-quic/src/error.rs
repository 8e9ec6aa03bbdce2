//! Transport error taxonomy and the close record carried until a
//! CONNECTION_CLOSE goes out.

use thiserror::Error;

/// Transport-level error codes as they appear in CONNECTION_CLOSE (0x1c).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No error (0x0); used for clean local close.
    #[error("no error")]
    NoError,

    /// Internal error (0x1).
    #[error("internal error")]
    Internal,

    /// Flow-control limit exceeded (0x3).
    #[error("flow control error")]
    FlowControl,

    /// Stream ID above the advertised ceiling (0x4).
    #[error("stream id error")]
    StreamId,

    /// Frame received in an invalid stream state (0x5).
    #[error("stream state error")]
    StreamState,

    /// Malformed frame (0x7).
    #[error("frame encoding error")]
    FrameEncoding,

    /// Invalid or duplicate transport parameter (0x8).
    #[error("transport parameter error")]
    TransportParameter,

    /// Generic protocol violation (0xa).
    #[error("protocol violation")]
    ProtocolViolation,

    /// TLS alert, carried as 0x100 | alert.
    #[error("TLS alert {0:#04x}")]
    Tls(u8),
}

impl TransportError {
    /// Wire representation.
    pub fn to_wire(self) -> u64 {
        match self {
            TransportError::NoError => 0x0,
            TransportError::Internal => 0x1,
            TransportError::FlowControl => 0x3,
            TransportError::StreamId => 0x4,
            TransportError::StreamState => 0x5,
            TransportError::FrameEncoding => 0x7,
            TransportError::TransportParameter => 0x8,
            TransportError::ProtocolViolation => 0xa,
            TransportError::Tls(alert) => 0x100 | u64::from(alert),
        }
    }

    pub fn from_wire(code: u64) -> Self {
        match code {
            0x0 => TransportError::NoError,
            0x1 => TransportError::Internal,
            0x3 => TransportError::FlowControl,
            0x4 => TransportError::StreamId,
            0x5 => TransportError::StreamState,
            0x7 => TransportError::FrameEncoding,
            0x8 => TransportError::TransportParameter,
            0xa => TransportError::ProtocolViolation,
            0x100..=0x1ff => TransportError::Tls((code & 0xff) as u8),
            _ => TransportError::Internal,
        }
    }
}

pub type Result<T> = core::result::Result<T, TransportError>;

/// What a fatal condition records before the close is transmitted.
///
/// First one wins; later errors while closing are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: TransportError,
    /// Frame type that triggered the error, if any.
    pub frame_type: Option<u64>,
    pub reason: String,
    /// True when this is an application close (CONNECTION_CLOSE 0x1d).
    pub application: bool,
    /// Application error code, when `application` is set.
    pub app_code: u64,
}

impl CloseReason {
    pub fn transport(code: TransportError, frame_type: Option<u64>, reason: &str) -> Self {
        Self {
            code,
            frame_type,
            reason: reason.to_owned(),
            application: false,
            app_code: 0,
        }
    }

    pub fn application(app_code: u64, reason: &str) -> Self {
        Self {
            code: TransportError::NoError,
            frame_type: None,
            reason: reason.to_owned(),
            application: true,
            app_code,
        }
    }
}
