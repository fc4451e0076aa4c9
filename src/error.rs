//! Error types for the SDK, split along the boundaries callers care about:
//!
//! | Type | Raised by | Recoverable? |
//! |---|---|---|
//! | [`ProtocolError`] | message codec, chunker | no — indicates a version mismatch or corrupted stream |
//! | [`StateError`] | connection / scanner state machines | yes — redundant requests return these instead of panicking |
//! | [`HapticError`] | vibration encoders | yes — raised before any byte is produced |
//! | [`TransportError`] | concrete transports | opaque to the core |
//! | [`DeviceError`] | the public `Device` / `Scanner` API | umbrella over all of the above |

use thiserror::Error;

/// Wire-protocol failures. Always fatal to the parse or send operation that
/// raised them; the caller decides whether to drop the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A message-type name (encode side) or wire index (decode side) with no
    /// entry in the message registry.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// A declared payload length would read past the end of the buffer.
    #[error("malformed message: declared payload length {declared} exceeds the {remaining} remaining bytes")]
    MalformedMessage { declared: usize, remaining: usize },

    /// A single encoded message cannot fit in one transport write. There is
    /// no mid-message fragmentation; the message must shrink or the MTU grow.
    #[error("encoded message of {len} bytes exceeds the {max}-byte per-write limit")]
    MessageTooLarge { len: usize, max: usize },
}

/// State-machine violations. Operations that would skip a transition return
/// one of these rather than panicking, because UI-driven callers routinely
/// race redundant requests against async confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("already connected or a connect is in progress")]
    AlreadyConnected,
    #[error("not connected, or a disconnect is already in progress")]
    AlreadyDisconnected,
    #[error("this transport does not support reconnecting")]
    ReconnectUnsupported,
    #[error("scanning is not available on this transport")]
    NotAvailable,
    #[error("a scan session is already running")]
    AlreadyScanning,
    #[error("no scan session is running")]
    NotScanning,
    #[error("device id is not in the discovery registry")]
    UnknownDeviceId,
}

/// Vibration-command validation failures. Checked up front so a rejected
/// request never partially encodes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HapticError {
    #[error("{got} segments given, but between 1 and {max} are allowed")]
    TooManySegments { got: usize, max: usize },
    #[error("unknown vibration effect {0:?}")]
    InvalidEffectName(String),
    #[error("delay of {0} ms is outside 0–1270")]
    DelayOutOfRange(u16),
    #[error("loop count {got} exceeds the maximum of {max}")]
    LoopCountOutOfRange { got: u8, max: u8 },
    #[error("amplitude {0} is outside 0.0–1.0")]
    AmplitudeOutOfRange(f64),
    #[error("duration of {0} ms is outside 1–2550")]
    DurationOutOfRange(u16),
    #[error("at least one vibration location is required")]
    EmptyLocationSet,
}

/// Failures reported by a concrete transport. The core never inspects these
/// beyond logging; liveness checking handles silently dropped links.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport backend error: {0}")]
    Backend(String),
    #[error("transport is not open")]
    NotOpen,
}

/// Umbrella error returned by the public `Device`, `ConnectionManager` and
/// `Scanner` APIs.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Haptic(#[from] HapticError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DeviceError {
    /// `true` when the failure is a redundant state-machine request that the
    /// caller can safely ignore (e.g. a second `connect()` while connecting).
    pub fn is_state_error(&self) -> bool {
        matches!(self, DeviceError::State(_))
    }
}
