//! Stream Events
//!
//! The closed set of lifecycle events a stream can report, and the translation
//! between those events and the numeric codes used by the native notification
//! mechanism.
//!
//! # Design Philosophy
//!
//! The native side speaks in bit codes. A subscription is a union of bits, a
//! delivery is exactly one bit. Everything above the bridge speaks
//! [`EventType`]; codes the translation does not recognize never travel further
//! than the bridge.
//!
//! ```text
//!   EventType ──to_native()──▶ NativeEvent ──(bits)──▶ EventFlags
//!       ▲                           │
//!       └───────from_native()───────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Native Codes
// ============================================================================

/// A single event code as delivered by the native notification mechanism
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeEvent(pub u64);

impl NativeEvent {
    /// No event
    pub const NONE: Self = Self(0);
    /// The stream finished opening
    pub const OPEN_COMPLETED: Self = Self(1);
    /// Bytes can be read without blocking
    pub const HAS_BYTES_AVAILABLE: Self = Self(2);
    /// Bytes can be written without blocking
    pub const CAN_ACCEPT_BYTES: Self = Self(4);
    /// The stream hit an error
    pub const ERROR_OCCURRED: Self = Self(8);
    /// The stream reached its end
    pub const END_ENCOUNTERED: Self = Self(16);

    /// Raw numeric code
    #[must_use]
    pub fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NativeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native-event({:#x})", self.0)
    }
}

bitflags::bitflags! {
    /// Set of native event codes a stream is subscribed to.
    ///
    /// Bit values match [`NativeEvent`] one to one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u64 {
        /// See [`NativeEvent::OPEN_COMPLETED`]
        const OPEN_COMPLETED = 1;
        /// See [`NativeEvent::HAS_BYTES_AVAILABLE`]
        const HAS_BYTES_AVAILABLE = 1 << 1;
        /// See [`NativeEvent::CAN_ACCEPT_BYTES`]
        const CAN_ACCEPT_BYTES = 1 << 2;
        /// See [`NativeEvent::ERROR_OCCURRED`]
        const ERROR_OCCURRED = 1 << 3;
        /// See [`NativeEvent::END_ENCOUNTERED`]
        const END_ENCOUNTERED = 1 << 4;
    }
}

impl EventFlags {
    /// Whether a native event code is part of this set
    #[must_use]
    pub fn includes(self, event: NativeEvent) -> bool {
        event.0 != 0 && self.bits() & event.0 == event.0
    }

    /// The recognized event types in this set, in declaration order
    pub fn event_types(self) -> impl Iterator<Item = EventType> {
        EventType::ALL
            .into_iter()
            .filter(move |event| self.contains(event.flag()))
    }
}

// ============================================================================
// Event Type
// ============================================================================

/// Lifecycle event of a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    /// The stream finished opening
    Opened,
    /// Bytes are available to read
    Readable,
    /// The stream can accept bytes again
    Writable,
    /// The stream reported an error
    ErrorOccurred,
    /// The stream reached its end
    EndOfStream,
}

impl EventType {
    /// Every event type, in declaration order
    pub const ALL: [EventType; 5] = [
        EventType::Opened,
        EventType::Readable,
        EventType::Writable,
        EventType::ErrorOccurred,
        EventType::EndOfStream,
    ];

    /// Translate a native code into an event type.
    ///
    /// Returns `None` for unknown codes and for codes carrying more than one
    /// bit; a delivery is always a single event.
    #[must_use]
    pub fn from_native(event: NativeEvent) -> Option<Self> {
        match event {
            NativeEvent::OPEN_COMPLETED => Some(Self::Opened),
            NativeEvent::HAS_BYTES_AVAILABLE => Some(Self::Readable),
            NativeEvent::CAN_ACCEPT_BYTES => Some(Self::Writable),
            NativeEvent::ERROR_OCCURRED => Some(Self::ErrorOccurred),
            NativeEvent::END_ENCOUNTERED => Some(Self::EndOfStream),
            _ => None,
        }
    }

    /// Translate this event type into its native code
    #[must_use]
    pub fn to_native(self) -> NativeEvent {
        match self {
            Self::Opened => NativeEvent::OPEN_COMPLETED,
            Self::Readable => NativeEvent::HAS_BYTES_AVAILABLE,
            Self::Writable => NativeEvent::CAN_ACCEPT_BYTES,
            Self::ErrorOccurred => NativeEvent::ERROR_OCCURRED,
            Self::EndOfStream => NativeEvent::END_ENCOUNTERED,
        }
    }

    /// The subscription flag for this event type
    #[must_use]
    pub fn flag(self) -> EventFlags {
        EventFlags::from_bits_retain(self.to_native().bits())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opened => "opened",
            Self::Readable => "readable",
            Self::Writable => "writable",
            Self::ErrorOccurred => "error",
            Self::EndOfStream => "end-of-stream",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation_round_trip() {
        for event in EventType::ALL {
            assert_eq!(EventType::from_native(event.to_native()), Some(event));
        }
    }

    #[test]
    fn test_native_codes_are_distinct_single_bits() {
        let mut seen = EventFlags::empty();
        for event in EventType::ALL {
            let code = event.to_native().bits();
            assert_eq!(code.count_ones(), 1, "{event} should map to one bit");
            assert!(!seen.contains(event.flag()));
            seen |= event.flag();
        }
        assert_eq!(seen, EventFlags::all());
    }

    #[test]
    fn test_unknown_codes_do_not_translate() {
        assert_eq!(EventType::from_native(NativeEvent::NONE), None);
        assert_eq!(EventType::from_native(NativeEvent(32)), None);
        assert_eq!(EventType::from_native(NativeEvent(2 | 4)), None);
    }

    #[test]
    fn test_flags_event_types() {
        let flags = EventType::Readable.flag() | EventType::EndOfStream.flag();
        let types: Vec<_> = flags.event_types().collect();
        assert_eq!(types, vec![EventType::Readable, EventType::EndOfStream]);
        assert!(flags.includes(NativeEvent::END_ENCOUNTERED));
        assert!(!flags.includes(NativeEvent::CAN_ACCEPT_BYTES));
        assert!(!flags.includes(NativeEvent::NONE));
    }
}
