//! The closed set of entry types.
//!
//! The numbering is part of the on-disk format of persisted buffers and must
//! never be reordered. The type is opaque to the ring buffer and the codec;
//! only the lifecycle visitor gives a handful of values control meaning.

use std::fmt;

use crate::error::{Error, Result};

macro_rules! entry_types {
    ($($name:ident = $value:literal,)*) => {
        #[allow(non_camel_case_types)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum EntryType {
            $($name = $value,)*
        }

        impl EntryType {
            /// Every known entry type, in numeric order.
            pub const ALL: &'static [EntryType] = &[$(EntryType::$name,)*];

            /// Canonical name used in text output.
            pub fn name(self) -> &'static str {
                match self {
                    $(EntryType::$name => stringify!($name),)*
                }
            }

            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(EntryType::$name),)*
                    _ => None,
                }
            }
        }
    };
}

entry_types! {
    UNKNOWN_TYPE = 0,
    UI_INPUT_START = 1,
    UI_INPUT_END = 2,
    UI_UPDATE_START = 3,
    UI_UPDATE_END = 4,
    NET_ADDED = 5,
    NET_CANCEL = 6,
    NET_CHANGEPRI = 7,
    NET_ERROR = 8,
    NET_END = 9,
    NET_RESPONSE = 10,
    NET_RETRY = 11,
    NET_START = 12,
    NET_COUNTER = 13,
    CALL_START = 14,
    CALL_END = 15,
    ASYNC_CALL = 16,
    SERV_CONN = 17,
    SERV_DISCONN = 18,
    SERV_END = 19,
    ADAPTER_NOTIFY = 20,
    MARK_FLAG = 21,
    MARK_PUSH = 22,
    MARK_POP = 23,
    LIFECYCLE_APPLICATION_START = 24,
    LIFECYCLE_APPLICATION_END = 25,
    LIFECYCLE_ACTIVITY_START = 26,
    LIFECYCLE_ACTIVITY_END = 27,
    LIFECYCLE_SERVICE_START = 28,
    LIFECYCLE_SERVICE_END = 29,
    LIFECYCLE_BROADCAST_RECEIVER_START = 30,
    LIFECYCLE_BROADCAST_RECEIVER_END = 31,
    LIFECYCLE_CONTENT_PROVIDER_START = 32,
    LIFECYCLE_CONTENT_PROVIDER_END = 33,
    LIFECYCLE_FRAGMENT_START = 34,
    LIFECYCLE_FRAGMENT_END = 35,
    LIFECYCLE_VIEW_START = 36,
    LIFECYCLE_VIEW_END = 37,
    TRACE_ABORT = 38,
    TRACE_END = 39,
    TRACE_START = 40,
    TRACE_BACKWARDS = 41,
    TRACE_TIMEOUT = 42,
    COUNTER = 43,
    STACK_FRAME = 44,
    QPL_START = 45,
    QPL_END = 46,
    QPL_CANCEL = 47,
    QPL_NOTE = 48,
    QPL_POINT = 49,
    QPL_EVENT = 50,
    TRACE_ANNOTATION = 51,
    WAIT_START = 52,
    WAIT_END = 53,
    WAIT_SIGNAL = 54,
    STRING_KEY = 55,
    STRING_VALUE = 56,
    QPL_TAG = 57,
    QPL_ANNOTATION = 58,
    TRACE_THREAD_NAME = 59,
    TRACE_PRE_END = 60,
    TRACE_THREAD_PRI = 61,
    MINOR_FAULT = 62,
    MAJOR_FAULT = 63,
    PERFEVENTS_LOST = 64,
    CLASS_LOAD = 65,
    JAVASCRIPT_STACK_FRAME = 66,
    MESSAGE_START = 67,
    MESSAGE_END = 68,
    CLASS_VALUE = 69,
    HTTP2_REQUEST_INITIATED = 70,
    HTTP2_FRAME_HEADER = 71,
    HTTP2_WINDOW_UPDATE = 72,
    HTTP2_PRIORITY = 73,
    HTTP2_EGRESS_FRAME_HEADER = 74,
    PROCESS_LIST = 75,
    IO_START = 76,
    IO_END = 77,
    CPU_COUNTER = 78,
    CLASS_LOAD_START = 79,
    CLASS_LOAD_END = 80,
    CLASS_LOAD_FAILED = 81,
    STRING_NAME = 82,
    JAVA_FRAME_NAME = 83,
    BINDER_START = 84,
    BINDER_END = 85,
    MEMORY_ALLOCATION = 86,
    STKERR_EMPTYSTACK = 87,
    STKERR_STACKOVERFLOW = 88,
    STKERR_NOSTACKFORTHREAD = 89,
    STKERR_SIGNALINTERRUPT = 90,
    STKERR_NESTEDUNWIND = 91,
    MAPPING = 92,
    LOGGER_PRIORITY = 93,
    LOST_RECORDS = 94,
}

impl EntryType {
    /// Types that drive the trace lifecycle state machine.
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            EntryType::TRACE_START
                | EntryType::TRACE_BACKWARDS
                | EntryType::TRACE_END
                | EntryType::TRACE_ABORT
                | EntryType::TRACE_TIMEOUT
                | EntryType::LOGGER_PRIORITY
        )
    }
}

impl Default for EntryType {
    fn default() -> Self {
        EntryType::UNKNOWN_TYPE
    }
}

impl TryFrom<u8> for EntryType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        EntryType::from_u8(value).ok_or(Error::UnknownEntryType(value))
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbering_is_dense() {
        for (idx, kind) in EntryType::ALL.iter().enumerate() {
            assert_eq!(*kind as u8 as usize, idx);
            assert_eq!(EntryType::from_u8(idx as u8), Some(*kind));
        }
    }

    #[test]
    fn test_lifecycle_values() {
        assert_eq!(EntryType::TRACE_ABORT as u8, 38);
        assert_eq!(EntryType::TRACE_END as u8, 39);
        assert_eq!(EntryType::TRACE_START as u8, 40);
        assert_eq!(EntryType::TRACE_BACKWARDS as u8, 41);
        assert_eq!(EntryType::TRACE_TIMEOUT as u8, 42);
        assert_eq!(EntryType::STRING_KEY.name(), "STRING_KEY");
    }

    #[test]
    fn test_unknown_value() {
        let last = *EntryType::ALL.last().unwrap() as u8;
        assert!(matches!(
            EntryType::try_from(last + 1),
            Err(Error::UnknownEntryType(v)) if v == last + 1
        ));
    }
}
