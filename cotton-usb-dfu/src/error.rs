use crate::protocol::DfuState;
use crate::transport::TransportError;

/// Errors which can arise while driving a DFU device
///
/// Transport-level failures are carried as their
/// [`TransportError`](crate::transport::TransportError) variant rather
/// than as text, so callers (and this crate's own manifestation code)
/// can filter on the cause.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The underlying control transfer failed.
    Transport(TransportError),

    /// Operation issued before `connect`, or after `close` or an
    /// unexpected disconnect.
    NotConnected,

    /// The session's candidate list has no entry at this index.
    InterfaceNotFound(usize),

    /// A descriptor failed to parse; the payload names the field or
    /// record at fault.
    MalformedDescriptor(&'static str),

    /// A DfuSe memory-map string failed to parse.
    MalformedMemoryMap(&'static str),

    /// The device reported a non-OK status (or an unexpected state) at
    /// the named phase of the protocol.
    Protocol {
        state: DfuState,
        status: u8,
        phase: &'static str,
    },

    /// A DfuSe operation targeted an address outside the memory map.
    AddressOutOfMap(u32),

    /// A DfuSe operation was attempted but no memory map was parsed.
    NoMemoryMap,

    /// A wait (disconnect, manifestation) did not complete in time.
    Timeout(&'static str),

    /// The caller cancelled the operation; the device was aborted back
    /// towards idle.
    Cancelled,
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}
