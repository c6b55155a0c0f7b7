use crate::error::Error;
use crate::transport::TransportError;

/// Progress and lifecycle events emitted by a session's operations
///
/// Rendering is the host's business; the driver only reports.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// The candidate-interface list has been populated.
    Init { interfaces: usize },

    /// An interface was opened and an engine chosen.
    Connect,

    /// The session lost (or released) its device.
    Disconnect(Option<TransportError>),

    /// Upload progress; `total` is the caller's bound, if any.
    Progress { done: usize, total: Option<usize> },

    WriteStart,
    WriteProgress { done: usize, total: usize },
    WriteEnd { total: usize },

    EraseStart,
    EraseProgress { done: u32, total: u32 },
    EraseEnd,

    /// Terminal failure of an in-flight operation; the operation's
    /// `Err` return carries the same error.
    Error { error: Error },
}

/// Where a session delivers its events
///
/// Implemented for any `FnMut(Event)`, so a closure appending to a
/// buffer, updating a progress bar, or feeding a channel all work.
pub trait EventSink {
    fn on_event(&mut self, event: Event);
}

impl<F: FnMut(Event)> EventSink for F {
    fn on_event(&mut self, event: Event) {
        self(event)
    }
}

/// Sink that discards everything
#[derive(Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn on_event(&mut self, _event: Event) {}
}

/// An [`EventSink`] backed by an unbounded channel
///
/// For callers who would rather consume events as a
/// [`futures::Stream`](futures::stream::Stream) than supply a callback.
pub struct ChannelSink(futures::channel::mpsc::UnboundedSender<Event>);

impl EventSink for ChannelSink {
    fn on_event(&mut self, event: Event) {
        // Receiver gone means nobody is listening; that's allowed.
        let _ = self.0.unbounded_send(event);
    }
}

/// Create a sink/stream pair for event delivery
pub fn event_channel(
) -> (ChannelSink, futures::channel::mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = futures::channel::mpsc::unbounded();
    (ChannelSink(tx), rx)
}
