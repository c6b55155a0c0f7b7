#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(docsrs, feature(doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(doc)))]

extern crate alloc;

mod debug;

/// The DFU and DfuSe engines' error taxonomy
pub mod error;
pub use error::Error;

/// Progress and lifecycle events
pub mod event;
pub use event::{event_channel, Event, EventSink, NullEventSink};

/// The abstract USB capability this driver runs over
pub mod transport;
pub use transport::{ControlTransport, TransportError};

/// USB descriptor wire formats and the configuration walker
pub mod wire;
pub use wire::FunctionalDescriptor;

/// DfuSe memory maps, parsed from interface-name strings
pub mod memory_map;
pub use memory_map::{MemoryMap, MemorySegment};

/// The seven DFU class requests and status polling
pub mod protocol;
pub use protocol::{DfuLink, DfuState, StatusReport};

/// The plain DFU 1.1 engine
pub mod dfu;
pub use dfu::DfuEngine;

/// The DfuSe (DFU 1.1a) engine: address targeting and sector erase
pub mod dfuse;
pub use dfuse::DfuseEngine;

/// Session lifecycle: enumerate, connect, read/write, close
pub mod session;
pub use session::{CancelToken, InterfaceSelection, Session, SessionOptions};

#[cfg(feature = "std")]
pub mod mocks;
