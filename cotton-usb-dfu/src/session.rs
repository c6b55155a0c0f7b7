use crate::dfu::DfuEngine;
use crate::dfuse::DfuseEngine;
use crate::error::Error;
use crate::event::{Event, EventSink, NullEventSink};
use crate::memory_map::MemoryMap;
use crate::protocol::DfuLink;
use crate::transport::{
    ControlTransport, Recipient, RequestType, SetupPacket, TransportError,
};
use crate::wire;
use crate::wire::FunctionalDescriptor;
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::Cell;

/// One DFU-capable alternate setting of the device
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, PartialEq, Eq)]
pub struct InterfaceSelection {
    pub configuration_value: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_name: Option<String>,
}

/// Session behaviour switches
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Some platforms (notably WebUSB) don't hand out interface-name
    /// strings; with this set, empty names are re-fetched from the
    /// device's string descriptors before an interface is opened.
    pub force_interfaces_name: bool,
}

/// Handle for cancelling an in-flight read or write
///
/// Cancellation is cooperative: the engine notices at its next chunk
/// or sector boundary, aborts the device back towards idle, and the
/// operation returns [`Error::Cancelled`]. Cancelling during a
/// manifestation wait does nothing — the device is already committing.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Rc<Cell<bool>>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.get()
    }

    pub(crate) fn rearm(&self) {
        self.flag.set(false);
    }
}

#[derive(Copy, Clone)]
enum LinkState {
    Up,
    Lost(Option<TransportError>),
}

enum Engine {
    Plain,
    DfuSe {
        map: MemoryMap,
        start_address: Option<u32>,
    },
}

struct Connection {
    selection: InterfaceSelection,
    functional: FunctionalDescriptor,
    engine: Engine,
}

const LANGID_ENGLISH_US: u16 = 0x0409;

/// How often `wait_disconnected` re-checks the link
const DISCONNECT_POLL_MS: u32 = 100;

/// A firmware-upgrade session with one USB device
///
/// Lifecycle: [`init`](Session::init) enumerates the DFU-capable
/// alternate settings, [`connect`](Session::connect) opens one and
/// picks an engine (plain DFU 1.1, or DfuSe when the functional
/// descriptor says 0x011A and the interface protocol is 0x02), then
/// [`read`](Session::read) and [`write`](Session::write) move
/// firmware. The session owns the interface claim until
/// [`close`](Session::close).
///
/// Exactly one operation may be in flight at a time; the `&mut self`
/// receivers enforce that for safe callers.
pub struct Session<T: ControlTransport, E: EventSink = NullEventSink> {
    transport: T,
    options: SessionOptions,
    events: E,
    interfaces: Vec<InterfaceSelection>,
    connection: Option<Connection>,
    closed: bool,
    cancel: CancelToken,
    link_state: Rc<Cell<LinkState>>,
    hook_registered: bool,
    disconnect_announced: bool,
}

impl<T: ControlTransport> Session<T, NullEventSink> {
    pub fn new(transport: T) -> Self {
        Self::with_events(transport, SessionOptions::default(), NullEventSink)
    }

    pub fn with_options(transport: T, options: SessionOptions) -> Self {
        Self::with_events(transport, options, NullEventSink)
    }
}

impl<T: ControlTransport, E: EventSink> Session<T, E> {
    pub fn with_events(
        transport: T,
        options: SessionOptions,
        events: E,
    ) -> Self {
        Self {
            transport,
            options,
            events,
            interfaces: Vec::new(),
            connection: None,
            closed: false,
            cancel: CancelToken::default(),
            link_state: Rc::new(Cell::new(LinkState::Up)),
            hook_registered: false,
            disconnect_announced: false,
        }
    }

    /// Populate the candidate-interface list from the device's
    /// configuration tree
    pub fn init(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        let info = self.transport.device_info();
        self.interfaces.clear();
        for configuration in &info.configurations {
            for interface in &configuration.interfaces {
                for alternate in &interface.alternates {
                    if wire::is_dfu_interface(
                        alternate.class,
                        alternate.sub_class,
                        alternate.protocol,
                    ) {
                        self.interfaces.push(InterfaceSelection {
                            configuration_value: configuration
                                .configuration_value,
                            interface_number: interface.interface_number,
                            alternate_setting: alternate.alternate_setting,
                            interface_name: alternate.name.clone(),
                        });
                    }
                }
            }
        }
        self.events.on_event(Event::Init {
            interfaces: self.interfaces.len(),
        });
        Ok(())
    }

    /// The DFU-capable alternate settings found by `init`
    pub fn interfaces(&self) -> &[InterfaceSelection] {
        &self.interfaces
    }

    /// Open candidate `index` and choose its engine
    pub async fn connect(&mut self, index: usize) -> Result<(), Error> {
        let result = self.connect_inner(index).await;
        match &result {
            Ok(()) => self.events.on_event(Event::Connect),
            Err(error) => {
                self.events.on_event(Event::Error { error: *error })
            }
        }
        result
    }

    async fn connect_inner(&mut self, index: usize) -> Result<(), Error> {
        self.check_link()?;
        if index >= self.interfaces.len() {
            return Err(Error::InterfaceNotFound(index));
        }

        if !self.transport.is_open() {
            self.transport.open().await?;
        }
        if !self.hook_registered {
            let state = Rc::clone(&self.link_state);
            self.transport.on_disconnect(Box::new(move |cause| {
                state.set(LinkState::Lost(cause));
            }));
            self.hook_registered = true;
        }

        if self.options.force_interfaces_name
            && self
                .interfaces
                .iter()
                .any(|i| i.interface_name.as_deref().unwrap_or("").is_empty())
        {
            self.recover_interface_names().await?;
        }

        let selection = self.interfaces[index].clone();
        let protocol = self.alternate_protocol(&selection)?;
        let functional =
            self.functional_for(selection.configuration_value).await?;

        self.transport
            .select_configuration(selection.configuration_value)
            .await?;
        self.transport
            .claim_interface(selection.interface_number)
            .await?;
        self.transport
            .select_alternate(
                selection.interface_number,
                selection.alternate_setting,
            )
            .await?;

        let engine = if functional.is_dfuse()
            && protocol == wire::DFU_PROTOCOL_DFU_MODE
        {
            let name = selection
                .interface_name
                .as_deref()
                .ok_or(Error::MalformedMemoryMap("no interface name"))?;
            Engine::DfuSe {
                map: MemoryMap::parse(name)?,
                start_address: None,
            }
        } else {
            Engine::Plain
        };

        self.connection = Some(Connection {
            selection,
            functional,
            engine,
        });
        Ok(())
    }

    fn alternate_protocol(
        &self,
        selection: &InterfaceSelection,
    ) -> Result<u8, Error> {
        let info = self.transport.device_info();
        info.configurations
            .iter()
            .find(|c| c.configuration_value == selection.configuration_value)
            .and_then(|c| {
                c.interfaces.iter().find(|i| {
                    i.interface_number == selection.interface_number
                })
            })
            .and_then(|i| {
                i.alternates.iter().find(|a| {
                    a.alternate_setting == selection.alternate_setting
                })
            })
            .map(|a| a.protocol)
            .ok_or(Error::MalformedDescriptor("alternate setting"))
    }

    /// The first DFU functional descriptor of the configuration with
    /// this bConfigurationValue
    async fn functional_for(
        &self,
        configuration_value: u8,
    ) -> Result<FunctionalDescriptor, Error> {
        let count = self.transport.device_info().configurations.len();
        for index in 0..count {
            let raw = self.read_configuration_descriptor(index as u8).await?;
            let parsed = wire::parse_configuration(&raw)?;
            if parsed.descriptor.bConfigurationValue == configuration_value {
                return parsed
                    .functional
                    .first()
                    .copied()
                    .ok_or(Error::MalformedDescriptor(
                        "no functional descriptor",
                    ));
            }
        }
        Err(Error::MalformedDescriptor("no matching configuration"))
    }

    async fn read_configuration_descriptor(
        &self,
        index: u8,
    ) -> Result<Vec<u8>, Error> {
        let setup = SetupPacket {
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: wire::GET_DESCRIPTOR,
            value: u16::from(wire::CONFIGURATION_DESCRIPTOR) << 8
                | u16::from(index),
            index: 0,
        };
        let header = self.transport.control_in(setup, 9).await?;
        if header.len() < 9 {
            return Err(Error::MalformedDescriptor("configuration header"));
        }
        let total =
            u16::from_le_bytes([header[2], header[3]]).max(9);
        Ok(self.transport.control_in(setup, total).await?)
    }

    async fn read_string_descriptor(
        &self,
        string_index: u8,
        lang_id: u16,
    ) -> Result<Vec<u8>, Error> {
        let setup = SetupPacket {
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: wire::GET_DESCRIPTOR,
            value: u16::from(wire::STRING_DESCRIPTOR) << 8
                | u16::from(string_index),
            index: lang_id,
        };
        let first = self.transport.control_in(setup, 1).await?;
        if first.is_empty() {
            return Err(Error::MalformedDescriptor("string"));
        }
        let full =
            self.transport.control_in(setup, u16::from(first[0])).await?;
        if full.len() < 2 {
            return Err(Error::MalformedDescriptor("string"));
        }
        Ok(full)
    }

    /// The device's supported string-descriptor language IDs
    pub async fn language_ids(&self) -> Result<Vec<u16>, Error> {
        let raw = self.read_string_descriptor(0, 0).await?;
        Ok(raw[2..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    async fn read_string(&self, index: u8) -> Result<String, Error> {
        let raw =
            self.read_string_descriptor(index, LANGID_ENGLISH_US).await?;
        let units: Vec<u16> = raw[2..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    /// Re-fetch missing interface-name strings from the device
    ///
    /// Walks every configuration descriptor for the iInterface indices,
    /// fetches each distinct non-zero string once, and back-fills the
    /// candidates whose names were empty.
    async fn recover_interface_names(&mut self) -> Result<(), Error> {
        self.transport.select_configuration(1).await?;

        // (configuration value, interface, alternate) -> string index
        let count = self.transport.device_info().configurations.len();
        let mut indices: Vec<(u8, u8, u8, u8)> = Vec::new();
        for index in 0..count {
            let raw = self.read_configuration_descriptor(index as u8).await?;
            let parsed = wire::parse_configuration(&raw)?;
            for interface in &parsed.interfaces {
                indices.push((
                    parsed.descriptor.bConfigurationValue,
                    interface.descriptor.bInterfaceNumber,
                    interface.descriptor.bAlternateSetting,
                    interface.descriptor.iInterface,
                ));
            }
        }

        let mut strings: Vec<(u8, String)> = Vec::new();
        for &(_, _, _, string_index) in &indices {
            if string_index != 0
                && !strings.iter().any(|(i, _)| *i == string_index)
            {
                let s = self.read_string(string_index).await?;
                strings.push((string_index, s));
            }
        }

        for selection in &mut self.interfaces {
            if !selection
                .interface_name
                .as_deref()
                .unwrap_or("")
                .is_empty()
            {
                continue;
            }
            let found = indices.iter().find(|(c, i, a, _)| {
                *c == selection.configuration_value
                    && *i == selection.interface_number
                    && *a == selection.alternate_setting
            });
            if let Some(&(_, _, _, string_index)) = found {
                if let Some((_, s)) =
                    strings.iter().find(|(i, _)| *i == string_index)
                {
                    selection.interface_name = Some(s.clone());
                }
            }
        }
        Ok(())
    }

    /// Read the device's firmware image
    ///
    /// At most `max_size` bytes; `None` reads until the device sends a
    /// short block (bounded, for DfuSe, by the contiguous readable run
    /// from the start address).
    pub async fn read(
        &mut self,
        max_size: Option<usize>,
    ) -> Result<Vec<u8>, Error> {
        let result = self.read_inner(max_size).await;
        if let Err(error) = &result {
            self.events.on_event(Event::Error { error: *error });
        }
        result
    }

    async fn read_inner(
        &mut self,
        max_size: Option<usize>,
    ) -> Result<Vec<u8>, Error> {
        self.check_link()?;
        let connection =
            self.connection.as_ref().ok_or(Error::NotConnected)?;
        let xfer_size = connection.functional.transfer_size;
        if xfer_size == 0 {
            return Err(Error::MalformedDescriptor("wTransferSize"));
        }
        self.cancel.rearm();
        let link = DfuLink::new(
            &self.transport,
            u16::from(connection.selection.interface_number),
        );
        let engine = DfuEngine::new(
            link,
            connection.functional,
            self.cancel.clone(),
        );
        match &connection.engine {
            Engine::Plain => {
                engine.read(xfer_size, max_size, &mut self.events).await
            }
            Engine::DfuSe {
                map,
                start_address,
            } => {
                let start =
                    start_address.unwrap_or_else(|| map.segments[0].start);
                let bounded = max_size.or_else(|| {
                    // An unreadable start bounds the read to nothing
                    Some(map.max_readable_from(start) as usize)
                });
                DfuseEngine::new(engine, map, *start_address)
                    .read(xfer_size, bounded, &mut self.events)
                    .await
            }
        }
    }

    /// Write a firmware image to the device
    pub async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let result = self.write_inner(data).await;
        if let Err(error) = &result {
            self.events.on_event(Event::Error { error: *error });
        }
        result
    }

    async fn write_inner(&mut self, data: &[u8]) -> Result<(), Error> {
        self.check_link()?;
        let connection =
            self.connection.as_ref().ok_or(Error::NotConnected)?;
        let xfer_size = connection.functional.transfer_size;
        if xfer_size == 0 {
            return Err(Error::MalformedDescriptor("wTransferSize"));
        }
        self.cancel.rearm();
        let link = DfuLink::new(
            &self.transport,
            u16::from(connection.selection.interface_number),
        );
        let engine = DfuEngine::new(
            link,
            connection.functional,
            self.cancel.clone(),
        );
        match &connection.engine {
            Engine::Plain => {
                engine.write(xfer_size, data, &mut self.events).await
            }
            Engine::DfuSe {
                map,
                start_address,
            } => {
                DfuseEngine::new(engine, map, *start_address)
                    .write(xfer_size, data, &mut self.events)
                    .await
            }
        }
    }

    /// Ask a runtime-mode device to drop into its bootloader
    ///
    /// Devices which don't detach by themselves get a USB reset to
    /// finish the job. Either way the device is expected to disappear;
    /// pair this with [`wait_disconnected`](Session::wait_disconnected).
    pub async fn detach(&mut self) -> Result<(), Error> {
        self.check_link()?;
        let connection =
            self.connection.as_ref().ok_or(Error::NotConnected)?;
        let link = DfuLink::new(
            &self.transport,
            u16::from(connection.selection.interface_number),
        );
        link.detach(connection.functional.detach_timeout_ms).await?;
        if !connection.functional.will_detach {
            self.reset().await?;
        }
        Ok(())
    }

    /// Reset the device, treating "already gone" as success
    ///
    /// This is the post-write reset for DfuSe devices, which the engine
    /// deliberately leaves to the caller.
    pub async fn reset(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        match self.transport.reset().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_device_gone() => Ok(()),
            Err(e) => Err(Error::Transport(e)),
        }
    }

    /// Wait for the device to leave the bus
    ///
    /// `timeout_ms == 0` waits indefinitely.
    pub async fn wait_disconnected(
        &mut self,
        timeout_ms: u32,
    ) -> Result<(), Error> {
        let mut waited: u32 = 0;
        loop {
            if let LinkState::Lost(cause) = self.link_state.get() {
                self.note_disconnect(cause);
                return Ok(());
            }
            if timeout_ms != 0 && waited >= timeout_ms {
                return Err(Error::Timeout("disconnect"));
            }
            self.transport.delay_ms(DISCONNECT_POLL_MS).await;
            waited = waited.saturating_add(DISCONNECT_POLL_MS);
        }
    }

    /// A token for cancelling this session's in-flight operation
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Set where the next DfuSe read or write starts
    pub fn set_start_address(&mut self, address: u32) -> Result<(), Error> {
        match self.connection.as_mut() {
            None => Err(Error::NotConnected),
            Some(Connection {
                engine: Engine::DfuSe { start_address, .. },
                ..
            }) => {
                *start_address = Some(address);
                Ok(())
            }
            Some(_) => Err(Error::NoMemoryMap),
        }
    }

    pub fn start_address(&self) -> Option<u32> {
        match self.connection.as_ref()?.engine {
            Engine::DfuSe { start_address, .. } => start_address,
            Engine::Plain => None,
        }
    }

    /// The connected interface's memory map (DfuSe only)
    pub fn memory_map(&self) -> Option<&MemoryMap> {
        match &self.connection.as_ref()?.engine {
            Engine::DfuSe { map, .. } => Some(map),
            Engine::Plain => None,
        }
    }

    pub fn functional_descriptor(&self) -> Option<&FunctionalDescriptor> {
        self.connection.as_ref().map(|c| &c.functional)
    }

    pub fn selected_interface(&self) -> Option<&InterfaceSelection> {
        self.connection.as_ref().map(|c| &c.selection)
    }

    /// Release the interface and the transport
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.connection = None;
        self.closed = true;
        let result = self.transport.close().await;
        self.events.on_event(Event::Disconnect(None));
        self.disconnect_announced = true;
        result.map_err(Error::Transport)
    }

    fn note_disconnect(&mut self, cause: Option<TransportError>) {
        self.connection = None;
        if !self.disconnect_announced {
            self.events.on_event(Event::Disconnect(cause));
            self.disconnect_announced = true;
        }
    }

    fn check_link(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        if let LinkState::Lost(cause) = self.link_state.get() {
            self.note_disconnect(cause);
            return Err(Error::NotConnected);
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/session.rs"]
mod tests;
