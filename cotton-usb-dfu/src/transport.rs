use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::future::Future;

/// Errors reported by a [`ControlTransport`] implementation
///
/// The engine never inspects message text; "the device has gone away"
/// is recognised purely from the variant, which matters during
/// manifestation and reset (non-manifestation-tolerant devices drop off
/// the bus as a matter of course).
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// The device disconnected (or was never connected).
    Disconnected,

    /// The operating system reports the device as unavailable.
    DeviceUnavailable,

    /// The platform cannot reset this device.
    ResetUnsupported,

    /// The endpoint stalled the request.
    Stall,

    /// The transfer timed out.
    Timeout,

    /// Permission to access the device was denied.
    Access,

    /// Any other transport failure.
    Other,
}

impl TransportError {
    /// True for the errors which mean "the device has already gone",
    /// which are expected — and suppressed — during manifestation and
    /// reset.
    pub fn is_device_gone(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected
                | TransportError::DeviceUnavailable
                | TransportError::ResetUnsupported
        )
    }
}

/// The type of a control request (USB 2.0 table 9-2, bits 6..5)
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
}

/// The recipient of a control request (USB 2.0 table 9-2, bits 4..0)
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
}

/// A control request, minus its direction and data phase
///
/// The direction is implied by calling
/// [`ControlTransport::control_in`] or
/// [`ControlTransport::control_out`]; the transport composes the actual
/// bmRequestType byte.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// One alternate setting of one interface, as reported by the transport
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, PartialEq, Eq)]
pub struct AlternateInfo {
    pub alternate_setting: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// iInterface string-descriptor index (0 = none)
    pub name_index: u8,
    /// The interface-name string, if the platform already knows it
    pub name: Option<String>,
}

/// One interface of one configuration, as reported by the transport
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub interface_number: u8,
    pub alternates: Vec<AlternateInfo>,
}

/// One configuration, as reported by the transport
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigurationInfo {
    pub configuration_value: u8,
    pub interfaces: Vec<InterfaceInfo>,
}

/// Identity of the device behind a [`ControlTransport`]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    pub configurations: Vec<ConfigurationInfo>,
}

/// Callback invoked when the transport observes a disconnect
pub type DisconnectHook = Box<dyn FnMut(Option<TransportError>)>;

/// The USB capability this driver requires of its host
///
/// Implementations wrap whatever host stack is to hand (libusb, nusb,
/// WebUSB, an embedded host controller) and expose control transfers,
/// the open/claim ritual, reset, and a cooperative sleep. Everything
/// here is a suspension point: the driver issues exactly one operation
/// at a time and waits for it.
///
/// `delay_ms` belongs on the same capability because the DFU status
/// poll loop *is* device I/O pacing: the device publishes how long the
/// host must wait before the next GET_STATUS, and honouring it is part
/// of the protocol, not an implementation nicety.
pub trait ControlTransport {
    fn is_open(&self) -> bool;

    fn open(&self) -> impl Future<Output = Result<(), TransportError>>;

    fn close(&self) -> impl Future<Output = Result<(), TransportError>>;

    fn select_configuration(
        &self,
        configuration: u8,
    ) -> impl Future<Output = Result<(), TransportError>>;

    fn claim_interface(
        &self,
        interface: u8,
    ) -> impl Future<Output = Result<(), TransportError>>;

    fn select_alternate(
        &self,
        interface: u8,
        alternate: u8,
    ) -> impl Future<Output = Result<(), TransportError>>;

    /// Issue an IN control transfer, returning up to `length` bytes
    fn control_in(
        &self,
        setup: SetupPacket,
        length: u16,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>>;

    /// Issue an OUT control transfer, returning the bytes written
    fn control_out(
        &self,
        setup: SetupPacket,
        data: &[u8],
    ) -> impl Future<Output = Result<usize, TransportError>>;

    /// Reset the device at USB level
    fn reset(&self) -> impl Future<Output = Result<(), TransportError>>;

    /// Suspend cooperatively for at least `ms` milliseconds
    fn delay_ms(&self, ms: u32) -> impl Future<Output = ()>;

    /// Register a callback for transport-originated disconnects
    fn on_disconnect(&self, hook: DisconnectHook);

    /// Identity and configuration tree of the device
    fn device_info(&self) -> DeviceInfo;
}
