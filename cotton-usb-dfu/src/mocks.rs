use crate::transport::{
    ControlTransport, DeviceInfo, DisconnectHook, SetupPacket,
    TransportError,
};
use alloc::vec::Vec;
use futures::Future;
use mockall::mock;

mock! {
    pub ControlTransportInner {
        pub fn is_open(&self) -> bool;

        pub fn open(
            &self,
        ) -> impl core::future::Future<Output = Result<(), TransportError>>;

        pub fn close(
            &self,
        ) -> impl core::future::Future<Output = Result<(), TransportError>>;

        pub fn select_configuration(
            &self,
            configuration: u8,
        ) -> impl core::future::Future<Output = Result<(), TransportError>>;

        pub fn claim_interface(
            &self,
            interface: u8,
        ) -> impl core::future::Future<Output = Result<(), TransportError>>;

        pub fn select_alternate(
            &self,
            interface: u8,
            alternate: u8,
        ) -> impl core::future::Future<Output = Result<(), TransportError>>;

        pub fn control_in(
            &self,
            setup: SetupPacket,
            length: u16,
        ) -> impl core::future::Future<
            Output = Result<Vec<u8>, TransportError>,
        >;

        pub fn control_out(
            &self,
            setup: SetupPacket,
            data: &[u8],
        ) -> impl core::future::Future<Output = Result<usize, TransportError>>;

        pub fn reset(
            &self,
        ) -> impl core::future::Future<Output = Result<(), TransportError>>;

        pub fn delay_ms(
            &self,
            ms: u32,
        ) -> impl core::future::Future<Output = ()>;

        pub fn on_disconnect(&self, hook: DisconnectHook);

        pub fn device_info(&self) -> DeviceInfo;
    }
}

/// A mock transport for byte-exact protocol tests
pub struct MockControlTransport {
    pub inner: MockControlTransportInner,
}

impl Default for MockControlTransport {
    fn default() -> Self {
        Self {
            inner: MockControlTransportInner::new(),
        }
    }
}

impl ControlTransport for MockControlTransport {
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn open(&self) -> impl Future<Output = Result<(), TransportError>> {
        self.inner.open()
    }

    fn close(&self) -> impl Future<Output = Result<(), TransportError>> {
        self.inner.close()
    }

    fn select_configuration(
        &self,
        configuration: u8,
    ) -> impl Future<Output = Result<(), TransportError>> {
        self.inner.select_configuration(configuration)
    }

    fn claim_interface(
        &self,
        interface: u8,
    ) -> impl Future<Output = Result<(), TransportError>> {
        self.inner.claim_interface(interface)
    }

    fn select_alternate(
        &self,
        interface: u8,
        alternate: u8,
    ) -> impl Future<Output = Result<(), TransportError>> {
        self.inner.select_alternate(interface, alternate)
    }

    fn control_in(
        &self,
        setup: SetupPacket,
        length: u16,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> {
        self.inner.control_in(setup, length)
    }

    fn control_out(
        &self,
        setup: SetupPacket,
        data: &[u8],
    ) -> impl Future<Output = Result<usize, TransportError>> {
        self.inner.control_out(setup, data)
    }

    fn reset(&self) -> impl Future<Output = Result<(), TransportError>> {
        self.inner.reset()
    }

    fn delay_ms(&self, ms: u32) -> impl Future<Output = ()> {
        self.inner.delay_ms(ms)
    }

    fn on_disconnect(&self, hook: DisconnectHook) {
        self.inner.on_disconnect(hook)
    }

    fn device_info(&self) -> DeviceInfo {
        self.inner.device_info()
    }
}
