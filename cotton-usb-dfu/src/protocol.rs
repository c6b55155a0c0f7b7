use crate::error::Error;
use crate::transport::{
    ControlTransport, Recipient, RequestType, SetupPacket,
};
use alloc::vec::Vec;

// DFU class request numbers (DFU 1.1 section 3)
pub const DFU_DETACH: u8 = 0;
pub const DFU_DNLOAD: u8 = 1;
pub const DFU_UPLOAD: u8 = 2;
pub const DFU_GETSTATUS: u8 = 3;
pub const DFU_CLRSTATUS: u8 = 4;
pub const DFU_GETSTATE: u8 = 5;
pub const DFU_ABORT: u8 = 6;

/// bStatus value meaning "no error condition is present"
pub const STATUS_OK: u8 = 0;

/// The DFU interface state machine (DFU 1.1 appendix A)
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    Idle,
    DownloadSync,
    DownloadBusy,
    DownloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    /// A state code this driver does not know about
    Other(u8),
}

impl From<u8> for DfuState {
    fn from(value: u8) -> Self {
        match value {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::Idle,
            3 => DfuState::DownloadSync,
            4 => DfuState::DownloadBusy,
            5 => DfuState::DownloadIdle,
            6 => DfuState::ManifestSync,
            7 => DfuState::Manifest,
            8 => DfuState::ManifestWaitReset,
            9 => DfuState::UploadIdle,
            10 => DfuState::Error,
            other => DfuState::Other(other),
        }
    }
}

/// One decoded GET_STATUS reply
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: u8,
    /// How long the host must wait before the next GET_STATUS.
    /// 24 bits on the wire; larger values do not exist.
    pub poll_timeout_ms: u32,
    pub state: DfuState,
}

impl StatusReport {
    /// Decode the 6-byte GET_STATUS reply
    ///
    /// Byte 5 (iString) is ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 6 {
            return Err(Error::MalformedDescriptor("status report"));
        }
        Ok(Self {
            status: bytes[0],
            poll_timeout_ms: u32::from(bytes[1])
                | u32::from(bytes[2]) << 8
                | u32::from(bytes[3]) << 16,
            state: DfuState::from(bytes[4]),
        })
    }
}

/// The seven DFU class requests, as operations over a transport
///
/// Both engines share this one record; everything is a class request
/// directed at the claimed interface.
pub struct DfuLink<'a, T: ControlTransport> {
    transport: &'a T,
    interface: u16,
}

impl<'a, T: ControlTransport> DfuLink<'a, T> {
    pub fn new(transport: &'a T, interface: u16) -> Self {
        Self {
            transport,
            interface,
        }
    }

    pub fn transport(&self) -> &'a T {
        self.transport
    }

    fn setup(&self, request: u8, value: u16) -> SetupPacket {
        SetupPacket {
            request_type: RequestType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: self.interface,
        }
    }

    /// DFU_DETACH: ask a runtime-mode device to enter its bootloader
    pub async fn detach(&self, timeout_ms: u16) -> Result<(), Error> {
        self.transport
            .control_out(self.setup(DFU_DETACH, timeout_ms), &[])
            .await?;
        Ok(())
    }

    /// DFU_DNLOAD: send one block (or a DfuSe command) to the device
    pub async fn write_block(
        &self,
        block: u16,
        data: &[u8],
    ) -> Result<usize, Error> {
        Ok(self
            .transport
            .control_out(self.setup(DFU_DNLOAD, block), data)
            .await?)
    }

    /// DFU_UPLOAD: read back one block of up to `length` bytes
    pub async fn read_block(
        &self,
        block: u16,
        length: u16,
    ) -> Result<Vec<u8>, Error> {
        Ok(self
            .transport
            .control_in(self.setup(DFU_UPLOAD, block), length)
            .await?)
    }

    pub async fn get_status(&self) -> Result<StatusReport, Error> {
        let reply = self
            .transport
            .control_in(self.setup(DFU_GETSTATUS, 0), 6)
            .await?;
        StatusReport::parse(&reply)
    }

    pub async fn clear_status(&self) -> Result<(), Error> {
        self.transport
            .control_out(self.setup(DFU_CLRSTATUS, 0), &[])
            .await?;
        Ok(())
    }

    pub async fn get_state(&self) -> Result<DfuState, Error> {
        let reply = self
            .transport
            .control_in(self.setup(DFU_GETSTATE, 0), 1)
            .await?;
        if reply.is_empty() {
            return Err(Error::MalformedDescriptor("state report"));
        }
        Ok(DfuState::from(reply[0]))
    }

    pub async fn abort(&self) -> Result<(), Error> {
        self.transport
            .control_out(self.setup(DFU_ABORT, 0), &[])
            .await?;
        Ok(())
    }

    /// Poll GET_STATUS until `predicate` accepts the state (or the
    /// device lands in dfuERROR, which terminates any wait)
    ///
    /// Between polls the device's own bwPollTimeout is honoured with a
    /// cooperative sleep; the device paces the host, and there is no
    /// iteration limit. The last report's timeout is not slept.
    pub async fn poll_until(
        &self,
        predicate: impl Fn(DfuState) -> bool,
    ) -> Result<StatusReport, Error> {
        let mut report = self.get_status().await?;
        while !predicate(report.state) && report.state != DfuState::Error {
            self.transport.delay_ms(report.poll_timeout_ms).await;
            report = self.get_status().await?;
        }
        Ok(report)
    }

    /// Poll until dfuDNLOAD-IDLE; any other terminal state, or a
    /// non-OK status, is a protocol failure at `phase`
    pub async fn poll_until_idle(
        &self,
        phase: &'static str,
    ) -> Result<StatusReport, Error> {
        let report =
            self.poll_until(|s| s == DfuState::DownloadIdle).await?;
        if report.state != DfuState::DownloadIdle
            || report.status != STATUS_OK
        {
            return Err(Error::Protocol {
                state: report.state,
                status: report.status,
                phase,
            });
        }
        Ok(report)
    }

    /// Drive the device back to dfuIDLE from wherever it is
    ///
    /// ABORT, then read the state; a device in dfuERROR needs its
    /// status cleared first. Anything still not idle after that is a
    /// protocol failure.
    pub async fn abort_to_idle(&self) -> Result<(), Error> {
        self.abort().await?;
        let mut state = self.get_state().await?;
        if state == DfuState::Error {
            self.clear_status().await?;
            state = self.get_state().await?;
        }
        if state != DfuState::Idle {
            return Err(Error::Protocol {
                state,
                status: STATUS_OK,
                phase: "abort did not reach idle",
            });
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/protocol.rs"]
mod tests;
