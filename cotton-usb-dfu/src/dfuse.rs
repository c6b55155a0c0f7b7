use crate::debug;
use crate::dfu::DfuEngine;
use crate::error::Error;
use crate::event::{Event, EventSink};
use crate::memory_map::MemoryMap;
use crate::protocol::{DfuState, STATUS_OK};
use crate::transport::ControlTransport;
use alloc::vec::Vec;

// DfuSe commands, written as DFU_DNLOAD at block 0 (ST UM0424)
pub const CMD_GET_COMMANDS: u8 = 0x00;
pub const CMD_SET_ADDRESS: u8 = 0x21;
pub const CMD_ERASE_SECTOR: u8 = 0x41;

/// Data blocks start at 2; blocks 0 and 1 are reserved for commands
const FIRST_DATA_BLOCK: u16 = 2;

/// The DfuSe (DFU 1.1a) engine
///
/// Extends the plain engine with explicit memory addressing: reads and
/// writes are targeted at `start_address` (default: the first segment),
/// and writes erase the affected sectors first.
pub struct DfuseEngine<'a, T: ControlTransport> {
    dfu: DfuEngine<'a, T>,
    map: &'a MemoryMap,
    start_address: Option<u32>,
}

impl<'a, T: ControlTransport> DfuseEngine<'a, T> {
    pub fn new(
        dfu: DfuEngine<'a, T>,
        map: &'a MemoryMap,
        start_address: Option<u32>,
    ) -> Self {
        Self {
            dfu,
            map,
            start_address,
        }
    }

    fn resolve_start(&self) -> u32 {
        // The parser guarantees at least one segment
        self.start_address
            .unwrap_or_else(|| self.map.segments[0].start)
    }

    /// Issue one DfuSe command and wait for it to leave dfuDNBUSY
    async fn command(
        &self,
        command: u8,
        parameter: Option<u32>,
        phase: &'static str,
    ) -> Result<(), Error> {
        let mut payload = [0u8; 5];
        payload[0] = command;
        let length = match parameter {
            Some(parameter) => {
                payload[1..5].copy_from_slice(&parameter.to_le_bytes());
                5
            }
            None => 1,
        };
        self.dfu.link.write_block(0, &payload[..length]).await?;
        let report = self
            .dfu
            .link
            .poll_until(|s| s != DfuState::DownloadBusy)
            .await?;
        if report.state == DfuState::Error || report.status != STATUS_OK {
            return Err(Error::Protocol {
                state: report.state,
                status: report.status,
                phase,
            });
        }
        Ok(())
    }

    /// Probe which DfuSe commands the bootloader supports
    pub async fn get_commands(&self) -> Result<(), Error> {
        self.command(CMD_GET_COMMANDS, None, "get commands").await
    }

    async fn set_address(&self, address: u32) -> Result<(), Error> {
        self.command(CMD_SET_ADDRESS, Some(address), "set address")
            .await
    }

    async fn erase_sector(&self, address: u32) -> Result<(), Error> {
        self.command(CMD_ERASE_SECTOR, Some(address), "erase").await
    }

    /// Erase every sector overlapping `[start, start + length)`
    ///
    /// Sectors in non-erasable segments are skipped without a command;
    /// their bytes count towards progress, and the walk window grows by
    /// the same amount so the erased span still covers the data.
    async fn erase(
        &self,
        start: u32,
        length: u32,
        events: &mut impl EventSink,
    ) -> Result<(), Error> {
        let first = self
            .map
            .segment_for(start)
            .ok_or(Error::AddressOutOfMap(start))?;
        let last_byte = start + (length - 1);
        let last = self
            .map
            .segment_for(last_byte)
            .ok_or(Error::AddressOutOfMap(last_byte))?;

        let mut addr = first.sector_start(start);
        let mut end = last.sector_end(last_byte);
        let total = end - addr;
        let mut done: u32 = 0;

        while addr < end {
            let Some(segment) = self.map.segment_for(addr) else {
                break;
            };
            if !segment.erasable {
                let skipped = segment.end - addr;
                done = (done + skipped).min(total);
                end = end.saturating_add(skipped);
                addr = segment.end;
                events.on_event(Event::EraseProgress { done, total });
                continue;
            }
            self.dfu.check_cancel().await?;
            let sector = segment.sector_start(addr);
            self.erase_sector(sector).await?;
            addr = sector + segment.sector_size;
            done = (done + segment.sector_size).min(total);
            events.on_event(Event::EraseProgress { done, total });
        }
        Ok(())
    }

    /// Write `data` at the resolved start address
    ///
    /// Erase first; then each chunk is a SET_ADDRESS followed by a
    /// block-2 DNLOAD. A zero-length block-0 DNLOAD tells the
    /// bootloader to leave, and the device is polled into dfuMANIFEST.
    /// The USB reset afterwards is the session's job, not the engine's.
    pub async fn write(
        &self,
        xfer_size: u16,
        data: &[u8],
        events: &mut impl EventSink,
    ) -> Result<(), Error> {
        let start = self.resolve_start();
        if self.map.segment_for(start).is_none() && !data.is_empty() {
            return Err(Error::AddressOutOfMap(start));
        }

        if !data.is_empty() {
            events.on_event(Event::EraseStart);
            self.erase(start, data.len() as u32, events).await?;
            events.on_event(Event::EraseEnd);
        }

        events.on_event(Event::WriteStart);
        let total = data.len();
        let mut sent = 0;
        for chunk in data.chunks(usize::from(xfer_size)) {
            self.dfu.check_cancel().await?;
            self.set_address(start + sent as u32).await?;
            self.dfu.link.write_block(FIRST_DATA_BLOCK, chunk).await?;
            self.dfu.link.poll_until_idle("write").await?;
            sent += chunk.len();
            events.on_event(Event::WriteProgress { done: sent, total });
        }
        events.on_event(Event::WriteEnd { total: sent });

        // Commit: point back at the start and send the leave command
        self.set_address(start).await?;
        self.dfu.link.write_block(0, &[]).await?;
        let report = self
            .dfu
            .link
            .poll_until(|s| s == DfuState::Manifest)
            .await?;
        if report.state == DfuState::Error || report.status != STATUS_OK {
            return Err(Error::Protocol {
                state: report.state,
                status: report.status,
                phase: "manifest",
            });
        }
        Ok(())
    }

    /// Read from the resolved start address
    ///
    /// The address pointer is set while idle, and the device is aborted
    /// back to idle again afterwards — SET_ADDRESS parks the state
    /// machine in dfuDNLOAD-IDLE, where UPLOAD is not accepted. The
    /// device then computes the address of block n as
    /// `start + (n - 2) * xfer_size`.
    pub async fn read(
        &self,
        xfer_size: u16,
        max_size: Option<usize>,
        events: &mut impl EventSink,
    ) -> Result<Vec<u8>, Error> {
        let start = self.resolve_start();
        if self.map.segment_for(start).is_none() {
            debug::println!(
                "dfuse read start {} is outside the memory map",
                start
            );
        }

        let state = self.dfu.link.get_state().await?;
        if state != DfuState::Idle {
            self.dfu.link.abort_to_idle().await?;
        }
        self.set_address(start).await?;
        self.dfu.link.abort_to_idle().await?;

        self.dfu
            .read_from_block(FIRST_DATA_BLOCK, xfer_size, max_size, events)
            .await
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/dfuse.rs"]
mod tests;
