use crate::error::Error;
use crate::event::{Event, EventSink};
use crate::protocol::{DfuLink, DfuState, STATUS_OK};
use crate::session::CancelToken;
use crate::transport::ControlTransport;
use crate::wire::FunctionalDescriptor;
use alloc::vec::Vec;

/// The plain DFU 1.1 engine
///
/// Drives uploads (device-to-host) and downloads (host-to-device)
/// against an already-claimed DFU interface. The DfuSe engine layers
/// address targeting on top of this.
pub struct DfuEngine<'a, T: ControlTransport> {
    pub(crate) link: DfuLink<'a, T>,
    pub(crate) functional: FunctionalDescriptor,
    pub(crate) cancel: CancelToken,
}

impl<'a, T: ControlTransport> DfuEngine<'a, T> {
    pub fn new(
        link: DfuLink<'a, T>,
        functional: FunctionalDescriptor,
        cancel: CancelToken,
    ) -> Self {
        Self {
            link,
            functional,
            cancel,
        }
    }

    pub(crate) async fn check_cancel(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            // Best effort: the device may already be unreachable
            let _ = self.link.abort_to_idle().await;
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Read the device's firmware image
    ///
    /// UPLOAD requests are issued with incrementing block numbers until
    /// the device returns a short block, or until `max_size` bytes have
    /// arrived — in which case the device is still in dfuUPLOAD-IDLE
    /// and must be aborted back to idle.
    pub async fn read(
        &self,
        xfer_size: u16,
        max_size: Option<usize>,
        events: &mut impl EventSink,
    ) -> Result<Vec<u8>, Error> {
        self.read_from_block(0, xfer_size, max_size, events).await
    }

    pub(crate) async fn read_from_block(
        &self,
        first_block: u16,
        xfer_size: u16,
        max_size: Option<usize>,
        events: &mut impl EventSink,
    ) -> Result<Vec<u8>, Error> {
        let mut image = Vec::new();
        if max_size == Some(0) {
            return Ok(image);
        }

        let mut block = first_block;
        loop {
            self.check_cancel().await?;
            let want = match max_size {
                Some(max) => {
                    xfer_size.min((max - image.len()).min(0xFFFF) as u16)
                }
                None => xfer_size,
            };
            let data = self.link.read_block(block, want).await?;
            let short = data.len() < want as usize;
            image.extend_from_slice(&data);
            events.on_event(Event::Progress {
                done: image.len(),
                total: max_size,
            });
            block = block.wrapping_add(1);

            if short {
                break;
            }
            if let Some(max) = max_size {
                if image.len() >= max {
                    self.link.abort_to_idle().await?;
                    break;
                }
            }
        }
        Ok(image)
    }

    /// Write a firmware image and see it through manifestation
    ///
    /// The image goes down in `xfer_size` chunks with consecutive block
    /// numbers, each polled to dfuDNLOAD-IDLE; a zero-length DNLOAD
    /// then commits it. A manifestation-tolerant device is polled back
    /// to idle (or to dfuMANIFEST-WAIT-RESET, which means it lied about
    /// tolerance and will drop off the bus); an intolerant one gets a
    /// single GET_STATUS nudge whose failure is expected. Finally the
    /// device is reset.
    pub async fn write(
        &self,
        xfer_size: u16,
        data: &[u8],
        events: &mut impl EventSink,
    ) -> Result<(), Error> {
        events.on_event(Event::WriteStart);
        let total = data.len();
        let mut block: u16 = 0;
        let mut sent = 0;

        for chunk in data.chunks(usize::from(xfer_size)) {
            self.check_cancel().await?;
            self.link.write_block(block, chunk).await?;
            self.link.poll_until_idle("write").await?;
            sent += chunk.len();
            block = block.wrapping_add(1);
            events.on_event(Event::WriteProgress { done: sent, total });
        }

        // Zero-length block: "that was the whole image"
        self.link.write_block(block, &[]).await?;
        self.manifest().await?;
        events.on_event(Event::WriteEnd { total: sent });
        self.reset().await
    }

    async fn manifest(&self) -> Result<(), Error> {
        if self.functional.manifestation_tolerant {
            let report = self
                .link
                .poll_until(|s| {
                    s == DfuState::Idle || s == DfuState::ManifestWaitReset
                })
                .await?;
            if report.state == DfuState::Error
                || report.status != STATUS_OK
            {
                return Err(Error::Protocol {
                    state: report.state,
                    status: report.status,
                    phase: "manifest",
                });
            }
        } else {
            // One status read kicks off manifestation; the device is
            // allowed to vanish instead of answering.
            let _ = self.link.get_status().await;
        }
        Ok(())
    }

    /// Reset the device, treating "it already left" as success
    pub(crate) async fn reset(&self) -> Result<(), Error> {
        match self.link.transport().reset().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_device_gone() => Ok(()),
            Err(e) => Err(Error::Transport(e)),
        }
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/dfu.rs"]
mod tests;
