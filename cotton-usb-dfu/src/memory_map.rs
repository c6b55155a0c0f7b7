use crate::error::Error;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// One contiguous run of identically-sized sectors
///
/// `end` is exclusive; `(end - start)` is a whole number of sectors.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct MemorySegment {
    pub start: u32,
    pub end: u32,
    pub sector_size: u32,
    pub readable: bool,
    pub erasable: bool,
    pub writable: bool,
}

impl MemorySegment {
    pub fn contains(&self, addr: u32) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Index of the sector containing `addr` (which must be in range)
    pub fn sector_index(&self, addr: u32) -> u32 {
        (addr - self.start) / self.sector_size
    }

    /// First address of the sector containing `addr`
    pub fn sector_start(&self, addr: u32) -> u32 {
        self.start + self.sector_index(addr) * self.sector_size
    }

    /// One past the last address of the sector containing `addr`
    pub fn sector_end(&self, addr: u32) -> u32 {
        self.sector_start(addr) + self.sector_size
    }
}

/// A DfuSe device's memory layout, parsed from its interface name
///
/// DfuSe encodes the layout in the DFU-mode alternate setting's
/// interface-name string (ST UM0424), e.g.
/// `@Internal Flash/0x08000000/16*001Kg,48*001Kg`: a region name, then
/// one or more `/<base address>/<run>,<run>,…` blocks, where a run is
/// `<count>*<size><unit><permissions>`.
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryMap {
    pub name: String,
    /// Sorted by `start`, non-overlapping
    pub segments: Vec<MemorySegment>,
}

// A run's permission letter a..g is a 3-bit map of what the bootloader
// will let the host do to those sectors.
fn parse_run(run: &str) -> Option<(u32, u32, u8)> {
    let (count, rest) = run.split_once('*')?;
    let count: u32 = count.trim().parse().ok()?;
    let digits = rest.find(|c: char| !c.is_ascii_digit())?;
    let size: u32 = rest[..digits].parse().ok()?;
    let mut tail = rest[digits..].chars();
    let multiplier = match tail.next()? {
        ' ' | 'B' => 1,
        'K' => 1024,
        'M' => 1024 * 1024,
        _ => return None,
    };
    let permissions = tail.next()?;
    if !permissions.is_ascii_lowercase() || permissions > 'g' {
        return None;
    }
    if count == 0 || size == 0 {
        return None;
    }
    Some((
        count,
        size.checked_mul(multiplier)?,
        permissions as u8 - b'a' + 1,
    ))
}

impl MemoryMap {
    /// Parse a DfuSe memory-descriptor string
    ///
    /// Unparseable runs and blocks are skipped; the whole string is
    /// rejected only when it does not start with `@` or when nothing
    /// valid remains.
    pub fn parse(descriptor: &str) -> Result<Self, Error> {
        let rest = descriptor
            .strip_prefix('@')
            .ok_or(Error::MalformedMemoryMap("missing @ prefix"))?;

        let mut parts = rest.split('/');
        let name = parts.next().unwrap_or("").trim().to_string();

        let mut segments = Vec::new();
        while let (Some(address), Some(runs)) = (parts.next(), parts.next())
        {
            let address = address.trim();
            let address = address
                .strip_prefix("0x")
                .or_else(|| address.strip_prefix("0X"))
                .unwrap_or(address);
            let Ok(mut base) = u32::from_str_radix(address, 16) else {
                continue;
            };
            for run in runs.split(',') {
                let Some((count, sector_size, permissions)) =
                    parse_run(run.trim())
                else {
                    continue;
                };
                let Some(length) = count.checked_mul(sector_size) else {
                    continue;
                };
                let Some(end) = base.checked_add(length) else {
                    continue;
                };
                segments.push(MemorySegment {
                    start: base,
                    end,
                    sector_size,
                    readable: (permissions & 1) != 0,
                    erasable: (permissions & 2) != 0,
                    writable: (permissions & 4) != 0,
                });
                base = end;
            }
        }

        if segments.is_empty() {
            return Err(Error::MalformedMemoryMap("no segments"));
        }
        segments.sort_by_key(|s| s.start);
        Ok(Self { name, segments })
    }

    /// The segment containing `addr`, if any
    pub fn segment_for(&self, addr: u32) -> Option<&MemorySegment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    /// How many bytes can be read contiguously starting at `addr`
    ///
    /// The run ends at the first gap between segments or at the first
    /// non-readable segment.
    pub fn max_readable_from(&self, addr: u32) -> u32 {
        let mut accumulated: u32 = 0;
        let mut started = false;
        for segment in &self.segments {
            if !started {
                if segment.contains(addr) {
                    started = true;
                    if !segment.readable {
                        break;
                    }
                    accumulated = segment.end - addr;
                }
            } else {
                if segment.start != addr.wrapping_add(accumulated)
                    || !segment.readable
                {
                    break;
                }
                accumulated += segment.end - segment.start;
            }
        }
        accumulated
    }

    /// The first segment the device will let us program
    pub fn first_writable(&self) -> Option<&MemorySegment> {
        self.segments.iter().find(|s| s.writable)
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/memory_map.rs"]
mod tests;
