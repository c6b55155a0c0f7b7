use crate::error::Error;
use alloc::vec::Vec;

// For request (USB 2.0 table 9-4)
pub const GET_DESCRIPTOR: u8 = 6;
pub const SET_CONFIGURATION: u8 = 9;

// Descriptor types (USB 2.0 table 9-5, DFU 1.1 table 4.2)
pub const CONFIGURATION_DESCRIPTOR: u8 = 2;
pub const STRING_DESCRIPTOR: u8 = 3;
pub const INTERFACE_DESCRIPTOR: u8 = 4;
pub const DFU_FUNCTIONAL_DESCRIPTOR: u8 = 0x21;

// DFU interface identification (DFU 1.1 tables 4.1 and 4.4)
pub const DFU_CLASS_APPLICATION_SPECIFIC: u8 = 0xFE;
pub const DFU_SUBCLASS: u8 = 0x01;
pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
pub const DFU_PROTOCOL_DFU_MODE: u8 = 0x02;

/// bcdDFUVersion advertised by DfuSe (DFU 1.1a) devices
pub const DFUSE_VERSION: u16 = 0x011A;

/// A DFU-capable alternate setting has this exact class/subclass pair
/// and one of the two DFU protocols (0x01 runtime, 0x02 DFU mode).
pub fn is_dfu_interface(class: u8, sub_class: u8, protocol: u8) -> bool {
    class == DFU_CLASS_APPLICATION_SPECIFIC
        && sub_class == DFU_SUBCLASS
        && (protocol == DFU_PROTOCOL_RUNTIME
            || protocol == DFU_PROTOCOL_DFU_MODE)
}

#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-10
pub struct ConfigurationDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub wTotalLength: [u8; 2],
    pub bNumInterfaces: u8,
    pub bConfigurationValue: u8,
    pub iConfiguration: u8,
    pub bmAttributes: u8,
    pub bMaxPower: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for ConfigurationDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for ConfigurationDescriptor {}

#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-12
pub struct InterfaceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bInterfaceNumber: u8,
    pub bAlternateSetting: u8,
    pub bNumEndpoints: u8,
    pub bInterfaceClass: u8,
    pub bInterfaceSubClass: u8,
    pub bInterfaceProtocol: u8,
    pub iInterface: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for InterfaceDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for InterfaceDescriptor {}

/// The DFU functional descriptor, decoded (DFU 1.1 table 4.2)
///
/// The wire form has u16s at odd offsets, so unlike the descriptors
/// above it cannot be a Pod view of the buffer; it is decoded
/// per-field instead.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    /// bmAttributes bit 3: device detaches itself after DFU_DETACH
    pub will_detach: bool,
    /// bmAttributes bit 2: device returns to idle after manifestation
    pub manifestation_tolerant: bool,
    /// bmAttributes bit 1: device supports DFU_UPLOAD
    pub can_upload: bool,
    /// bmAttributes bit 0: device supports DFU_DNLOAD
    pub can_download: bool,
    pub detach_timeout_ms: u16,
    pub transfer_size: u16,
    pub dfu_version: u16,
}

impl FunctionalDescriptor {
    pub const LENGTH: usize = 9;

    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::LENGTH
            || (bytes[0] as usize) < Self::LENGTH
            || bytes[1] != DFU_FUNCTIONAL_DESCRIPTOR
        {
            return Err(Error::MalformedDescriptor("functional"));
        }
        let attributes = bytes[2];
        Ok(Self {
            will_detach: (attributes & 8) != 0,
            manifestation_tolerant: (attributes & 4) != 0,
            can_upload: (attributes & 2) != 0,
            can_download: (attributes & 1) != 0,
            detach_timeout_ms: u16::from_le_bytes([bytes[3], bytes[4]]),
            transfer_size: u16::from_le_bytes([bytes[5], bytes[6]]),
            dfu_version: u16::from_le_bytes([bytes[7], bytes[8]]),
        })
    }

    /// True for DfuSe devices (checked together with the interface
    /// protocol when choosing an engine).
    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == DFUSE_VERSION
    }
}

/// One record of a configuration's sub-descriptor sequence
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, PartialEq, Eq)]
pub enum Record {
    Interface(InterfaceDescriptor),
    Functional(FunctionalDescriptor),
    /// Anything else, preserved with its type tag
    Other { descriptor_type: u8, bytes: Vec<u8> },
}

/// An interface and the records which followed it
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, PartialEq, Eq)]
pub struct ParsedInterface {
    pub descriptor: InterfaceDescriptor,
    pub children: Vec<Record>,
    /// The interface's own DFU functional descriptor, if one followed it
    pub functional: Option<FunctionalDescriptor>,
}

/// A configuration descriptor and all its sub-descriptors, typed
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Clone, PartialEq, Eq)]
pub struct ParsedConfiguration {
    pub descriptor: ConfigurationDescriptor,
    /// Every record, in wire order
    pub records: Vec<Record>,
    /// Every DFU functional descriptor in the configuration, in order
    pub functional: Vec<FunctionalDescriptor>,
    /// Every interface (one entry per alternate setting), in order
    pub interfaces: Vec<ParsedInterface>,
}

/// Walk a configuration descriptor and its concatenated sub-descriptors
///
/// The buffer starts with the 9-byte configuration descriptor; the rest
/// is a TLV sequence (bLength, bDescriptorType, ...). A DFU functional
/// descriptor is only recognised as such while the walker is inside a
/// DFU interface (class 0xFE, subclass 0x01); elsewhere type 0x21 is an
/// opaque record. A trailing fragment of fewer than two bytes is
/// tolerated, but a record claiming to extend past the buffer is not.
pub fn parse_configuration(
    buf: &[u8],
) -> Result<ParsedConfiguration, Error> {
    if buf.len() < 9 {
        return Err(Error::MalformedDescriptor("configuration header"));
    }
    let descriptor: &ConfigurationDescriptor =
        bytemuck::try_from_bytes(&buf[0..9])
            .map_err(|_| Error::MalformedDescriptor("configuration"))?;
    if descriptor.bDescriptorType != CONFIGURATION_DESCRIPTOR {
        return Err(Error::MalformedDescriptor("configuration type"));
    }

    let mut configuration = ParsedConfiguration {
        descriptor: *descriptor,
        records: Vec::new(),
        functional: Vec::new(),
        interfaces: Vec::new(),
    };

    let mut in_dfu_interface = false;
    let mut index = 9;

    while buf.len() >= index + 2 {
        let dlen = buf[index] as usize;
        let dtype = buf[index + 1];

        if dlen < 2 {
            return Err(Error::MalformedDescriptor("bLength"));
        }
        if index + dlen > buf.len() {
            return Err(Error::MalformedDescriptor("descriptor overruns"));
        }

        let record = match dtype {
            INTERFACE_DESCRIPTOR => {
                if dlen < 9 {
                    return Err(Error::MalformedDescriptor("interface"));
                }
                let i: &InterfaceDescriptor =
                    bytemuck::try_from_bytes(&buf[index..index + 9])
                        .map_err(|_| {
                            Error::MalformedDescriptor("interface")
                        })?;
                in_dfu_interface = i.bInterfaceClass
                    == DFU_CLASS_APPLICATION_SPECIFIC
                    && i.bInterfaceSubClass == DFU_SUBCLASS;
                configuration.interfaces.push(ParsedInterface {
                    descriptor: *i,
                    children: Vec::new(),
                    functional: None,
                });
                Record::Interface(*i)
            }
            DFU_FUNCTIONAL_DESCRIPTOR if in_dfu_interface => {
                let f =
                    FunctionalDescriptor::parse(&buf[index..index + dlen])?;
                configuration.functional.push(f);
                // The walker is inside an interface, so last() exists
                if let Some(interface) = configuration.interfaces.last_mut()
                {
                    interface.functional.get_or_insert(f);
                }
                Record::Functional(f)
            }
            _ => Record::Other {
                descriptor_type: dtype,
                bytes: buf[index..index + dlen].to_vec(),
            },
        };

        if !matches!(record, Record::Interface(_)) {
            if let Some(interface) = configuration.interfaces.last_mut() {
                interface.children.push(record.clone());
            }
        }
        configuration.records.push(record);

        index += dlen;
    }

    Ok(configuration)
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/wire.rs"]
mod tests;
