// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;
use uuid::Uuid;
use vm_memory::{Bytes, GuestAddress, GuestMemoryError};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::GuestMemoryMmap;

pub mod cpuid;

#[derive(Error, Debug)]
pub enum TdvfError {
    #[error("TDVF metadata not found")]
    MetadataNotFound,
    #[error("Failed read TDVF descriptor")]
    ReadDescriptor,
    #[error("Invalid descriptor signature")]
    InvalidDescriptorSignature,
    #[error("Invalid descriptor size")]
    InvalidDescriptorSize,
    #[error("Invalid descriptor version")]
    InvalidDescriptorVersion,
    #[error("Invalid TDVF section {0}")]
    InvalidSection(usize),
    #[error("TD HOB does not fit in its section")]
    HobOverflow,
    #[error("Failed to write HOB details to guest memory: {0}")]
    GuestMemoryWriteHob(#[source] GuestMemoryError),
}

const TDVF_SIGNATURE: [u8; 4] = *b"TDVF";
const TDVF_VERSION: u32 = 1;

// Trailing GUIDed table of OVMF based images.
const OVMF_TABLE_FOOTER_GUID: u128 = 0x96b582de_1fb2_45f7_baea_a366c55a082d;
const TDX_METADATA_OFFSET_GUID: u128 = 0xe47a6535_984a_4798_865e_4685a7bf8ec2;
const OVMF_TABLE_FOOTER_OFFSET: usize = 0x30;
// Absolute metadata offset used by images without the table.
const TDVF_LEGACY_OFFSET_LOCATION: usize = 0x20;

const GUID_SIZE: usize = 16;
const TABLE_ENTRY_TRAILER: usize = GUID_SIZE + 2;

pub const TDVF_SECTION_ATTRIBUTES_MR_EXTEND: u32 = 1 << 0;

// TDVF_DESCRIPTOR
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct TdvfDescriptor {
    signature: [u8; 4],
    length: u32,
    version: u32,
    num_sections: u32, // NumberOfSectionEntry
}

// TDVF_SECTION
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TdvfSection {
    pub data_offset: u32,
    pub data_size: u32, // RawDataSize
    pub address: u64,   // MemoryAddress
    pub size: u64,      // MemoryDataSize
    pub r#type: u32,
    pub attributes: u32,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TdvfSectionType {
    Bfv,
    Cfv,
    TdHob,
    TempMem,
    PermMem,
    Payload,
    PayloadParam,
}

impl TryFrom<u32> for TdvfSectionType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => TdvfSectionType::Bfv,
            1 => TdvfSectionType::Cfv,
            2 => TdvfSectionType::TdHob,
            3 => TdvfSectionType::TempMem,
            4 => TdvfSectionType::PermMem,
            5 => TdvfSectionType::Payload,
            6 => TdvfSectionType::PayloadParam,
            v => return Err(v),
        })
    }
}

impl TdvfSection {
    pub fn section_type(&self) -> Option<TdvfSectionType> {
        TdvfSectionType::try_from(self.r#type).ok()
    }

    /// Whether the section content extends the TD measurement.
    pub fn measured(&self) -> bool {
        self.attributes & TDVF_SECTION_ATTRIBUTES_MR_EXTEND != 0
    }

    /// Raw bytes carried by the image for this section.
    pub fn data<'a>(&self, image: &'a [u8]) -> Option<&'a [u8]> {
        let start = self.data_offset as usize;
        image.get(start..start.checked_add(self.data_size as usize)?)
    }

    pub fn end(&self) -> u64 {
        self.address + self.size
    }

    fn valid(&self, image: &[u8]) -> bool {
        let page_mask = crate::PAGE_SIZE as u64 - 1;
        if self.address & page_mask != 0
            || self.size & page_mask != 0
            || self.size == 0
            || self.address.checked_add(self.size).is_none()
            || u64::from(self.data_size) > self.size
        {
            return false;
        }

        match self.section_type() {
            Some(TdvfSectionType::Bfv | TdvfSectionType::Cfv) => {
                self.data_size != 0 && self.data(image).is_some()
            }
            Some(TdvfSectionType::Payload | TdvfSectionType::PayloadParam) => {
                self.data(image).is_some()
            }
            Some(
                TdvfSectionType::TdHob | TdvfSectionType::TempMem | TdvfSectionType::PermMem,
            ) => self.data_size == 0 && !self.measured(),
            None => false,
        }
    }
}

fn guid_bytes(guid: u128) -> [u8; GUID_SIZE] {
    Uuid::from_u128(guid).to_bytes_le()
}

fn read_u16(image: &[u8], offset: usize) -> Option<u16> {
    let bytes = image.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(image: &[u8], offset: usize) -> Option<u32> {
    let bytes = image.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Walks the GUIDed table ending 0x30 bytes before the end of the image and
/// returns the data of the entry matching `guid`. Entries are laid out as
/// `[data][u16 length][guid]`, the last one being the footer.
fn find_table_entry(image: &[u8], guid: u128) -> Option<&[u8]> {
    let footer = image.len().checked_sub(OVMF_TABLE_FOOTER_OFFSET)?;
    if image.get(footer..footer + GUID_SIZE)? != guid_bytes(OVMF_TABLE_FOOTER_GUID) {
        return None;
    }

    let table_len = (read_u16(image, footer.checked_sub(2)?)? as usize)
        .checked_sub(TABLE_ENTRY_TRAILER)?;
    let table_end = footer.checked_sub(2)?;
    let table_start = table_end.checked_sub(table_len)?;
    let table = &image[table_start..table_end];

    let mut end = table.len();
    while end >= TABLE_ENTRY_TRAILER {
        let entry_guid = &table[end - GUID_SIZE..end];
        let len = read_u16(table, end - TABLE_ENTRY_TRAILER)? as usize;
        if len < TABLE_ENTRY_TRAILER || len > end {
            break;
        }
        let start = end - len;
        if entry_guid == guid_bytes(guid) {
            return Some(&table[start..end - TABLE_ENTRY_TRAILER]);
        }
        end = start;
    }

    None
}

fn metadata_offset(image: &[u8]) -> Result<usize, TdvfError> {
    if let Some(data) = find_table_entry(image, TDX_METADATA_OFFSET_GUID) {
        let from_end = read_u32(data, 0).ok_or(TdvfError::MetadataNotFound)? as usize;
        return image
            .len()
            .checked_sub(from_end)
            .ok_or(TdvfError::MetadataNotFound);
    }

    // See "TDVF Metadata Pointer" in "TDX Virtual Firmware Design Guide"
    let location = image
        .len()
        .checked_sub(TDVF_LEGACY_OFFSET_LOCATION)
        .ok_or(TdvfError::MetadataNotFound)?;
    read_u32(image, location)
        .map(|offset| offset as usize)
        .ok_or(TdvfError::MetadataNotFound)
}

/// Parses and validates the TDVF metadata of a firmware image.
pub fn parse_tdvf_sections(image: &[u8]) -> Result<Vec<TdvfSection>, TdvfError> {
    let offset = metadata_offset(image)?;
    let bytes = image.get(offset..).ok_or(TdvfError::ReadDescriptor)?;
    let (descriptor, mut rest) =
        TdvfDescriptor::read_from_prefix(bytes).map_err(|_| TdvfError::ReadDescriptor)?;

    if descriptor.signature != TDVF_SIGNATURE {
        return Err(TdvfError::InvalidDescriptorSignature);
    }

    if descriptor.length as usize
        != std::mem::size_of::<TdvfDescriptor>()
            + std::mem::size_of::<TdvfSection>() * descriptor.num_sections as usize
    {
        return Err(TdvfError::InvalidDescriptorSize);
    }

    if descriptor.version != TDVF_VERSION {
        return Err(TdvfError::InvalidDescriptorVersion);
    }

    let mut sections = Vec::with_capacity(descriptor.num_sections as usize);
    let mut hobs = 0;
    for index in 0..descriptor.num_sections as usize {
        let (section, tail) =
            TdvfSection::read_from_prefix(rest).map_err(|_| TdvfError::InvalidDescriptorSize)?;
        rest = tail;

        if !section.valid(image) {
            return Err(TdvfError::InvalidSection(index));
        }
        if section.section_type() == Some(TdvfSectionType::TdHob) {
            hobs += 1;
            if hobs > 1 {
                return Err(TdvfError::InvalidSection(index));
            }
        }
        debug!("TDVF section {}: {:x?}", index, section);
        sections.push(section);
    }

    Ok(sections)
}

const HOB_TYPE_HANDOFF: u16 = 0x1;
const HOB_TYPE_RESOURCE_DESCRIPTOR: u16 = 0x3;
const HOB_TYPE_END_OF_HOB_LIST: u16 = 0xffff;

const HOB_HANDOFF_TABLE_VERSION: u32 = 0x9;

const EFI_RESOURCE_SYSTEM_MEMORY: u32 = 0x0;
const EFI_RESOURCE_MEMORY_UNACCEPTED: u32 = 0x7;
// PRESENT | INITIALIZED | TESTED
const EFI_RESOURCE_ATTRIBUTE_DEFAULT: u32 = 0x7;

#[repr(C)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct HobHeader {
    r#type: u16,
    length: u16,
    reserved: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct HobHandoffInfoTable {
    header: HobHeader,
    version: u32,
    boot_mode: u32,
    efi_memory_top: u64,
    efi_memory_bottom: u64,
    efi_free_memory_top: u64,
    efi_free_memory_bottom: u64,
    efi_end_of_hob_list: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct HobResourceDescriptor {
    header: HobHeader,
    owner: [u8; GUID_SIZE],
    resource_type: u32,
    resource_attribute: u32,
    physical_start: u64,
    resource_length: u64,
}

/// Builds the hand-off block consumed by TDVF, straight into guest memory.
pub struct TdHob {
    start_offset: u64,
    current_offset: u64,
    limit: u64,
}

fn align_hob(v: u64) -> u64 {
    v.div_ceil(8) * 8
}

impl TdHob {
    fn write<T: IntoBytes + Immutable>(
        &mut self,
        mem: &GuestMemoryMmap,
        obj: &T,
        offset: u64,
    ) -> Result<(), TdvfError> {
        let bytes = obj.as_bytes();
        if offset + bytes.len() as u64 > self.limit {
            return Err(TdvfError::HobOverflow);
        }
        mem.write_slice(bytes, GuestAddress(offset))
            .map_err(TdvfError::GuestMemoryWriteHob)
    }

    fn update_offset<T>(&mut self) {
        self.current_offset = align_hob(self.current_offset + std::mem::size_of::<T>() as u64)
    }

    /// Starts a HOB list in the TD_HOB section `[offset, offset + size)`.
    pub fn start(offset: u64, size: u64) -> TdHob {
        // Leave a gap to place the HandoffTable at the start as it can only be filled in later
        let mut hob = TdHob {
            start_offset: offset,
            current_offset: offset,
            limit: offset + size,
        };
        hob.update_offset::<HobHandoffInfoTable>();
        hob
    }

    pub fn finish(&mut self, mem: &GuestMemoryMmap) -> Result<(), TdvfError> {
        let end = HobHeader {
            r#type: HOB_TYPE_END_OF_HOB_LIST,
            length: std::mem::size_of::<HobHeader>() as u16,
            reserved: 0,
        };
        debug!("Writing HOB end {:x} {:x?}", self.current_offset, end);
        self.write(mem, &end, self.current_offset)?;
        self.update_offset::<HobHeader>();

        // Write handoff, delayed as it needs end of HOB list
        let handoff = HobHandoffInfoTable {
            header: HobHeader {
                r#type: HOB_TYPE_HANDOFF,
                length: std::mem::size_of::<HobHandoffInfoTable>() as u16,
                reserved: 0,
            },
            version: HOB_HANDOFF_TABLE_VERSION,
            efi_end_of_hob_list: self.current_offset,
            ..Default::default()
        };
        debug!("Writing HOB start {:x} {:x?}", self.start_offset, handoff);
        self.write(mem, &handoff, self.start_offset)
    }

    fn add_resource(
        &mut self,
        mem: &GuestMemoryMmap,
        physical_start: u64,
        resource_length: u64,
        resource_type: u32,
    ) -> Result<(), TdvfError> {
        let resource_descriptor = HobResourceDescriptor {
            header: HobHeader {
                r#type: HOB_TYPE_RESOURCE_DESCRIPTOR,
                length: std::mem::size_of::<HobResourceDescriptor>() as u16,
                reserved: 0,
            },
            owner: [0; GUID_SIZE],
            resource_type,
            resource_attribute: EFI_RESOURCE_ATTRIBUTE_DEFAULT,
            physical_start,
            resource_length,
        };
        debug!(
            "Writing HOB resource {:x} {:x?}",
            self.current_offset, resource_descriptor
        );
        self.write(mem, &resource_descriptor, self.current_offset)?;
        self.update_offset::<HobResourceDescriptor>();
        Ok(())
    }

    /// Describes a RAM range. Ranges the host already added are system
    /// memory, the rest is left for the guest to accept.
    pub fn add_memory_resource(
        &mut self,
        mem: &GuestMemoryMmap,
        physical_start: u64,
        resource_length: u64,
        accepted: bool,
    ) -> Result<(), TdvfError> {
        self.add_resource(
            mem,
            physical_start,
            resource_length,
            if accepted {
                EFI_RESOURCE_SYSTEM_MEMORY
            } else {
                EFI_RESOURCE_MEMORY_UNACCEPTED
            },
        )
    }
}
