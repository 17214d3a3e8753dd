// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-visible protocol for the virtio-iommu device.
//!
//! All structures are little-endian on the wire. A request chain carries a
//! [`ReqHead`], a type-specific payload, and a writeable [`ReqTail`]; the
//! event queue carries [`Fault`] records.

use virtio::spec::u16_le;
use virtio::spec::u32_le;
use virtio::spec::u64_le;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

// Request types
pub const VIRTIO_IOMMU_T_ATTACH: u8 = 1;
pub const VIRTIO_IOMMU_T_DETACH: u8 = 2;
pub const VIRTIO_IOMMU_T_MAP: u8 = 3;
pub const VIRTIO_IOMMU_T_UNMAP: u8 = 4;
pub const VIRTIO_IOMMU_T_PROBE: u8 = 5;

// Request statuses
pub const VIRTIO_IOMMU_S_OK: u8 = 0;
pub const VIRTIO_IOMMU_S_IOERR: u8 = 1;
pub const VIRTIO_IOMMU_S_UNSUPP: u8 = 2;
pub const VIRTIO_IOMMU_S_DEVERR: u8 = 3;
pub const VIRTIO_IOMMU_S_INVAL: u8 = 4;
pub const VIRTIO_IOMMU_S_RANGE: u8 = 5;
pub const VIRTIO_IOMMU_S_NOENT: u8 = 6;
pub const VIRTIO_IOMMU_S_FAULT: u8 = 7;

// Device feature bits (first bank)
pub const VIRTIO_IOMMU_F_INPUT_RANGE: u32 = 1 << 0;
pub const VIRTIO_IOMMU_F_DOMAIN_RANGE: u32 = 1 << 1;
pub const VIRTIO_IOMMU_F_MAP_UNMAP: u32 = 1 << 2;
pub const VIRTIO_IOMMU_F_BYPASS: u32 = 1 << 3;
pub const VIRTIO_IOMMU_F_PROBE: u32 = 1 << 4;
pub const VIRTIO_IOMMU_F_MMIO: u32 = 1 << 5;

// MAP request flags
pub const VIRTIO_IOMMU_MAP_F_READ: u32 = 1 << 0;
pub const VIRTIO_IOMMU_MAP_F_WRITE: u32 = 1 << 1;
pub const VIRTIO_IOMMU_MAP_F_EXEC: u32 = 1 << 2;

// Fault reasons
pub const VIRTIO_IOMMU_FAULT_R_UNKNOWN: u8 = 1;
pub const VIRTIO_IOMMU_FAULT_R_DOMAIN: u8 = 2;
pub const VIRTIO_IOMMU_FAULT_R_MAPPING: u8 = 3;

// Fault flags
pub const VIRTIO_IOMMU_FAULT_F_READ: u32 = 1 << 0;
pub const VIRTIO_IOMMU_FAULT_F_WRITE: u32 = 1 << 1;
pub const VIRTIO_IOMMU_FAULT_F_EXEC: u32 = 1 << 2;
pub const VIRTIO_IOMMU_FAULT_F_ADDRESS: u32 = 1 << 8;

// Probe property types
pub const VIRTIO_IOMMU_PROBE_T_NONE: u16 = 0;
pub const VIRTIO_IOMMU_PROBE_T_RESV_MEM: u16 = 1;

// Reserved memory region subtypes
pub const VIRTIO_IOMMU_RESV_MEM_T_RESERVED: u8 = 0;
pub const VIRTIO_IOMMU_RESV_MEM_T_MSI: u8 = 1;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReqHead {
    pub request_type: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReqTail {
    pub status: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReqAttach {
    pub domain: u32_le,
    pub endpoint: u32_le,
    pub reserved: [u8; 8],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReqDetach {
    pub domain: u32_le,
    pub endpoint: u32_le,
    pub reserved: [u8; 8],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReqMap {
    pub domain: u32_le,
    pub virt_start: u64_le,
    pub virt_end: u64_le,
    pub phys_start: u64_le,
    pub flags: u32_le,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReqUnmap {
    pub domain: u32_le,
    pub virt_start: u64_le,
    pub virt_end: u64_le,
    pub reserved: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReqProbe {
    pub endpoint: u32_le,
    pub reserved: [u8; 64],
}

/// Header of one probe property; a property of type
/// [`VIRTIO_IOMMU_PROBE_T_NONE`] terminates the property list.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ProbeProperty {
    pub property_type: u16_le,
    pub length: u16_le,
}

/// Payload of a [`VIRTIO_IOMMU_PROBE_T_RESV_MEM`] property.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ProbeResvMem {
    pub subtype: u8,
    pub reserved: [u8; 3],
    pub start: u64_le,
    pub end: u64_le,
}

/// Fault record posted to the event queue.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Fault {
    pub reason: u8,
    pub reserved: [u8; 3],
    pub flags: u32_le,
    pub endpoint: u32_le,
    pub reserved2: [u8; 4],
    pub address: u64_le,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Range32 {
    pub start: u32_le,
    pub end: u32_le,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Range64 {
    pub start: u64_le,
    pub end: u64_le,
}

/// Device configuration space.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VirtioIommuConfig {
    pub page_size_mask: u64_le,
    pub input_range: Range64,
    pub domain_range: Range32,
    pub probe_size: u32_le,
    pub reserved: u32_le,
}
