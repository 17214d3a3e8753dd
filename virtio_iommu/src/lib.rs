// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The virtio-iommu device.
//!
//! This device mediates DMA between guest-assigned endpoints, identified
//! by bus/device/function stream IDs, and host physical memory. The guest
//! submits administrative requests over the request queue — attaching and
//! detaching endpoints to translation domains, installing and removing
//! guest-virtual to host-physical mappings, and probing per-endpoint
//! properties — and the device enforces the resulting mappings on every
//! DMA translation issued through [`remapping::DmaRemapping`], reporting
//! faults asynchronously over the event queue.
//!
//! Downstream consumers that cache translations (device backends holding
//! shadow mappings) subscribe through [`remapping::MappingNotifier`] and
//! are kept consistent synchronously with every mutation.

pub mod interval_tree;
pub mod protocol;
pub mod remapping;
pub mod saved_state;
mod worker;

use crate::protocol::VirtioIommuConfig;
use crate::remapping::IommuRemapper;
use crate::remapping::ReservedRegion;
use crate::saved_state::RestoreError;
use crate::saved_state::SavedState;
use crate::worker::FaultReporter;
use crate::worker::RequestWorker;
use std::sync::Arc;
use virtio::spec::VIRTIO_F_RING_EVENT_IDX;
use virtio::spec::VIRTIO_F_RING_INDIRECT_DESC;
use virtio::spec::VIRTIO_F_VERSION_1;
use virtio::DeviceTraits;
use virtio::VirtioDevice;
use virtio::VirtioQueueSource;
use virtio::VirtioQueueWorkerContext;
use virtio::VirtioState;
use vm_memory::GuestMemoryMmap;
use zerocopy::IntoBytes;

const VIRTIO_DEVICE_TYPE_IOMMU: u16 = 23;

/// Queue the guest submits requests on.
pub const REQUEST_QUEUE_INDEX: u16 = 0;
/// Queue the device posts fault events on.
pub const EVENT_QUEUE_INDEX: u16 = 1;

const DEFAULT_PROBE_SIZE: u32 = 512;
const DEFAULT_DOMAIN_RANGE_END: u32 = 32;

/// A virtio-iommu device.
pub struct VirtioIommuDevice {
    remapper: Arc<IommuRemapper>,
    config: VirtioIommuConfig,
    memory: GuestMemoryMmap,
}

impl VirtioIommuDevice {
    /// Creates a device translating through `page_size_mask`-granular
    /// mappings, with the given globally-reserved regions.
    pub fn new(
        memory: GuestMemoryMmap,
        page_size_mask: u64,
        reserved_regions: Vec<ReservedRegion>,
    ) -> Self {
        let config = VirtioIommuConfig {
            page_size_mask: page_size_mask.into(),
            input_range: protocol::Range64 {
                start: 0.into(),
                end: u64::MAX.into(),
            },
            domain_range: protocol::Range32 {
                start: 0.into(),
                end: DEFAULT_DOMAIN_RANGE_END.into(),
            },
            probe_size: DEFAULT_PROBE_SIZE.into(),
            reserved: 0.into(),
        };
        Self {
            remapper: Arc::new(IommuRemapper::new(page_size_mask, reserved_regions)),
            config,
            memory,
        }
    }

    /// The shared remapping core. The DMA fabric translates through it and
    /// the bus layer registers mapping notifiers and replay on it.
    pub fn remapper(&self) -> Arc<IommuRemapper> {
        self.remapper.clone()
    }

    /// Drops all guest-configured state, as on device reset.
    pub fn reset(&mut self) {
        self.remapper.reset();
    }

    pub fn save(&self) -> SavedState {
        self.remapper.save()
    }

    pub fn restore(&mut self, state: SavedState) -> Result<(), RestoreError> {
        self.remapper.restore(state)
    }
}

impl VirtioDevice for VirtioIommuDevice {
    fn traits(&self) -> DeviceTraits {
        let device_features = (protocol::VIRTIO_IOMMU_F_INPUT_RANGE
            | protocol::VIRTIO_IOMMU_F_DOMAIN_RANGE
            | protocol::VIRTIO_IOMMU_F_MAP_UNMAP
            | protocol::VIRTIO_IOMMU_F_BYPASS
            | protocol::VIRTIO_IOMMU_F_MMIO
            | protocol::VIRTIO_IOMMU_F_PROBE
            | VIRTIO_F_RING_EVENT_IDX
            | VIRTIO_F_RING_INDIRECT_DESC) as u64
            | (VIRTIO_F_VERSION_1 as u64) << 32;
        DeviceTraits {
            device_id: VIRTIO_DEVICE_TYPE_IOMMU,
            device_features,
            max_queues: 2,
            device_register_length: size_of::<VirtioIommuConfig>() as u32,
        }
    }

    fn read_registers_u32(&self, offset: u16) -> u32 {
        let offset = offset as usize;
        let config = self.config.as_bytes();
        if offset + 4 <= config.len() {
            u32::from_le_bytes(
                config[offset..offset + 4]
                    .try_into()
                    .expect("slice is four bytes"),
            )
        } else {
            0
        }
    }

    fn write_registers_u32(&mut self, offset: u16, val: u32) {
        // The config space is read-only.
        tracing::warn!(offset, val, "unknown config write");
    }

    fn get_work_callback(&mut self, index: u16) -> Option<Box<dyn VirtioQueueWorkerContext + Send>> {
        match index {
            REQUEST_QUEUE_INDEX => Some(Box::new(RequestWorker::new(
                self.remapper.clone(),
                self.memory.clone(),
                self.config.probe_size.get(),
            ))),
            _ => None,
        }
    }

    fn connect_device_queue(&mut self, index: u16, queue: Arc<dyn VirtioQueueSource>) {
        if index == EVENT_QUEUE_INDEX {
            self.remapper
                .connect_fault_sink(Arc::new(FaultReporter::new(queue, self.memory.clone())));
        }
    }

    fn state_change(&mut self, state: &VirtioState) {
        match state {
            VirtioState::Running(running) => self.remapper.set_features(running.features),
            VirtioState::Unknown | VirtioState::Stopped => {}
        }
    }
}
