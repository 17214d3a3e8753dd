// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device-side virtio infrastructure.
//!
//! This crate defines the seam between a virtio device model and the
//! virtqueue transport that drives it: the descriptor-chain work items a
//! transport hands to a device, the worker context the device implements
//! for driver-initiated queues, and the non-blocking pop interface the
//! device uses for device-initiated queues. The transport itself (ring
//! parsing, notification, PCI/MMIO register emulation) lives elsewhere and
//! is independently thread-safe.

pub mod spec;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use vm_memory::Bytes;
use vm_memory::GuestAddress;
use vm_memory::GuestMemoryError;
use vm_memory::GuestMemoryMmap;

/// A single descriptor's buffer within a descriptor chain.
#[derive(Debug, Copy, Clone)]
pub struct VirtioQueuePayload {
    pub writeable: bool,
    pub address: u64,
    pub length: u32,
}

/// Completion interface for descriptors, implemented by the transport.
///
/// `complete_descriptor` writes the descriptor to the used ring and
/// notifies the guest if required. `detach_descriptor` drops the
/// descriptor without completing it; the transport treats this as a fatal
/// error for that descriptor and carries on.
pub trait DescriptorCompletion: Send + Sync {
    fn complete_descriptor(&self, descriptor_index: u16, bytes_written: u32);
    fn detach_descriptor(&self, descriptor_index: u16);
}

/// One descriptor chain popped from a virtqueue.
///
/// The chain's buffers appear in `payload` in ring order; device-readable
/// and device-writeable buffers may interleave. [`read`](Self::read) and
/// [`write_at_offset`](Self::write_at_offset) present each class as one
/// contiguous byte space.
pub struct VirtioQueueCallbackWork {
    pub payload: Vec<VirtioQueuePayload>,
    completion: Arc<dyn DescriptorCompletion>,
    descriptor_index: u16,
    completed: bool,
}

impl VirtioQueueCallbackWork {
    pub fn new(
        payload: Vec<VirtioQueuePayload>,
        completion: &Arc<dyn DescriptorCompletion>,
        descriptor_index: u16,
    ) -> Self {
        Self {
            payload,
            completion: completion.clone(),
            descriptor_index,
            completed: false,
        }
    }

    /// Returns the chain to the guest, reporting `bytes_written` bytes of
    /// device output.
    pub fn complete(&mut self, bytes_written: u32) {
        assert!(!self.completed, "descriptor completed twice");
        self.completed = true;
        self.completion
            .complete_descriptor(self.descriptor_index, bytes_written);
    }

    /// Drops the chain without writing a used element. The descriptor is
    /// lost to the guest; used when the chain is malformed.
    pub fn detach(mut self) {
        self.completed = true;
        self.completion.detach_descriptor(self.descriptor_index);
    }

    pub fn descriptor_index(&self) -> u16 {
        self.descriptor_index
    }

    /// Bytes of device-readable payload (buffers the driver filled in).
    pub fn readable_len(&self) -> u64 {
        self.len_of(false)
    }

    /// Bytes of device-writeable payload (buffers the driver expects the
    /// device to fill in).
    pub fn writable_len(&self) -> u64 {
        self.len_of(true)
    }

    fn len_of(&self, writeable: bool) -> u64 {
        self.payload
            .iter()
            .filter(|buf| buf.writeable == writeable)
            .map(|buf| buf.length as u64)
            .sum()
    }

    /// Copies the chain's readable bytes into `target`, stopping when
    /// either side runs out. Returns the byte count copied.
    pub fn read(&self, mem: &GuestMemoryMmap, target: &mut [u8]) -> Result<usize, GuestMemoryError> {
        let mut copied = 0;
        for buf in self.payload.iter().filter(|buf| !buf.writeable) {
            if copied == target.len() {
                break;
            }
            let chunk = (buf.length as usize).min(target.len() - copied);
            mem.read_slice(&mut target[copied..copied + chunk], GuestAddress(buf.address))?;
            copied += chunk;
        }
        Ok(copied)
    }

    /// Copies `source` into the chain's writeable buffers, starting
    /// `offset` bytes into the writeable space. Fails if the buffers end
    /// before `source` does.
    pub fn write_at_offset(
        &self,
        offset: u64,
        mem: &GuestMemoryMmap,
        source: &[u8],
    ) -> Result<(), VirtioWriteError> {
        // Where the current buffer begins within the writeable space.
        let mut start = 0u64;
        let mut written = 0;
        for buf in self.payload.iter().filter(|buf| buf.writeable) {
            if written == source.len() {
                break;
            }
            let len = buf.length as u64;
            if offset < start + len {
                let skip = offset.saturating_sub(start);
                let chunk = ((len - skip) as usize).min(source.len() - written);
                mem.write_slice(
                    &source[written..written + chunk],
                    GuestAddress(buf.address + skip),
                )?;
                written += chunk;
            }
            start += len;
        }
        if written == source.len() {
            Ok(())
        } else {
            Err(VirtioWriteError::NotAllWritten(source.len()))
        }
    }

    pub fn write(&self, mem: &GuestMemoryMmap, source: &[u8]) -> Result<(), VirtioWriteError> {
        self.write_at_offset(0, mem, source)
    }
}

#[derive(Debug, Error)]
pub enum VirtioWriteError {
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
    #[error("{0:#x} bytes not written")]
    NotAllWritten(usize),
}

impl Drop for VirtioQueueCallbackWork {
    fn drop(&mut self) {
        // Chains that were never explicitly finished go back to the guest
        // with nothing written.
        if !self.completed {
            self.completed = true;
            self.completion
                .complete_descriptor(self.descriptor_index, 0);
        }
    }
}

/// Per-queue work processor implemented by a device for queues the driver
/// initiates work on. The transport calls `process_work` for each popped
/// descriptor chain; returning false stops the queue.
#[async_trait]
pub trait VirtioQueueWorkerContext {
    async fn process_work(&mut self, work: anyhow::Result<VirtioQueueCallbackWork>) -> bool;
}

/// Non-blocking access to a virtqueue for device-initiated messages, such
/// as a fault/event queue on which the driver only posts buffers.
pub trait VirtioQueueSource: Send + Sync {
    /// Pops the next available descriptor chain, if any.
    fn try_pop(&self) -> Option<VirtioQueueCallbackWork>;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceTraits {
    pub device_id: u16,
    pub device_features: u64,
    pub max_queues: u16,
    pub device_register_length: u32,
}

pub struct VirtioRunningState {
    pub features: u64,
    pub enabled_queues: Vec<bool>,
}

pub enum VirtioState {
    Unknown,
    Running(VirtioRunningState),
    Stopped,
}

/// A virtio device model, driven by a transport.
pub trait VirtioDevice: Send {
    fn traits(&self) -> DeviceTraits;
    fn read_registers_u32(&self, offset: u16) -> u32;
    fn write_registers_u32(&mut self, offset: u16, val: u32);
    /// Returns the worker that processes driver-initiated work on queue
    /// `index`, or None if the queue is device-initiated and is instead
    /// connected through [`VirtioDevice::connect_device_queue`].
    fn get_work_callback(&mut self, index: u16) -> Option<Box<dyn VirtioQueueWorkerContext + Send>>;
    /// Hands the device a pop handle for a device-initiated queue.
    fn connect_device_queue(&mut self, index: u16, queue: Arc<dyn VirtioQueueSource>);
    fn state_change(&mut self, state: &VirtioState);
}
