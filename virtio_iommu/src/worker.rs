// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transport-facing request processing and fault reporting.

use crate::protocol;
use crate::remapping::FaultInfo;
use crate::remapping::FaultReason;
use crate::remapping::FaultSink;
use crate::remapping::IommuRemapper;
use crate::remapping::RequestError;
use async_trait::async_trait;
use std::sync::Arc;
use virtio::VirtioQueueCallbackWork;
use virtio::VirtioQueueSource;
use virtio::VirtioQueueWorkerContext;
use vm_memory::GuestMemoryMmap;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Processes request-queue descriptor chains: decodes the request, runs it
/// against the remapper, and writes the status tail back.
pub struct RequestWorker {
    remapper: Arc<IommuRemapper>,
    mem: GuestMemoryMmap,
    probe_size: u32,
}

impl RequestWorker {
    pub(crate) fn new(remapper: Arc<IommuRemapper>, mem: GuestMemoryMmap, probe_size: u32) -> Self {
        Self {
            remapper,
            mem,
            probe_size,
        }
    }

    fn status_of(&self, result: Result<(), RequestError>) -> u8 {
        match result {
            Ok(()) => protocol::VIRTIO_IOMMU_S_OK,
            Err(err) => {
                tracing::debug!(error = &err as &dyn std::error::Error, "request failed");
                err.status()
            }
        }
    }

    fn handle_attach(&self, payload: &[u8]) -> u8 {
        let Ok((req, _)) = protocol::ReqAttach::read_from_prefix(payload) else {
            return protocol::VIRTIO_IOMMU_S_INVAL;
        };
        tracing::debug!(
            domain = req.domain.get(),
            endpoint = req.endpoint.get(),
            "attach"
        );
        self.status_of(self.remapper.attach(req.domain.get(), req.endpoint.get()))
    }

    fn handle_detach(&self, payload: &[u8]) -> u8 {
        let Ok((req, _)) = protocol::ReqDetach::read_from_prefix(payload) else {
            return protocol::VIRTIO_IOMMU_S_INVAL;
        };
        tracing::debug!(
            domain = req.domain.get(),
            endpoint = req.endpoint.get(),
            "detach"
        );
        self.status_of(self.remapper.detach(req.domain.get(), req.endpoint.get()))
    }

    fn handle_map(&self, payload: &[u8]) -> u8 {
        let Ok((req, _)) = protocol::ReqMap::read_from_prefix(payload) else {
            return protocol::VIRTIO_IOMMU_S_INVAL;
        };
        tracing::debug!(
            domain = req.domain.get(),
            virt_start = req.virt_start.get(),
            virt_end = req.virt_end.get(),
            phys_start = req.phys_start.get(),
            flags = req.flags.get(),
            "map"
        );
        self.status_of(self.remapper.map(
            req.domain.get(),
            req.virt_start.get(),
            req.virt_end.get(),
            req.phys_start.get(),
            req.flags.get(),
        ))
    }

    fn handle_unmap(&self, payload: &[u8]) -> u8 {
        let Ok((req, _)) = protocol::ReqUnmap::read_from_prefix(payload) else {
            return protocol::VIRTIO_IOMMU_S_INVAL;
        };
        tracing::debug!(
            domain = req.domain.get(),
            virt_start = req.virt_start.get(),
            virt_end = req.virt_end.get(),
            "unmap"
        );
        self.status_of(self.remapper.unmap(
            req.domain.get(),
            req.virt_start.get(),
            req.virt_end.get(),
        ))
    }

    /// Probe writes the property buffer and the tail in one go, so it owns
    /// the write-back instead of going through the common tail path.
    fn handle_probe(&self, payload: &[u8], mut work: VirtioQueueCallbackWork) -> bool {
        let probe_size = self.probe_size as usize;
        let buf_len = probe_size + size_of::<protocol::ReqTail>();
        if work.writable_len() < buf_len as u64 {
            tracing::error!("probe buffer smaller than configured probe size");
            work.detach();
            return false;
        }
        let mut buf = vec![0u8; buf_len];
        let status = match protocol::ReqProbe::read_from_prefix(payload) {
            Ok((req, _)) => {
                tracing::debug!(endpoint = req.endpoint.get(), "probe");
                self.status_of(
                    self.remapper
                        .fill_probe_properties(req.endpoint.get(), &mut buf[..probe_size]),
                )
            }
            Err(_) => protocol::VIRTIO_IOMMU_S_INVAL,
        };
        let tail = protocol::ReqTail {
            status,
            reserved: [0; 3],
        };
        buf[probe_size..].copy_from_slice(tail.as_bytes());
        if let Err(err) = work.write(&self.mem, &buf) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to write probe reply"
            );
            work.detach();
            return false;
        }
        work.complete(buf_len as u32);
        true
    }

    fn complete_with_status(&self, mut work: VirtioQueueCallbackWork, status: u8) -> bool {
        let tail = protocol::ReqTail {
            status,
            reserved: [0; 3],
        };
        if let Err(err) = work.write(&self.mem, tail.as_bytes()) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to write request status"
            );
            work.detach();
            return false;
        }
        work.complete(size_of::<protocol::ReqTail>() as u32);
        true
    }
}

#[async_trait]
impl VirtioQueueWorkerContext for RequestWorker {
    async fn process_work(&mut self, work: anyhow::Result<VirtioQueueCallbackWork>) -> bool {
        let work = match work {
            Ok(work) => work,
            Err(err) => {
                tracing::error!(
                    error = err.as_ref() as &dyn std::error::Error,
                    "failed processing request queue"
                );
                return false;
            }
        };

        // Every request carries at least a header out and a status tail
        // in; anything less means the transport handed us garbage.
        if work.readable_len() < size_of::<protocol::ReqHead>() as u64
            || work.writable_len() < size_of::<protocol::ReqTail>() as u64
        {
            tracing::error!("request chain too small for header and status");
            work.detach();
            return false;
        }

        let mut request = vec![0u8; work.readable_len() as usize];
        let read = match work.read(&self.mem, &mut request) {
            Ok(read) => read,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to read request"
                );
                work.detach();
                return false;
            }
        };

        let Ok((head, payload)) = protocol::ReqHead::read_from_prefix(&request[..read]) else {
            return self.complete_with_status(work, protocol::VIRTIO_IOMMU_S_DEVERR);
        };

        let status = match head.request_type {
            protocol::VIRTIO_IOMMU_T_ATTACH => self.handle_attach(payload),
            protocol::VIRTIO_IOMMU_T_DETACH => self.handle_detach(payload),
            protocol::VIRTIO_IOMMU_T_MAP => self.handle_map(payload),
            protocol::VIRTIO_IOMMU_T_UNMAP => self.handle_unmap(payload),
            protocol::VIRTIO_IOMMU_T_PROBE => return self.handle_probe(payload, work),
            request_type => {
                tracing::debug!(request_type, "unsupported request type");
                protocol::VIRTIO_IOMMU_S_UNSUPP
            }
        };
        self.complete_with_status(work, status)
    }
}

/// Posts fault records to the event queue. Faults are dropped, with a log
/// entry, when the driver has not posted a buffer.
pub struct FaultReporter {
    queue: Arc<dyn VirtioQueueSource>,
    mem: GuestMemoryMmap,
}

impl FaultReporter {
    pub(crate) fn new(queue: Arc<dyn VirtioQueueSource>, mem: GuestMemoryMmap) -> Self {
        Self { queue, mem }
    }
}

impl FaultSink for FaultReporter {
    fn report(&self, fault: FaultInfo) {
        let record = protocol::Fault {
            reason: match fault.reason {
                FaultReason::Unknown => protocol::VIRTIO_IOMMU_FAULT_R_UNKNOWN,
                FaultReason::Domain => protocol::VIRTIO_IOMMU_FAULT_R_DOMAIN,
                FaultReason::Mapping => protocol::VIRTIO_IOMMU_FAULT_R_MAPPING,
            },
            reserved: [0; 3],
            flags: fault.flags.into(),
            endpoint: fault.endpoint.into(),
            reserved2: [0; 4],
            address: fault.address.into(),
        };

        let mut work = loop {
            let Some(work) = self.queue.try_pop() else {
                tracing::warn!(
                    endpoint = fault.endpoint,
                    "no buffer available in event queue to report event"
                );
                return;
            };
            if work.writable_len() < size_of::<protocol::Fault>() as u64 {
                tracing::error!("event queue buffer too small for fault record");
                work.detach();
                continue;
            }
            break work;
        };

        if let Err(err) = work.write(&self.mem, record.as_bytes()) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to write fault record"
            );
            work.detach();
            return;
        }
        work.complete(size_of::<protocol::Fault>() as u32);
    }
}
