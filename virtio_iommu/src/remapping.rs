// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The address-remapping core: translation domains, endpoints, their
//! mappings, and the per-access translation path.
//!
//! A single mutex serializes every read and write of the registries. All
//! notifier and fault callbacks are invoked synchronously while that mutex
//! is held, so downstream shadow state cannot diverge from the
//! authoritative state across concurrent mutations; implementations of
//! [`MappingNotifier`] and [`FaultSink`] must not call back into this
//! module.

use crate::interval_tree::Interval;
use crate::interval_tree::IntervalTree;
use crate::interval_tree::OverlapError;
use crate::protocol;
use crate::saved_state::RestoreError;
use crate::saved_state::SavedDomain;
use crate::saved_state::SavedEndpoint;
use crate::saved_state::SavedMapping;
use crate::saved_state::SavedState;
use bitfield_struct::bitfield;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::IntoBytes;

/// Access directions requested by a DMA issuer.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct AccessFlags {
    pub read: bool,
    pub write: bool,
    #[bits(6)]
    _reserved: u8,
}

impl AccessFlags {
    pub fn is_none(&self) -> bool {
        !self.read() && !self.write()
    }
}

/// A translation record for one interval of I/O virtual address space.
/// `flags` uses the wire encoding (`protocol::VIRTIO_IOMMU_MAP_F_*`).
#[derive(Debug, Copy, Clone)]
pub struct Mapping {
    pub phys_addr: u64,
    pub flags: u32,
}

#[derive(Debug, Default)]
struct Endpoint {
    domain: Option<u32>,
}

#[derive(Default)]
struct Domain {
    mappings: IntervalTree<Mapping>,
    endpoints: BTreeSet<u32>,
}

/// Policy applied to a device-configured reserved region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReservedRegionType {
    /// All accesses fault.
    Reserved,
    /// Accesses pass through untranslated.
    Msi,
}

#[derive(Debug, Copy, Clone)]
pub struct ReservedRegion {
    pub interval: Interval,
    pub region_type: ReservedRegionType,
}

/// Downstream consumer of mapping install/invalidate events, typically a
/// component maintaining shadow translation structures for one endpoint.
///
/// Callbacks run synchronously under the core mutex and must not call
/// back into the remapper.
pub trait MappingNotifier: Send + Sync {
    fn notify_map(&self, iova: u64, paddr: u64, size: u64);
    fn notify_unmap(&self, iova: u64, size: u64);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultReason {
    /// The stream ID is not a known endpoint.
    Unknown,
    /// The endpoint is not attached to a domain.
    Domain,
    /// No mapping covers the address, or permissions were violated.
    Mapping,
}

/// A translation fault, reported asynchronously to the guest.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FaultInfo {
    pub reason: FaultReason,
    /// Wire encoding (`protocol::VIRTIO_IOMMU_FAULT_F_*`).
    pub flags: u32,
    pub endpoint: u32,
    pub address: u64,
}

/// Sink for translation faults. Invoked under the core mutex; must not
/// call back into the remapper.
pub trait FaultSink: Send + Sync {
    fn report(&self, fault: FaultInfo);
}

/// Result of a translation request.
#[derive(Debug, Copy, Clone)]
pub struct Translation {
    pub address: u64,
    /// Granted access; empty if the access is blocked.
    pub perms: AccessFlags,
    /// Page-granularity mask derived from the configured page-size mask.
    pub addr_mask: u64,
}

/// Synchronous per-access address translation, consumed by the DMA fabric.
pub trait DmaRemapping: Send + Sync {
    fn translate(&self, endpoint_id: u32, address: u64, access: AccessFlags) -> Translation;
}

/// Guest-visible request failures. The request worker maps these to wire
/// status codes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("unknown domain {0:#x}")]
    UnknownDomain(u32),
    #[error("unknown endpoint {0:#x}")]
    UnknownEndpoint(u32),
    #[error("endpoint {0:#x} is not attached to a domain")]
    NotAttached(u32),
    #[error("endpoint {endpoint:#x} is attached to domain {actual:#x}, not {requested:#x}")]
    DomainMismatch {
        endpoint: u32,
        requested: u32,
        actual: u32,
    },
    #[error("invalid range [{low:#x}, {high:#x}]")]
    InvalidRange { low: u64, high: u64 },
    #[error("[{:#x}, {:#x}] overlaps mapping [{:#x}, {:#x}]", .requested.low, .requested.high, .existing.low, .existing.high)]
    AlreadyMapped { requested: Interval, existing: Interval },
    #[error("unmap [{:#x}, {:#x}] would split mapping [{:#x}, {:#x}]", .requested.low, .requested.high, .existing.low, .existing.high)]
    WouldSplit { requested: Interval, existing: Interval },
    #[error("probe properties exceed the probe buffer size")]
    ProbeOverflow,
}

impl RequestError {
    /// The wire status code reported to the guest.
    pub fn status(&self) -> u8 {
        match self {
            RequestError::UnknownDomain(_) | RequestError::UnknownEndpoint(_) => {
                protocol::VIRTIO_IOMMU_S_NOENT
            }
            RequestError::NotAttached(_)
            | RequestError::DomainMismatch { .. }
            | RequestError::InvalidRange { .. }
            | RequestError::AlreadyMapped { .. }
            | RequestError::ProbeOverflow => protocol::VIRTIO_IOMMU_S_INVAL,
            RequestError::WouldSplit { .. } => protocol::VIRTIO_IOMMU_S_RANGE,
        }
    }
}

#[derive(Default)]
struct RemapperState {
    domains: BTreeMap<u32, Domain>,
    endpoints: BTreeMap<u32, Endpoint>,
    notifiers: BTreeMap<u32, Arc<dyn MappingNotifier>>,
    fault_sink: Option<Arc<dyn FaultSink>>,
    acked_features: u64,
}

/// The shared remapping state of a virtio-iommu device.
pub struct IommuRemapper {
    state: Mutex<RemapperState>,
    reserved_regions: Vec<ReservedRegion>,
    page_size_mask: u64,
}

/// Detaches `endpoint_id` from its current domain: invalidates every
/// mapping of the domain for a notifier watching the endpoint, unlinks
/// both sides, and drops the domain if it is left with neither endpoints
/// nor mappings. A domain with live endpoints is never dropped.
fn detach_endpoint_from_domain(
    domains: &mut BTreeMap<u32, Domain>,
    notifiers: &BTreeMap<u32, Arc<dyn MappingNotifier>>,
    endpoint_id: u32,
    ep: &mut Endpoint,
) {
    let Some(domain_id) = ep.domain.take() else {
        return;
    };
    let domain = domains
        .get_mut(&domain_id)
        .expect("bound endpoint references a live domain");
    if let Some(notifier) = notifiers.get(&endpoint_id) {
        for (interval, _) in domain.mappings.iter() {
            notifier.notify_unmap(interval.low, interval.size());
        }
    }
    assert!(domain.endpoints.remove(&endpoint_id));
    if domain.endpoints.is_empty() && domain.mappings.is_empty() {
        domains.remove(&domain_id);
    }
}

impl IommuRemapper {
    pub fn new(page_size_mask: u64, reserved_regions: Vec<ReservedRegion>) -> Self {
        assert_ne!(page_size_mask, 0);
        Self {
            state: Mutex::new(RemapperState::default()),
            reserved_regions,
            page_size_mask,
        }
    }

    /// Records the features acked by the driver; bypass behavior depends
    /// on `VIRTIO_IOMMU_F_BYPASS` being negotiated.
    pub fn set_features(&self, features: u64) {
        tracing::debug!(features, "driver features");
        self.state.lock().acked_features = features;
    }

    /// Installs the sink that posts translation faults to the guest.
    pub fn connect_fault_sink(&self, sink: Arc<dyn FaultSink>) {
        self.state.lock().fault_sink = Some(sink);
    }

    /// Subscribes a notifier for one endpoint. Replaces any previous
    /// notifier for the same endpoint.
    pub fn register_notifier(&self, endpoint_id: u32, notifier: Arc<dyn MappingNotifier>) {
        self.state.lock().notifiers.insert(endpoint_id, notifier);
    }

    pub fn unregister_notifier(&self, endpoint_id: u32) {
        self.state.lock().notifiers.remove(&endpoint_id);
    }

    /// Re-emits the endpoint's live mappings to its notifier so a
    /// downstream consumer can rebuild shadow state. Each mapping is
    /// invalidated before it is installed, so stale entries predating the
    /// current domain are dropped and replaying twice is equivalent to
    /// replaying once.
    pub fn replay(&self, endpoint_id: u32) {
        let state = self.state.lock();
        let Some(notifier) = state.notifiers.get(&endpoint_id) else {
            return;
        };
        let Some(domain_id) = state.endpoints.get(&endpoint_id).and_then(|ep| ep.domain) else {
            return;
        };
        let domain = state
            .domains
            .get(&domain_id)
            .expect("bound endpoint references a live domain");
        for (interval, mapping) in domain.mappings.iter() {
            notifier.notify_unmap(interval.low, interval.size());
            notifier.notify_map(interval.low, mapping.phys_addr, interval.size());
        }
    }

    /// Drops all domains and endpoints, invalidating downstream shadow
    /// state first. Notifier subscriptions are host-side state and
    /// survive.
    pub fn reset(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let endpoints = std::mem::take(&mut state.endpoints);
        for (endpoint_id, mut ep) in endpoints {
            detach_endpoint_from_domain(&mut state.domains, &state.notifiers, endpoint_id, &mut ep);
        }
        state.domains.clear();
    }

    pub(crate) fn attach(&self, domain_id: u32, endpoint_id: u32) -> Result<(), RequestError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        // Attach is the only request that may create endpoints or domains.
        let ep = state.endpoints.entry(endpoint_id).or_default();
        if ep.domain.is_some() {
            // Already attached to a domain; fully detach it first.
            detach_endpoint_from_domain(&mut state.domains, &state.notifiers, endpoint_id, ep);
        }
        let domain = state.domains.entry(domain_id).or_default();
        domain.endpoints.insert(endpoint_id);
        ep.domain = Some(domain_id);
        // Replay the domain's existing mappings to the new member.
        if let Some(notifier) = state.notifiers.get(&endpoint_id) {
            for (interval, mapping) in domain.mappings.iter() {
                notifier.notify_map(interval.low, mapping.phys_addr, interval.size());
            }
        }
        Ok(())
    }

    pub(crate) fn detach(&self, domain_id: u32, endpoint_id: u32) -> Result<(), RequestError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ep = state
            .endpoints
            .get_mut(&endpoint_id)
            .ok_or(RequestError::UnknownEndpoint(endpoint_id))?;
        let actual = ep.domain.ok_or(RequestError::NotAttached(endpoint_id))?;
        if actual != domain_id {
            return Err(RequestError::DomainMismatch {
                endpoint: endpoint_id,
                requested: domain_id,
                actual,
            });
        }
        detach_endpoint_from_domain(&mut state.domains, &state.notifiers, endpoint_id, ep);
        Ok(())
    }

    pub(crate) fn map(
        &self,
        domain_id: u32,
        virt_start: u64,
        virt_end: u64,
        phys_start: u64,
        flags: u32,
    ) -> Result<(), RequestError> {
        if virt_start > virt_end {
            return Err(RequestError::InvalidRange {
                low: virt_start,
                high: virt_end,
            });
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let domain = state
            .domains
            .get_mut(&domain_id)
            .ok_or(RequestError::UnknownDomain(domain_id))?;
        let interval = Interval::new(virt_start, virt_end);
        let mapping = Mapping {
            phys_addr: phys_start,
            flags,
        };
        domain
            .mappings
            .insert(interval, mapping)
            .map_err(|OverlapError(existing)| RequestError::AlreadyMapped {
                requested: interval,
                existing,
            })?;
        // All endpoints of a domain share its mappings.
        for (endpoint_id, notifier) in &state.notifiers {
            if domain.endpoints.contains(endpoint_id) {
                notifier.notify_map(virt_start, phys_start, interval.size());
            }
        }
        Ok(())
    }

    pub(crate) fn unmap(
        &self,
        domain_id: u32,
        virt_start: u64,
        virt_end: u64,
    ) -> Result<(), RequestError> {
        if virt_start > virt_end {
            return Err(RequestError::InvalidRange {
                low: virt_start,
                high: virt_end,
            });
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(domain) = state.domains.get_mut(&domain_id) else {
            tracing::warn!(domain_id, "unmap for unknown domain");
            return Err(RequestError::UnknownDomain(domain_id));
        };
        let requested = Interval::new(virt_start, virt_end);
        let mut result = Ok(());
        // Remove every mapping the request fully covers. A mapping the
        // request would split stops the walk; removals already performed
        // are not rolled back.
        while let Some((existing, _)) = domain.mappings.find(&requested) {
            if requested.covers(&existing) {
                domain.mappings.remove(&existing);
                for (endpoint_id, notifier) in &state.notifiers {
                    if domain.endpoints.contains(endpoint_id) {
                        notifier.notify_unmap(existing.low, existing.size());
                    }
                }
            } else {
                tracing::warn!(
                    domain_id,
                    requested_low = requested.low,
                    requested_high = requested.high,
                    existing_low = existing.low,
                    existing_high = existing.high,
                    "unmap would split existing mapping"
                );
                result = Err(RequestError::WouldSplit { requested, existing });
                break;
            }
        }
        let drop_domain = domain.endpoints.is_empty() && domain.mappings.is_empty();
        if drop_domain {
            state.domains.remove(&domain_id);
        }
        result
    }

    /// Fills `buf` with one RESV_MEM property per configured reserved
    /// region, followed by a terminator property.
    pub(crate) fn fill_probe_properties(
        &self,
        endpoint_id: u32,
        buf: &mut [u8],
    ) -> Result<(), RequestError> {
        let terminator_len = size_of::<protocol::ProbeProperty>();
        let prop_len = size_of::<protocol::ProbeProperty>() + size_of::<protocol::ProbeResvMem>();
        let free = buf.len().saturating_sub(terminator_len);
        if prop_len * self.reserved_regions.len() > free {
            return Err(RequestError::ProbeOverflow);
        }
        let mut offset = 0;
        for region in &self.reserved_regions {
            tracing::debug!(
                endpoint_id,
                start = region.interval.low,
                end = region.interval.high,
                region_type = ?region.region_type,
                "probe resv property"
            );
            let head = protocol::ProbeProperty {
                property_type: protocol::VIRTIO_IOMMU_PROBE_T_RESV_MEM.into(),
                length: (size_of::<protocol::ProbeResvMem>() as u16).into(),
            };
            let body = protocol::ProbeResvMem {
                subtype: match region.region_type {
                    ReservedRegionType::Reserved => protocol::VIRTIO_IOMMU_RESV_MEM_T_RESERVED,
                    ReservedRegionType::Msi => protocol::VIRTIO_IOMMU_RESV_MEM_T_MSI,
                },
                reserved: [0; 3],
                start: region.interval.low.into(),
                end: region.interval.high.into(),
            };
            buf[offset..offset + terminator_len].copy_from_slice(head.as_bytes());
            offset += terminator_len;
            buf[offset..offset + size_of::<protocol::ProbeResvMem>()]
                .copy_from_slice(body.as_bytes());
            offset += size_of::<protocol::ProbeResvMem>();
        }
        let terminator = protocol::ProbeProperty {
            property_type: protocol::VIRTIO_IOMMU_PROBE_T_NONE.into(),
            length: 0.into(),
        };
        buf[offset..offset + terminator_len].copy_from_slice(terminator.as_bytes());
        Ok(())
    }

    pub(crate) fn save(&self) -> SavedState {
        let state = self.state.lock();
        SavedState {
            endpoints: state
                .endpoints
                .keys()
                .map(|&id| SavedEndpoint { id })
                .collect(),
            domains: state
                .domains
                .iter()
                .map(|(&id, domain)| SavedDomain {
                    id,
                    endpoints: domain.endpoints.iter().copied().collect(),
                    mappings: domain
                        .mappings
                        .iter()
                        .map(|(interval, mapping)| SavedMapping {
                            low: interval.low,
                            high: interval.high,
                            phys_addr: mapping.phys_addr,
                            flags: mapping.flags,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    pub(crate) fn restore(&self, saved: SavedState) -> Result<(), RestoreError> {
        let mut endpoints = BTreeMap::new();
        for SavedEndpoint { id } in saved.endpoints {
            if endpoints.insert(id, Endpoint::default()).is_some() {
                return Err(RestoreError::DuplicateEndpoint(id));
            }
        }
        let mut domains = BTreeMap::new();
        for saved_domain in saved.domains {
            let mut mappings = IntervalTree::new();
            for saved_mapping in saved_domain.mappings {
                if saved_mapping.low > saved_mapping.high {
                    return Err(RestoreError::InvalidInterval {
                        domain: saved_domain.id,
                        low: saved_mapping.low,
                        high: saved_mapping.high,
                    });
                }
                mappings
                    .insert(
                        Interval::new(saved_mapping.low, saved_mapping.high),
                        Mapping {
                            phys_addr: saved_mapping.phys_addr,
                            flags: saved_mapping.flags,
                        },
                    )
                    .map_err(|_| RestoreError::OverlappingMappings {
                        domain: saved_domain.id,
                    })?;
            }
            // Reconstruct the endpoint back references from the domain's
            // endpoint list.
            let mut members = BTreeSet::new();
            for endpoint_id in saved_domain.endpoints {
                let ep = endpoints
                    .get_mut(&endpoint_id)
                    .ok_or(RestoreError::UnknownEndpoint {
                        domain: saved_domain.id,
                        endpoint: endpoint_id,
                    })?;
                if ep.domain.is_some() {
                    return Err(RestoreError::EndpointInTwoDomains(endpoint_id));
                }
                ep.domain = Some(saved_domain.id);
                members.insert(endpoint_id);
            }
            let domain = Domain {
                mappings,
                endpoints: members,
            };
            if domains.insert(saved_domain.id, domain).is_some() {
                return Err(RestoreError::DuplicateDomain(saved_domain.id));
            }
        }
        let mut state = self.state.lock();
        state.endpoints = endpoints;
        state.domains = domains;
        Ok(())
    }

    fn addr_mask(&self) -> u64 {
        (1u64 << self.page_size_mask.trailing_zeros()) - 1
    }
}

fn report_fault(state: &RemapperState, fault: FaultInfo) {
    match &state.fault_sink {
        Some(sink) => sink.report(fault),
        None => tracing::debug!(?fault, "fault dropped, no event queue connected"),
    }
}

impl DmaRemapping for IommuRemapper {
    fn translate(&self, endpoint_id: u32, address: u64, access: AccessFlags) -> Translation {
        let state = self.state.lock();
        let bypass_allowed =
            state.acked_features & protocol::VIRTIO_IOMMU_F_BYPASS as u64 != 0;
        let addr_mask = self.addr_mask();
        let blocked = Translation {
            address,
            perms: AccessFlags::new(),
            addr_mask,
        };
        let identity = Translation {
            address,
            perms: access,
            addr_mask,
        };

        let Some(ep) = state.endpoints.get(&endpoint_id) else {
            if bypass_allowed {
                return identity;
            }
            tracing::warn!(endpoint_id, "translation for unknown endpoint");
            report_fault(
                &state,
                FaultInfo {
                    reason: FaultReason::Unknown,
                    flags: 0,
                    endpoint: endpoint_id,
                    address: 0,
                },
            );
            return blocked;
        };

        for region in &self.reserved_regions {
            if region.interval.contains(address) {
                match region.region_type {
                    ReservedRegionType::Msi => return identity,
                    ReservedRegionType::Reserved => {
                        report_fault(
                            &state,
                            FaultInfo {
                                reason: FaultReason::Mapping,
                                flags: 0,
                                endpoint: endpoint_id,
                                address,
                            },
                        );
                        return blocked;
                    }
                }
            }
        }

        let Some(domain_id) = ep.domain else {
            if bypass_allowed {
                return identity;
            }
            tracing::warn!(endpoint_id, "endpoint not attached to any domain");
            report_fault(
                &state,
                FaultInfo {
                    reason: FaultReason::Domain,
                    flags: 0,
                    endpoint: endpoint_id,
                    address: 0,
                },
            );
            return blocked;
        };
        let domain = state
            .domains
            .get(&domain_id)
            .expect("bound endpoint references a live domain");

        let Some((interval, mapping)) = domain.mappings.find_containing(address) else {
            tracing::warn!(endpoint_id, address, "no mapping for address");
            report_fault(
                &state,
                FaultInfo {
                    reason: FaultReason::Mapping,
                    flags: 0,
                    endpoint: endpoint_id,
                    address,
                },
            );
            return blocked;
        };

        let read_fault =
            access.read() && mapping.flags & protocol::VIRTIO_IOMMU_MAP_F_READ == 0;
        let write_fault =
            access.write() && mapping.flags & protocol::VIRTIO_IOMMU_MAP_F_WRITE == 0;
        if read_fault || write_fault {
            let mut flags = 0;
            if read_fault {
                flags |= protocol::VIRTIO_IOMMU_FAULT_F_READ;
            }
            if write_fault {
                flags |= protocol::VIRTIO_IOMMU_FAULT_F_WRITE;
            }
            flags |= protocol::VIRTIO_IOMMU_FAULT_F_ADDRESS;
            tracing::warn!(
                endpoint_id,
                address,
                allowed = mapping.flags,
                "permission error"
            );
            report_fault(
                &state,
                FaultInfo {
                    reason: FaultReason::Mapping,
                    flags,
                    endpoint: endpoint_id,
                    address,
                },
            );
            return blocked;
        }

        Translation {
            address: address - interval.low + mapping.phys_addr,
            perms: access,
            addr_mask,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const PAGE_MASK_4K: u64 = !0xfff;

    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    enum Event {
        Map { iova: u64, paddr: u64, size: u64 },
        Unmap { iova: u64, size: u64 },
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl MappingNotifier for Recorder {
        fn notify_map(&self, iova: u64, paddr: u64, size: u64) {
            self.events.lock().push(Event::Map { iova, paddr, size });
        }

        fn notify_unmap(&self, iova: u64, size: u64) {
            self.events.lock().push(Event::Unmap { iova, size });
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    #[derive(Default)]
    struct FaultRecorder {
        faults: Mutex<Vec<FaultInfo>>,
    }

    impl FaultSink for FaultRecorder {
        fn report(&self, fault: FaultInfo) {
            self.faults.lock().push(fault);
        }
    }

    impl FaultRecorder {
        fn take(&self) -> Vec<FaultInfo> {
            std::mem::take(&mut *self.faults.lock())
        }
    }

    fn read() -> AccessFlags {
        AccessFlags::new().with_read(true)
    }

    fn write() -> AccessFlags {
        AccessFlags::new().with_write(true)
    }

    fn remapper() -> IommuRemapper {
        IommuRemapper::new(PAGE_MASK_4K, Vec::new())
    }

    fn remapper_with_faults(
        reserved_regions: Vec<ReservedRegion>,
    ) -> (IommuRemapper, Arc<FaultRecorder>) {
        let remapper = IommuRemapper::new(PAGE_MASK_4K, reserved_regions);
        let faults = Arc::new(FaultRecorder::default());
        remapper.connect_fault_sink(faults.clone());
        (remapper, faults)
    }

    #[test]
    fn translate_with_reserved_regions() {
        let (remapper, faults) = remapper_with_faults(vec![
            ReservedRegion {
                interval: Interval::new(0x0, 0xfff),
                region_type: ReservedRegionType::Reserved,
            },
            ReservedRegion {
                interval: Interval::new(0xfee0_0000, 0xfeef_ffff),
                region_type: ReservedRegionType::Msi,
            },
        ]);
        remapper.attach(7, 0x0100).unwrap();
        remapper
            .map(
                7,
                0x1000,
                0x1fff,
                0xaaaa_0000,
                protocol::VIRTIO_IOMMU_MAP_F_READ | protocol::VIRTIO_IOMMU_MAP_F_WRITE,
            )
            .unwrap();

        // Mapped access translates with the requested permission.
        let t = remapper.translate(0x0100, 0x1800, read());
        assert_eq!(t.address, 0xaaaa_0800);
        assert_eq!(t.perms, read());
        assert_eq!(t.addr_mask, 0xfff);
        assert!(faults.take().is_empty());

        // MSI regions pass through untranslated.
        let t = remapper.translate(0x0100, 0xfee0_1234, write());
        assert_eq!(t.address, 0xfee0_1234);
        assert_eq!(t.perms, write());
        assert!(faults.take().is_empty());

        // RESERVED regions reject with a mapping fault.
        let t = remapper.translate(0x0100, 0x200, read());
        assert!(t.perms.is_none());
        assert_eq!(
            faults.take(),
            [FaultInfo {
                reason: FaultReason::Mapping,
                flags: 0,
                endpoint: 0x0100,
                address: 0x200,
            }]
        );

        // Unmapped addresses fault.
        let t = remapper.translate(0x0100, 0x3000, read());
        assert!(t.perms.is_none());
        assert_eq!(
            faults.take(),
            [FaultInfo {
                reason: FaultReason::Mapping,
                flags: 0,
                endpoint: 0x0100,
                address: 0x3000,
            }]
        );
    }

    #[test]
    fn permission_fault_carries_direction_and_address() {
        let (remapper, faults) = remapper_with_faults(Vec::new());
        remapper.attach(1, 10).unwrap();
        remapper
            .map(1, 0x1000, 0x1fff, 0x8000, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();

        let t = remapper.translate(10, 0x1400, write());
        assert!(t.perms.is_none());
        assert_eq!(
            faults.take(),
            [FaultInfo {
                reason: FaultReason::Mapping,
                flags: protocol::VIRTIO_IOMMU_FAULT_F_WRITE | protocol::VIRTIO_IOMMU_FAULT_F_ADDRESS,
                endpoint: 10,
                address: 0x1400,
            }]
        );

        // The readable direction still translates.
        let t = remapper.translate(10, 0x1400, read());
        assert_eq!(t.address, 0x8400);
        assert_eq!(t.perms, read());
    }

    #[test]
    fn bypass_applies_only_without_endpoint_or_domain() {
        let (remapper, faults) = remapper_with_faults(Vec::new());

        // Without BYPASS, an unknown stream ID faults.
        let t = remapper.translate(0x42, 0x5000, read());
        assert!(t.perms.is_none());
        assert_eq!(
            faults.take(),
            [FaultInfo {
                reason: FaultReason::Unknown,
                flags: 0,
                endpoint: 0x42,
                address: 0,
            }]
        );

        // With BYPASS, the same access is an identity translation.
        remapper.set_features(protocol::VIRTIO_IOMMU_F_BYPASS as u64);
        let t = remapper.translate(0x42, 0x5000, read());
        assert_eq!(t.address, 0x5000);
        assert_eq!(t.perms, read());
        assert!(faults.take().is_empty());

        // Once an endpoint has a domain, mappings are authoritative and
        // bypass is ignored.
        remapper.attach(1, 0x42).unwrap();
        let t = remapper.translate(0x42, 0x5000, read());
        assert!(t.perms.is_none());
        assert_eq!(faults.take()[0].reason, FaultReason::Mapping);
    }

    #[test]
    fn unattached_endpoint_faults_domain() {
        let (remapper, faults) = remapper_with_faults(Vec::new());
        remapper.attach(1, 5).unwrap();
        remapper.detach(1, 5).unwrap();

        let t = remapper.translate(5, 0x1000, read());
        assert!(t.perms.is_none());
        assert_eq!(
            faults.take(),
            [FaultInfo {
                reason: FaultReason::Domain,
                flags: 0,
                endpoint: 5,
                address: 0,
            }]
        );
    }

    #[test]
    fn map_rejects_overlap_and_unmap_refuses_split() {
        let remapper = remapper();
        remapper.attach(1, 9).unwrap();
        remapper
            .map(1, 0, 0xffff, 0, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        assert!(matches!(
            remapper.map(1, 0x0800, 0x0fff, 0, protocol::VIRTIO_IOMMU_MAP_F_READ),
            Err(RequestError::AlreadyMapped { .. })
        ));
        assert!(matches!(
            remapper.unmap(1, 0x0800, 0x0fff),
            Err(RequestError::WouldSplit { .. })
        ));
        remapper.unmap(1, 0, 0xffff).unwrap();
        // The range is gone now.
        assert!(remapper.translate(9, 0x100, read()).perms.is_none());
    }

    #[test]
    fn partial_unmap_commits_covered_prefix() {
        let remapper = remapper();
        remapper.attach(1, 9).unwrap();
        let notifier = Arc::new(Recorder::default());
        remapper.register_notifier(9, notifier.clone());
        for (low, high) in [(0, 0xfff), (0x1000, 0x1fff), (0x3000, 0x4fff)] {
            remapper
                .map(1, low, high, low, protocol::VIRTIO_IOMMU_MAP_F_READ)
                .unwrap();
        }
        notifier.take();

        let err = remapper.unmap(1, 0, 0x3fff).unwrap_err();
        assert!(matches!(err, RequestError::WouldSplit { existing, .. }
            if existing.low == 0x3000 && existing.high == 0x4fff));

        // The first two mappings were removed and invalidated; the
        // splitting mapping is untouched. The walk removes covered
        // mappings in whatever order lookup finds them.
        let mut events = notifier.take();
        events.sort_by_key(|event| match *event {
            Event::Map { iova, .. } | Event::Unmap { iova, .. } => iova,
        });
        assert_eq!(
            events,
            [
                Event::Unmap { iova: 0, size: 0x1000 },
                Event::Unmap {
                    iova: 0x1000,
                    size: 0x1000
                },
            ]
        );
        assert!(remapper.translate(9, 0x0800, read()).perms.is_none());
        assert!(remapper.translate(9, 0x1800, read()).perms.is_none());
        assert_eq!(remapper.translate(9, 0x3800, read()).address, 0x3800);
    }

    #[test]
    fn attach_switch_invalidates_then_installs() {
        let remapper = remapper();
        let notifier = Arc::new(Recorder::default());
        remapper.register_notifier(0xa, notifier.clone());

        remapper.attach(1, 0xa).unwrap();
        remapper
            .map(1, 0x1000, 0x1fff, 0x10_0000, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        // Seed the target domain through a second endpoint.
        remapper.attach(2, 0xb).unwrap();
        remapper
            .map(2, 0x7000, 0x7fff, 0x20_0000, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        notifier.take();

        remapper.attach(2, 0xa).unwrap();
        assert_eq!(
            notifier.take(),
            [
                Event::Unmap {
                    iova: 0x1000,
                    size: 0x1000
                },
                Event::Map {
                    iova: 0x7000,
                    paddr: 0x20_0000,
                    size: 0x1000
                },
            ]
        );

        // The endpoint now translates through the new domain only.
        assert_eq!(remapper.translate(0xa, 0x7800, read()).address, 0x20_0800);
        assert!(remapper.translate(0xa, 0x1800, read()).perms.is_none());
    }

    #[test]
    fn map_fans_out_to_all_domain_endpoints() {
        let remapper = remapper();
        let watcher_a = Arc::new(Recorder::default());
        let watcher_b = Arc::new(Recorder::default());
        let bystander = Arc::new(Recorder::default());
        remapper.register_notifier(1, watcher_a.clone());
        remapper.register_notifier(2, watcher_b.clone());
        remapper.register_notifier(3, bystander.clone());
        remapper.attach(7, 1).unwrap();
        remapper.attach(7, 2).unwrap();
        remapper.attach(8, 3).unwrap();

        remapper
            .map(7, 0x2000, 0x2fff, 0x9000, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        let expected = Event::Map {
            iova: 0x2000,
            paddr: 0x9000,
            size: 0x1000,
        };
        assert_eq!(watcher_a.take(), [expected]);
        assert_eq!(watcher_b.take(), [expected]);
        assert!(bystander.take().is_empty());
    }

    #[test]
    fn detach_validates_request() {
        let remapper = remapper();
        assert_eq!(
            remapper.detach(1, 5),
            Err(RequestError::UnknownEndpoint(5))
        );
        remapper.attach(1, 5).unwrap();
        remapper.detach(1, 5).unwrap();
        assert_eq!(remapper.detach(1, 5), Err(RequestError::NotAttached(5)));
        remapper.attach(1, 5).unwrap();
        assert_eq!(
            remapper.detach(2, 5),
            Err(RequestError::DomainMismatch {
                endpoint: 5,
                requested: 2,
                actual: 1
            })
        );
        // The binding is intact after the failed detach.
        remapper.detach(1, 5).unwrap();
    }

    #[test]
    fn map_and_unmap_require_existing_domain() {
        let remapper = remapper();
        assert_eq!(
            remapper.map(3, 0, 0xfff, 0, protocol::VIRTIO_IOMMU_MAP_F_READ),
            Err(RequestError::UnknownDomain(3))
        );
        assert_eq!(
            remapper.unmap(3, 0, 0xfff),
            Err(RequestError::UnknownDomain(3))
        );
    }

    #[test]
    fn inverted_range_is_invalid() {
        let remapper = remapper();
        remapper.attach(1, 5).unwrap();
        assert!(matches!(
            remapper.map(1, 0x2000, 0x1fff, 0, protocol::VIRTIO_IOMMU_MAP_F_READ),
            Err(RequestError::InvalidRange { .. })
        ));
        assert!(matches!(
            remapper.unmap(1, 0x2000, 0x1fff),
            Err(RequestError::InvalidRange { .. })
        ));
    }

    #[test]
    fn domain_outlives_detach_while_it_has_mappings() {
        let remapper = remapper();
        remapper.attach(1, 5).unwrap();
        remapper
            .map(1, 0x1000, 0x1fff, 0x4000, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        remapper.detach(1, 5).unwrap();

        // The domain still exists because it has mappings: map/unmap
        // still address it, and a re-attach sees the old mapping.
        remapper
            .map(1, 0x5000, 0x5fff, 0x6000, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        remapper.attach(1, 5).unwrap();
        assert_eq!(remapper.translate(5, 0x1400, read()).address, 0x4400);
        remapper.detach(1, 5).unwrap();

        // Unmapping the last mapping of the endpoint-less domain drops it.
        remapper.unmap(1, 0x1000, 0x5fff).unwrap();
        assert_eq!(
            remapper.unmap(1, 0, 0xfff),
            Err(RequestError::UnknownDomain(1))
        );
    }

    #[test]
    fn empty_domain_dropped_with_last_endpoint() {
        let remapper = remapper();
        remapper.attach(1, 5).unwrap();
        remapper.attach(1, 6).unwrap();
        remapper.detach(1, 5).unwrap();
        // Still alive: endpoint 6 holds it.
        remapper
            .map(1, 0, 0xfff, 0, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        remapper.unmap(1, 0, 0xfff).unwrap();
        remapper.detach(1, 6).unwrap();
        assert_eq!(
            remapper.unmap(1, 0, 0xfff),
            Err(RequestError::UnknownDomain(1))
        );
    }

    #[test]
    fn detach_erases_visibility() {
        let (remapper, faults) = remapper_with_faults(Vec::new());
        remapper.attach(1, 5).unwrap();
        remapper
            .map(1, 0, 0xffff, 0x8_0000, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        assert_eq!(remapper.translate(5, 0x100, read()).address, 0x8_0100);
        faults.take();

        remapper.detach(1, 5).unwrap();
        for address in [0x100u64, 0x8000, 0xffff] {
            assert!(remapper.translate(5, address, read()).perms.is_none());
        }
        assert!(faults.take().iter().all(|f| f.reason == FaultReason::Domain));
    }

    fn shadow_apply(shadow: &mut BTreeMap<u64, (u64, u64)>, events: &[Event]) {
        for event in events {
            match *event {
                Event::Map { iova, paddr, size } => {
                    shadow.insert(iova, (paddr, size));
                }
                Event::Unmap { iova, .. } => {
                    shadow.remove(&iova);
                }
            }
        }
    }

    #[test]
    fn replay_is_idempotent() {
        let remapper = remapper();
        let notifier = Arc::new(Recorder::default());
        remapper.register_notifier(5, notifier.clone());
        remapper.attach(1, 5).unwrap();
        remapper
            .map(1, 0x1000, 0x1fff, 0xa000, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        remapper
            .map(1, 0x4000, 0x5fff, 0xb000, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        // Stale shadow state predating the replay.
        let mut shadow = BTreeMap::new();
        shadow.insert(0x1000, (0xdead, 0x1000));
        notifier.take();

        remapper.replay(5);
        shadow_apply(&mut shadow, &notifier.take());
        let after_once = shadow.clone();
        assert_eq!(
            after_once.get(&0x1000),
            Some(&(0xa000, 0x1000)),
            "stale entry replaced"
        );
        assert_eq!(after_once.len(), 2);

        remapper.replay(5);
        shadow_apply(&mut shadow, &notifier.take());
        assert_eq!(shadow, after_once);
    }

    #[test]
    fn replay_without_binding_is_a_no_op() {
        let remapper = remapper();
        let notifier = Arc::new(Recorder::default());
        remapper.register_notifier(5, notifier.clone());
        remapper.replay(5);
        remapper.attach(1, 5).unwrap();
        remapper.detach(1, 5).unwrap();
        notifier.take();
        remapper.replay(5);
        assert!(notifier.take().is_empty());
    }

    #[test]
    fn unregistered_notifier_stops_receiving() {
        let remapper = remapper();
        let notifier = Arc::new(Recorder::default());
        remapper.register_notifier(5, notifier.clone());
        remapper.attach(1, 5).unwrap();
        remapper
            .map(1, 0, 0xfff, 0, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        assert_eq!(notifier.take().len(), 1);

        remapper.unregister_notifier(5);
        remapper.unmap(1, 0, 0xfff).unwrap();
        assert!(notifier.take().is_empty());
    }

    #[test]
    fn reset_invalidates_and_clears() {
        let remapper = remapper();
        let notifier = Arc::new(Recorder::default());
        remapper.register_notifier(5, notifier.clone());
        remapper.attach(1, 5).unwrap();
        remapper
            .map(1, 0x1000, 0x1fff, 0, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        notifier.take();

        remapper.reset();
        assert_eq!(
            notifier.take(),
            [Event::Unmap {
                iova: 0x1000,
                size: 0x1000
            }]
        );
        assert_eq!(remapper.detach(1, 5), Err(RequestError::UnknownEndpoint(5)));
        assert_eq!(
            remapper.map(1, 0, 0xfff, 0, protocol::VIRTIO_IOMMU_MAP_F_READ),
            Err(RequestError::UnknownDomain(1))
        );

        // Notifier subscriptions survive a reset.
        remapper.attach(1, 5).unwrap();
        remapper
            .map(1, 0, 0xfff, 0, protocol::VIRTIO_IOMMU_MAP_F_READ)
            .unwrap();
        assert_eq!(notifier.take().len(), 1);
    }

    #[test]
    fn probe_properties_fit_or_overflow() {
        let region = ReservedRegion {
            interval: Interval::new(0x1000, 0x1fff),
            region_type: ReservedRegionType::Reserved,
        };
        let prop_len = size_of::<protocol::ProbeProperty>() + size_of::<protocol::ProbeResvMem>();

        // 21 properties of 24 bytes plus the terminator fit in 512 bytes.
        let remapper = IommuRemapper::new(PAGE_MASK_4K, vec![region; 21]);
        let mut buf = [0u8; 512];
        remapper.fill_probe_properties(0, &mut buf).unwrap();
        assert_eq!(buf[21 * prop_len], 0);

        // One more does not.
        let remapper = IommuRemapper::new(PAGE_MASK_4K, vec![region; 22]);
        assert_eq!(
            remapper.fill_probe_properties(0, &mut buf),
            Err(RequestError::ProbeOverflow)
        );
    }
}
