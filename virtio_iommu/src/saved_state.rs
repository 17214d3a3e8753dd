// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Saved state for the remapping registries.
//!
//! Mappings are saved as `(interval, record)` pairs per domain; the
//! endpoint→domain back references are not saved and are reconstructed on
//! restore from the domains' endpoint lists. The encoding of these
//! structures is the caller's concern.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedMapping {
    pub low: u64,
    pub high: u64,
    pub phys_addr: u64,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedDomain {
    pub id: u32,
    pub endpoints: Vec<u32>,
    pub mappings: Vec<SavedMapping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedEndpoint {
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedState {
    pub endpoints: Vec<SavedEndpoint>,
    pub domains: Vec<SavedDomain>,
}

/// Failure to restore a [`SavedState`]. The device state is unchanged on
/// failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RestoreError {
    #[error("duplicate endpoint {0:#x}")]
    DuplicateEndpoint(u32),
    #[error("duplicate domain {0:#x}")]
    DuplicateDomain(u32),
    #[error("domain {domain:#x} lists unknown endpoint {endpoint:#x}")]
    UnknownEndpoint { domain: u32, endpoint: u32 },
    #[error("endpoint {0:#x} is listed by more than one domain")]
    EndpointInTwoDomains(u32),
    #[error("domain {domain:#x} contains invalid interval [{low:#x}, {high:#x}]")]
    InvalidInterval { domain: u32, low: u64, high: u64 },
    #[error("domain {domain:#x} contains overlapping mappings")]
    OverlappingMappings { domain: u32 },
}
