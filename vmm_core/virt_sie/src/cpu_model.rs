// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest CPU model negotiation.
//!
//! A VM starts with the full host model and may replace it once, before the
//! first vCPU exists, to present an older or reduced processor to the
//! guest. Capability sets are always restricted to what the host can
//! interpret; a guest can never claim more than the host.

use crate::SiePartition;
use crate::hardware::CpuIdentity;
use crate::hardware::SieHardware;
use siedef::FacilitySet;
use siedef::FeatureSet;
use siedef::SubfunctionSet;
use thiserror::Error;

/// The host capabilities relevant to guest interpretation, probed once at
/// partition creation.
#[derive(Debug, Clone)]
pub struct HostCapabilities {
    /// Facility bits the hardware can interpret for a guest.
    pub facilities: FacilitySet,
    /// Optional features the engine can virtualize.
    pub features: FeatureSet,
    /// Subfunction blocks sampled on the host.
    pub subfunctions: SubfunctionSet,
    /// The host processor identification.
    pub identity: CpuIdentity,
}

impl HostCapabilities {
    pub(crate) fn probe(hardware: &dyn SieHardware) -> Self {
        Self {
            facilities: hardware.host_facilities(),
            features: hardware.host_features(),
            subfunctions: hardware.host_subfunctions(),
            identity: hardware.host_identity(),
        }
    }
}

/// The guest-visible CPU model of a VM.
#[derive(Debug, Clone)]
pub struct CpuModel {
    /// Facility bits presented to the guest.
    pub facilities: FacilitySet,
    /// Optional features enabled for the guest.
    pub features: FeatureSet,
    /// Subfunction blocks presented to the guest.
    pub subfunctions: SubfunctionSet,
    /// The processor identification presented to the guest.
    pub cpu_id: u64,
    /// The processor version presented to the guest.
    pub version: u16,
}

impl CpuModel {
    pub(crate) fn from_host(host: &HostCapabilities) -> Self {
        Self {
            facilities: host.facilities,
            features: host.features,
            subfunctions: host.subfunctions,
            cpu_id: host.identity.cpu_id,
            version: host.identity.version,
        }
    }
}

/// An error applying a CPU model.
#[derive(Debug, Error)]
pub enum CpuModelError {
    /// Model changes are only accepted before the first vCPU.
    #[error("cpu model cannot change after vcpu creation")]
    Busy,
    /// The requested version exceeds the host's.
    #[error("requested cpu version {requested:#x} exceeds host version {host:#x}")]
    UnsupportedVersion {
        /// The version asked for.
        requested: u16,
        /// The version the host reports.
        host: u16,
    },
}

impl SiePartition {
    /// Replaces the VM's CPU model.
    ///
    /// The facility, feature, and subfunction sets are restricted to what
    /// the host supports; bits the host lacks are dropped silently. The
    /// identification is taken as requested, but the version must not
    /// exceed the host's.
    pub fn set_cpu_model(&self, requested: &CpuModel) -> Result<(), CpuModelError> {
        let inner = &self.inner;
        let _vm = inner.vm.lock();
        if !inner.vps.read().is_empty() {
            return Err(CpuModelError::Busy);
        }
        if requested.version > inner.host.identity.version {
            return Err(CpuModelError::UnsupportedVersion {
                requested: requested.version,
                host: inner.host.identity.version,
            });
        }
        let committed = CpuModel {
            facilities: requested.facilities.intersect(&inner.host.facilities),
            features: requested.features.intersect(&inner.host.features),
            subfunctions: requested.subfunctions.intersect(&inner.host.subfunctions),
            cpu_id: requested.cpu_id,
            version: requested.version,
        };
        tracing::info!(
            facilities = committed.facilities.count_ones(),
            features = committed.features.count_ones(),
            cpu_id = committed.cpu_id,
            version = committed.version,
            "cpu model committed"
        );
        *inner.model.write() = committed;
        Ok(())
    }

    /// Returns the committed CPU model.
    pub fn cpu_model(&self) -> CpuModel {
        self.inner.model.read().clone()
    }
}
