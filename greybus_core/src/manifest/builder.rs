// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use super::{
    codec, BundleClass, BundleDescriptor, CPortDescriptor, CPortProtocol, Descriptor,
    InterfaceDescriptor, ManifestHeader, StringDescriptor, DESC_TYPE_BUNDLE, DESC_TYPE_CPORT,
    DESC_TYPE_INTERFACE, DESC_TYPE_STRING,
};
use crate::error::ManifestError;

/// Builds an mnfb manifest by accumulating descriptors; each `add_*` call
/// deduplicates by identity (interface is a singleton; string/bundle/cport
/// dedup by their `id`) the same way the source's `manifest_add_*`
/// functions return `-EALREADY`.
pub struct ManifestBuilder {
    header: ManifestHeader,
    descriptors: Vec<Descriptor>,
}

impl ManifestBuilder {
    pub fn new(version_major: u8, version_minor: u8) -> Self {
        ManifestBuilder {
            header: ManifestHeader {
                version_major,
                version_minor,
            },
            descriptors: Vec::new(),
        }
    }

    pub fn add_interface(
        &mut self,
        vendor_string_id: u8,
        product_string_id: u8,
    ) -> Result<&mut Self, ManifestError> {
        if self
            .descriptors
            .iter()
            .any(|d| matches!(d, Descriptor::Interface(_)))
        {
            return Err(ManifestError::DuplicateInterface);
        }
        self.descriptors.push(Descriptor::Interface(InterfaceDescriptor {
            vendor_string_id,
            product_string_id,
        }));
        Ok(self)
    }

    pub fn add_string(&mut self, id: u8, value: impl Into<String>) -> Result<&mut Self, ManifestError> {
        let value = value.into();
        if value.len() > 255 {
            return Err(ManifestError::StringTooLong);
        }
        if self
            .descriptors
            .iter()
            .any(|d| matches!(d, Descriptor::String(s) if s.id == id))
        {
            return Err(ManifestError::DuplicateId);
        }
        self.descriptors.push(Descriptor::String(StringDescriptor { id, value }));
        Ok(self)
    }

    pub fn add_bundle(&mut self, id: u8, class: BundleClass) -> Result<&mut Self, ManifestError> {
        if self
            .descriptors
            .iter()
            .any(|d| matches!(d, Descriptor::Bundle(b) if b.id == id))
        {
            return Err(ManifestError::DuplicateId);
        }
        self.descriptors.push(Descriptor::Bundle(BundleDescriptor { id, class }));
        Ok(self)
    }

    pub fn add_cport(
        &mut self,
        id: u16,
        class: BundleClass,
        protocol: CPortProtocol,
    ) -> Result<&mut Self, ManifestError> {
        if self
            .descriptors
            .iter()
            .any(|d| matches!(d, Descriptor::CPort(c) if c.id == id))
        {
            return Err(ManifestError::DuplicateId);
        }
        self.descriptors.push(Descriptor::CPort(CPortDescriptor { id, class, protocol }));
        Ok(self)
    }

    /// The cport ids, sorted, iff they form a contiguous range starting at
    /// their minimum (the engine additionally requires that minimum be 0).
    pub fn cports_valid(&self) -> bool {
        let mut ids: Vec<u16> = self
            .descriptors
            .iter()
            .filter_map(|d| match d {
                Descriptor::CPort(c) => Some(c.id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids.windows(2).all(|w| w[1] == w[0] + 1)
    }

    pub fn cports(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .descriptors
            .iter()
            .filter_map(|d| match d {
                Descriptor::CPort(c) => Some(c.id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Serialize the accumulated descriptors into mnfb bytes, descriptor
    /// type and id constants reproduced in the wire order they were added.
    pub fn generate(&self) -> Vec<u8> {
        codec::encode(&self.header, &self.descriptors)
    }

    /// Consume the builder, handing ownership of the serialized buffer to
    /// the caller, mirroring the source's `manifest_mnfb_give`.
    pub fn give(self) -> Vec<u8> {
        self.generate()
    }
}

pub(super) fn descriptor_type(d: &Descriptor) -> u8 {
    match d {
        Descriptor::Interface(_) => DESC_TYPE_INTERFACE,
        Descriptor::String(_) => DESC_TYPE_STRING,
        Descriptor::Bundle(_) => DESC_TYPE_BUNDLE,
        Descriptor::CPort(_) => DESC_TYPE_CPORT,
    }
}
