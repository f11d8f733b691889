// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use super::builder::descriptor_type;
use super::{
    BundleClass, BundleDescriptor, CPortDescriptor, CPortProtocol, Descriptor, InterfaceDescriptor,
    Manifest, ManifestHeader, StringDescriptor, DESC_TYPE_BUNDLE, DESC_TYPE_CPORT,
    DESC_TYPE_INTERFACE, DESC_TYPE_STRING, MANIFEST_HEADER_SIZE,
};
use crate::codec::{read_u16_le, round_up_4, write_u16_le};
use crate::error::ManifestError;

const DESC_HEADER_SIZE: usize = 4;

fn descriptor_payload(d: &Descriptor) -> Vec<u8> {
    match d {
        Descriptor::Interface(i) => vec![i.vendor_string_id, i.product_string_id],
        Descriptor::String(s) => {
            let mut payload = Vec::with_capacity(2 + s.value.len());
            payload.push(s.value.len() as u8);
            payload.push(s.id);
            payload.extend_from_slice(s.value.as_bytes());
            payload
        }
        Descriptor::Bundle(b) => vec![b.id, b.class.0],
        Descriptor::CPort(c) => {
            let mut payload = vec![0u8; 4];
            write_u16_le(&mut payload[0..2], c.id);
            payload[2] = c.class.0;
            payload[3] = c.protocol.0;
            payload
        }
    }
}

fn encode_descriptor(out: &mut Vec<u8>, d: &Descriptor) {
    let payload = descriptor_payload(d);
    let raw_size = DESC_HEADER_SIZE + payload.len();
    let padded_size = round_up_4(raw_size);

    let mut frame = vec![0u8; padded_size];
    write_u16_le(&mut frame[0..2], padded_size as u16);
    frame[2] = descriptor_type(d);
    frame[3] = 0;
    frame[DESC_HEADER_SIZE..raw_size].copy_from_slice(&payload);
    out.extend_from_slice(&frame);
}

pub fn encode(header: &ManifestHeader, descriptors: &[Descriptor]) -> Vec<u8> {
    let mut body = Vec::new();
    for d in descriptors {
        encode_descriptor(&mut body, d);
    }

    let total = MANIFEST_HEADER_SIZE + body.len();
    let mut out = vec![0u8; MANIFEST_HEADER_SIZE];
    write_u16_le(&mut out[0..2], total as u16);
    out[2] = header.version_major;
    out[3] = header.version_minor;
    out.extend_from_slice(&body);
    out
}

/// Parse a previously generated mnfb buffer back into its descriptor list.
/// Used by diagnostic tooling and round-trip tests, not the request/
/// response hot path.
pub fn decode(buf: &[u8]) -> Result<Manifest, ManifestError> {
    if buf.len() < MANIFEST_HEADER_SIZE {
        return Err(ManifestError::Decode);
    }
    let total = read_u16_le(&buf[0..2]) as usize;
    if total > buf.len() {
        return Err(ManifestError::Decode);
    }
    let header = ManifestHeader {
        version_major: buf[2],
        version_minor: buf[3],
    };

    let mut descriptors = Vec::new();
    let mut pos = MANIFEST_HEADER_SIZE;
    while pos < total {
        if pos + DESC_HEADER_SIZE > total {
            return Err(ManifestError::Decode);
        }
        let desc_size = read_u16_le(&buf[pos..pos + 2]) as usize;
        let desc_type = buf[pos + 2];
        if desc_size < DESC_HEADER_SIZE || pos + desc_size > total {
            return Err(ManifestError::Decode);
        }
        let payload = &buf[pos + DESC_HEADER_SIZE..pos + desc_size];

        let descriptor = match desc_type {
            DESC_TYPE_INTERFACE => {
                if payload.len() < 2 {
                    return Err(ManifestError::Decode);
                }
                Descriptor::Interface(InterfaceDescriptor {
                    vendor_string_id: payload[0],
                    product_string_id: payload[1],
                })
            }
            DESC_TYPE_STRING => {
                if payload.len() < 2 {
                    return Err(ManifestError::Decode);
                }
                let len = payload[0] as usize;
                let id = payload[1];
                if payload.len() < 2 + len {
                    return Err(ManifestError::Decode);
                }
                let value = std::str::from_utf8(&payload[2..2 + len])
                    .map_err(|_| ManifestError::Decode)?
                    .to_owned();
                Descriptor::String(StringDescriptor { id, value })
            }
            DESC_TYPE_BUNDLE => {
                if payload.len() < 2 {
                    return Err(ManifestError::Decode);
                }
                Descriptor::Bundle(BundleDescriptor {
                    id: payload[0],
                    class: BundleClass(payload[1]),
                })
            }
            DESC_TYPE_CPORT => {
                if payload.len() < 4 {
                    return Err(ManifestError::Decode);
                }
                Descriptor::CPort(CPortDescriptor {
                    id: read_u16_le(&payload[0..2]),
                    class: BundleClass(payload[2]),
                    protocol: CPortProtocol(payload[3]),
                })
            }
            _ => return Err(ManifestError::Decode),
        };

        descriptors.push(descriptor);
        pos += desc_size;
    }

    Ok(Manifest { header, descriptors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestBuilder;

    #[test]
    fn round_trips_s5_style_manifest() {
        let mut b = ManifestBuilder::new(0, 1);
        b.add_interface(1, 2).unwrap();
        b.add_string(1, "Acme").unwrap();
        b.add_string(2, "Widget").unwrap();
        b.add_bundle(0, BundleClass::CONTROL).unwrap();
        b.add_cport(0, BundleClass::CONTROL, CPortProtocol::CONTROL).unwrap();
        assert!(b.cports_valid());

        let bytes = b.generate();
        assert_eq!(read_u16_le(&bytes[0..2]) as usize, bytes.len());
        assert_eq!(bytes[2], 0);
        assert_eq!(bytes[3], 1);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.descriptors.len(), 5);
        assert!(matches!(decoded.descriptors[0], Descriptor::Interface(_)));
        assert!(matches!(decoded.descriptors[4], Descriptor::CPort(_)));
    }

    #[test]
    fn generate_is_idempotent() {
        let mut b = ManifestBuilder::new(1, 0);
        b.add_cport(0, BundleClass::GPIO, CPortProtocol::GPIO).unwrap();
        assert_eq!(b.generate(), b.generate());
    }

    #[test]
    fn duplicate_interface_rejected() {
        let mut b = ManifestBuilder::new(0, 1);
        b.add_interface(1, 2).unwrap();
        assert!(b.add_interface(3, 4).is_err());
    }

    #[test]
    fn duplicate_cport_id_rejected() {
        let mut b = ManifestBuilder::new(0, 1);
        b.add_cport(0, BundleClass::CONTROL, CPortProtocol::CONTROL).unwrap();
        assert!(b.add_cport(0, BundleClass::GPIO, CPortProtocol::GPIO).is_err());
    }

    #[test]
    fn cports_valid_requires_contiguous_range() {
        let mut b = ManifestBuilder::new(0, 1);
        b.add_cport(0, BundleClass::CONTROL, CPortProtocol::CONTROL).unwrap();
        b.add_cport(2, BundleClass::CONTROL, CPortProtocol::CONTROL).unwrap();
        assert!(!b.cports_valid());
        b.add_cport(1, BundleClass::CONTROL, CPortProtocol::CONTROL).unwrap();
        assert!(b.cports_valid());
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let bytes = [0x03, 0x00, 0x00];
        assert!(matches!(decode(&bytes), Err(ManifestError::Decode)));
    }
}
