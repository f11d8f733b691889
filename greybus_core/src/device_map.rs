// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A process-wide bijection between cport numbers and opaque device
//! handles, established once by device-adapter init code and read for the
//! remainder of the run.

use std::sync::Mutex;

use crate::error::Error;

#[derive(Default)]
pub struct DeviceMap {
    pairs: Mutex<Vec<(u16, u64)>>,
}

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, cport: u16, device: u64) -> Result<(), Error> {
        let mut pairs = self.pairs.lock().unwrap();
        if pairs.iter().any(|&(c, d)| c == cport || d == device) {
            return Err(Error::Exists);
        }
        pairs.push((cport, device));
        Ok(())
    }

    pub fn cport_to_device(&self, cport: u16) -> Option<u64> {
        self.pairs
            .lock()
            .unwrap()
            .iter()
            .find(|&&(c, _)| c == cport)
            .map(|&(_, d)| d)
    }

    pub fn device_to_cport(&self, device: u64) -> Option<u16> {
        self.pairs
            .lock()
            .unwrap()
            .iter()
            .find(|&&(_, d)| d == device)
            .map(|&(c, _)| c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_either_side_reused() {
        let map = DeviceMap::new();
        map.add(0, 100).unwrap();
        assert!(map.add(0, 200).is_err());
        assert!(map.add(1, 100).is_err());
        map.add(1, 101).unwrap();
        assert_eq!(map.cport_to_device(1), Some(101));
        assert_eq!(map.device_to_cport(100), Some(0));
    }
}
