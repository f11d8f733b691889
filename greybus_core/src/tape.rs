// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Append-only capture of every inbound frame, and replay of a capture
//! file back through the receive path. No schema versioning; this is an
//! offline debugging aid, not a durable on-disk format.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::codec::{read_u16_le, write_u16_le};

pub struct TapeRecorder {
    file: Mutex<File>,
}

impl TapeRecorder {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(TapeRecorder {
            file: Mutex::new(File::create(path)?),
        })
    }

    /// Append one captured frame: `{size:u16, cport:u16}` followed by the
    /// raw bytes as delivered to `rx_handler`.
    pub fn record(&self, cport: u16, bytes: &[u8]) -> io::Result<()> {
        let mut header = [0u8; 4];
        write_u16_le(&mut header[0..2], bytes.len() as u16);
        write_u16_le(&mut header[2..4], cport);

        let mut file = self.file.lock().unwrap();
        file.write_all(&header)?;
        file.write_all(bytes)?;
        Ok(())
    }
}

/// Re-inject every frame in a capture file through `inject(cport, bytes)`,
/// in original record order.
pub fn replay(path: impl AsRef<Path>, mut inject: impl FnMut(u16, &[u8])) -> io::Result<()> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 4];

    loop {
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }

        let size = read_u16_le(&header[0..2]) as usize;
        let cport = read_u16_le(&header[2..4]);

        let mut body = vec![0u8; size];
        file.read_exact(&mut body)?;
        inject(cport, &body);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_replays_in_order() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("greybus_tape_test_{}.bin", std::process::id()));

        {
            let tape = TapeRecorder::create(&path).unwrap();
            tape.record(0, &[1, 2, 3]).unwrap();
            tape.record(1, &[4, 5]).unwrap();
        }

        let mut seen = Vec::new();
        replay(&path, |cport, bytes| seen.push((cport, bytes.to_vec()))).unwrap();

        assert_eq!(seen, vec![(0, vec![1, 2, 3]), (1, vec![4, 5])]);

        let _ = std::fs::remove_file(&path);
    }
}
