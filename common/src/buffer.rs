use std::io;

use serde::Serialize;

use crate::error::BufferError;

pub const TELEMETRY_BUFFER_CAPACITY: usize = 1024;

/// Most recent telemetry batch awaiting publication.
///
/// Filled by the acquisition routine and drained by the worker loop. Both run
/// on the worker's own thread, so the buffer is never shared across contexts.
#[derive(Debug, Default, Clone)]
pub struct TelemetryBuffer {
    data: heapless::Vec<u8, TELEMETRY_BUFFER_CAPACITY>,
}

impl TelemetryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Replaces the buffered batch. On overflow the buffer is left empty.
    pub fn fill(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.clear();
        if bytes.len() > TELEMETRY_BUFFER_CAPACITY {
            return Err(BufferError::Overflow {
                needed: bytes.len(),
                capacity: TELEMETRY_BUFFER_CAPACITY,
            });
        }
        self.data
            .extend_from_slice(bytes)
            .map_err(|_| BufferError::Overflow {
                needed: bytes.len(),
                capacity: TELEMETRY_BUFFER_CAPACITY,
            })
    }

    /// Serializes `value` as JSON straight into the buffer.
    pub fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), BufferError> {
        self.clear();
        let mut writer = BoundedWriter {
            data: &mut self.data,
            attempted: 0,
        };

        let result = serde_json::to_writer(&mut writer, value);
        let attempted = writer.attempted;
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.clear();
                if err.is_io() {
                    Err(BufferError::Overflow {
                        needed: attempted,
                        capacity: TELEMETRY_BUFFER_CAPACITY,
                    })
                } else {
                    Err(BufferError::Encode(err.to_string()))
                }
            }
        }
    }

    /// Zeroes the valid bytes and resets the length.
    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|byte| *byte = 0);
        self.data.clear();
    }
}

struct BoundedWriter<'a> {
    data: &'a mut heapless::Vec<u8, TELEMETRY_BUFFER_CAPACITY>,
    attempted: usize,
}

impl io::Write for BoundedWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.attempted += buf.len();
        self.data
            .extend_from_slice(buf)
            .map_err(|_| io::Error::new(io::ErrorKind::WriteZero, "telemetry buffer full"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
