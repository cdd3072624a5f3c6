//! Pass-level timestamp queries: one write at the start and one at the end of
//! each compute pass, resolved into a mappable buffer.

use offload_api::{OffloadError, Result};

use super::readback::{map_readback_bytes_sync, staging_buffer};

const QUERY_BYTES: u64 = 2 * std::mem::size_of::<u64>() as u64;

pub struct TimestampQuery {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    staging: wgpu::Buffer,
}

impl TimestampQuery {
    pub fn new(device: &wgpu::Device) -> Self {
        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("offload-timestamps"),
            ty: wgpu::QueryType::Timestamp,
            count: 2,
        });
        let resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("offload-timestamps-resolve"),
            size: QUERY_BYTES,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = staging_buffer(device, QUERY_BYTES, "offload-timestamps-staging");
        Self {
            query_set,
            resolve,
            staging,
        }
    }

    pub fn pass_writes(&self) -> wgpu::ComputePassTimestampWrites<'_> {
        wgpu::ComputePassTimestampWrites {
            query_set: &self.query_set,
            beginning_of_pass_write_index: Some(0),
            end_of_pass_write_index: Some(1),
        }
    }

    pub fn resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.resolve_query_set(&self.query_set, 0..2, &self.resolve, 0);
        encoder.copy_buffer_to_buffer(&self.resolve, 0, &self.staging, 0, QUERY_BYTES);
    }

    /// Raw start and end ticks. Blocks until the pass has executed.
    pub fn read_ticks(&self, device: &wgpu::Device) -> Result<(u64, u64)> {
        let bytes = map_readback_bytes_sync(device, &self.staging, QUERY_BYTES, "timestamps")?;
        let word = |at: usize| -> Result<u64> {
            bytes
                .get(at..at + 8)
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map(u64::from_le_bytes)
                .ok_or_else(|| OffloadError::ProfilingUnavailable("short timestamp read".into()))
        };
        Ok((word(0)?, word(8)?))
    }
}

/// Converts ticks to nanoseconds using the queue's timestamp period.
pub fn ticks_to_ns(ticks: u64, period_ns: f32) -> u64 {
    (ticks as f64 * period_ns as f64) as u64
}
