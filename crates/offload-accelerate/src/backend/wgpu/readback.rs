use futures::channel::oneshot;
use offload_api::{OffloadError, Result};
use pollster::block_on;

pub async fn map_readback_bytes(
    device: &wgpu::Device,
    staging: &wgpu::Buffer,
    size_bytes: u64,
    context: &str,
) -> Result<Vec<u8>> {
    let slice = staging.slice(..size_bytes);
    let (tx, rx) = oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        let _ = tx.send(res);
    });
    device.poll(wgpu::Maintain::Wait);
    let map_result = rx
        .await
        .map_err(|_| OffloadError::Readback(format!("{context}: map_async callback dropped")))?;
    map_result.map_err(|e| OffloadError::Readback(format!("{context}: {e}")))?;
    let data = slice.get_mapped_range();
    let out = data.to_vec();
    drop(data);
    staging.unmap();
    Ok(out)
}

pub fn map_readback_bytes_sync(
    device: &wgpu::Device,
    staging: &wgpu::Buffer,
    size_bytes: u64,
    context: &str,
) -> Result<Vec<u8>> {
    block_on(map_readback_bytes(device, staging, size_bytes, context))
}

pub fn staging_buffer(device: &wgpu::Device, size_bytes: u64, label: &str) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size_bytes,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}
