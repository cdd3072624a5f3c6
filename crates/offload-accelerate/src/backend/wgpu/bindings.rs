use offload_api::{AccessMode, KernelParam, KernelSignature};
use wgpu::{BindGroupLayoutEntry, BindingType, BufferBindingType, ShaderStages};

pub fn storage_read_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub fn storage_read_write_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub fn uniform_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Layout for a positional signature: buffers take bindings `0..` in
/// argument order, all scalars share one uniform bound after the last buffer.
/// Local scratch is declared in the shader and needs no binding.
pub fn layout_entries(signature: &KernelSignature) -> Vec<BindGroupLayoutEntry> {
    let mut entries = Vec::with_capacity(signature.params.len());
    let mut binding = 0u32;
    for param in signature.params {
        if let KernelParam::Buffer(access) = param {
            entries.push(match access {
                AccessMode::ReadOnly => storage_read_entry(binding),
                AccessMode::WriteOnly | AccessMode::ReadWrite => storage_read_write_entry(binding),
            });
            binding += 1;
        }
    }
    if signature.scalar_count() > 0 {
        entries.push(uniform_entry(binding));
    }
    entries
}

/// Scalars packed four bytes each, zero-padded to a 16-byte uniform block.
pub fn pack_uniform(words: &[[u8; 4]]) -> Vec<u8> {
    let mut bytes: Vec<u8> = words.iter().flatten().copied().collect();
    let padded = ((bytes.len() + 15) / 16).max(1) * 16;
    bytes.resize(padded, 0);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;

    #[test]
    fn gemm_layout_puts_uniform_after_buffers() {
        let entries = layout_entries(&kernels::GEMM_SIG);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[3].binding, 3);
        assert!(matches!(
            entries[3].ty,
            BindingType::Buffer {
                ty: BufferBindingType::Uniform,
                ..
            }
        ));
        assert!(matches!(
            entries[2].ty,
            BindingType::Buffer {
                ty: BufferBindingType::Storage { read_only: false },
                ..
            }
        ));
    }

    #[test]
    fn findmax_local_arg_takes_no_binding() {
        let entries = layout_entries(&kernels::FINDMAX_SIG);
        let bindings: Vec<u32> = entries.iter().map(|e| e.binding).collect();
        assert_eq!(bindings, vec![0, 1, 2]);
    }

    #[test]
    fn uniform_is_padded_to_sixteen_bytes() {
        assert_eq!(pack_uniform(&[[1, 0, 0, 0]]).len(), 16);
        assert_eq!(pack_uniform(&[[0; 4]; 5]).len(), 32);
    }
}
