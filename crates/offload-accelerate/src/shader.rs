//! WGSL front end shared by every backend.
//!
//! Compiling validates the module with naga and lowers it to a SPIR-V word
//! stream; that stream, serialized little-endian, is the binary image stored
//! in the program cache. Loading an image parses the SPIR-V back into a naga
//! module and re-validates it.

use naga::back::spv;
use naga::front::{spv as spv_in, wgsl};
use naga::valid::{Capabilities, ModuleInfo, ValidationFlags, Validator};
use offload_api::{OffloadError, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointInfo {
    pub name: String,
    pub workgroup_size: [u32; 3],
}

/// A validated module plus its serialized binary image.
#[derive(Debug, Clone)]
pub struct ShaderProgram {
    pub label: String,
    pub module: naga::Module,
    pub entry_points: Vec<EntryPointInfo>,
    pub image: Vec<u8>,
}

impl ShaderProgram {
    pub fn entry_point(&self, name: &str) -> Option<&EntryPointInfo> {
        self.entry_points.iter().find(|ep| ep.name == name)
    }
}

fn validator() -> Validator {
    Validator::new(ValidationFlags::all(), Capabilities::all())
}

fn compute_entry_points(module: &naga::Module) -> Vec<EntryPointInfo> {
    module
        .entry_points
        .iter()
        .filter(|ep| ep.stage == naga::ShaderStage::Compute)
        .map(|ep| EntryPointInfo {
            name: ep.name.clone(),
            workgroup_size: ep.workgroup_size,
        })
        .collect()
}

fn missing_entry_points(found: &[EntryPointInfo], expected: &[&str]) -> Vec<String> {
    expected
        .iter()
        .filter(|name| !found.iter().any(|ep| ep.name == **name))
        .map(|name| name.to_string())
        .collect()
}

fn write_image(module: &naga::Module, info: &ModuleInfo) -> std::result::Result<Vec<u8>, String> {
    let options = spv::Options {
        zero_initialize_workgroup_memory: spv::ZeroInitializeWorkgroupMemoryMode::None,
        ..Default::default()
    };
    let words = spv::write_vec(module, info, &options, None).map_err(|e| e.to_string())?;
    Ok(words.iter().flat_map(|w| w.to_le_bytes()).collect())
}

/// Parses, validates and lowers WGSL source. Any failure is a compile error
/// carrying the diagnostic text.
pub fn compile_wgsl(label: &str, source: &str, entry_points: &[&str]) -> Result<ShaderProgram> {
    let compile_err = |log: String| OffloadError::Compile {
        program: label.to_string(),
        log,
    };
    let module = wgsl::parse_str(source).map_err(|e| compile_err(e.emit_to_string(source)))?;
    let info = validator()
        .validate(&module)
        .map_err(|e| compile_err(e.emit_to_string(source)))?;
    let found = compute_entry_points(&module);
    let missing = missing_entry_points(&found, entry_points);
    if !missing.is_empty() {
        return Err(compile_err(format!(
            "missing compute entry point(s): {}",
            missing.join(", ")
        )));
    }
    let image = write_image(&module, &info).map_err(compile_err)?;
    Ok(ShaderProgram {
        label: label.to_string(),
        module,
        entry_points: found,
        image,
    })
}

/// Loads a binary image produced by [`compile_wgsl`]. Failures are link
/// errors so callers can fall back to compiling from source.
pub fn load_image(label: &str, image: &[u8], entry_points: &[&str]) -> Result<ShaderProgram> {
    let link_err = |reason: String| OffloadError::Link {
        program: label.to_string(),
        reason,
    };
    if image.len() < 20 || image.len() % 4 != 0 {
        return Err(link_err(format!("image of {} bytes is not SPIR-V", image.len())));
    }
    let magic = u32::from_le_bytes([image[0], image[1], image[2], image[3]]);
    if magic != SPIRV_MAGIC {
        return Err(link_err(format!("bad magic 0x{magic:08x}")));
    }
    let module = spv_in::parse_u8_slice(image, &spv_in::Options::default())
        .map_err(|e| link_err(e.to_string()))?;
    validator()
        .validate(&module)
        .map_err(|e| link_err(format!("{e:?}")))?;
    let found = compute_entry_points(&module);
    let missing = missing_entry_points(&found, entry_points);
    if !missing.is_empty() {
        return Err(link_err(format!(
            "image lacks entry point(s): {}",
            missing.join(", ")
        )));
    }
    Ok(ShaderProgram {
        label: label.to_string(),
        module,
        entry_points: found,
        image: image.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;

    #[test]
    fn compiles_every_bundled_kernel() {
        for spec in kernels::ALL_PROGRAMS {
            let program = compile_wgsl(spec.name, spec.embedded_source, spec.entry_points)
                .unwrap_or_else(|e| panic!("{}: {e}", spec.name));
            assert!(!program.image.is_empty());
            for entry in spec.entry_points {
                assert!(program.entry_point(entry).is_some(), "{entry}");
            }
        }
    }

    #[test]
    fn workgroup_sizes_come_from_source() {
        let program = compile_wgsl(
            "findmax",
            kernels::FINDMAX.embedded_source,
            kernels::FINDMAX.entry_points,
        )
        .unwrap();
        assert_eq!(
            program.entry_point("findmax").unwrap().workgroup_size,
            [kernels::FINDMAX_LOCAL_SIZE, 1, 1]
        );
    }

    #[test]
    fn image_reloads_with_entry_points() {
        let spec = &kernels::GEMM;
        let program = compile_wgsl(spec.name, spec.embedded_source, spec.entry_points).unwrap();
        let loaded = load_image(spec.name, &program.image, spec.entry_points).unwrap();
        assert_eq!(loaded.entry_points, program.entry_points);
    }

    #[test]
    fn syntax_errors_are_compile_errors_with_log() {
        let err = compile_wgsl("broken", "fn main( {", &["main"]).unwrap_err();
        match err {
            OffloadError::Compile { program, log } => {
                assert_eq!(program, "broken");
                assert!(!log.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_entry_point_fails_compile() {
        let err = compile_wgsl(
            "matvec",
            kernels::MATVEC.embedded_source,
            &["matvec_mult", "nope"],
        )
        .unwrap_err();
        assert!(matches!(err, OffloadError::Compile { .. }));
    }

    #[test]
    fn garbage_images_are_link_errors() {
        let err = load_image("p", b"not a program at all", &[]).unwrap_err();
        assert!(err.is_recoverable());
        let err = load_image("p", &[0u8; 64], &[]).unwrap_err();
        assert!(err.is_recoverable());
    }
}
