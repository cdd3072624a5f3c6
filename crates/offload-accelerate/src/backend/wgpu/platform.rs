use log::{debug, info, warn};
use offload_api::{
    ComputePlatform, DeviceClass, DeviceContext, DeviceDescriptor, OffloadError, PlatformId,
    PlatformInfo, QueueProperties, Result,
};
use pollster::block_on;
use std::sync::Arc;

use super::context::WgpuContext;

#[derive(Clone, Debug)]
pub struct WgpuProviderOptions {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
}

impl Default for WgpuProviderOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

/// Native backends probed in order; each one with adapters becomes a platform.
const BACKEND_ORDER: [(wgpu::Backends, &str); 4] = [
    (wgpu::Backends::VULKAN, "Vulkan"),
    (wgpu::Backends::METAL, "Metal"),
    (wgpu::Backends::DX12, "DirectX 12"),
    (wgpu::Backends::GL, "OpenGL"),
];

struct BackendGroup {
    info: PlatformInfo,
    adapters: Vec<wgpu::Adapter>,
}

pub struct WgpuPlatform {
    _instance: wgpu::Instance,
    groups: Vec<BackendGroup>,
}

pub fn canonical_vendor_name(info: &wgpu::AdapterInfo) -> String {
    match info.vendor {
        0x10DE => "NVIDIA".to_string(),
        0x1002 | 0x1022 => "AMD".to_string(),
        0x8086 => "Intel".to_string(),
        0x106B => "Apple".to_string(),
        0x13B5 => "ARM".to_string(),
        0x5143 => "Qualcomm".to_string(),
        0x1414 => "Microsoft".to_string(),
        0x1AE0 => "Google".to_string(),
        0x10005 => "Mesa".to_string(),
        0 => info
            .name
            .split_whitespace()
            .next()
            .unwrap_or("unknown")
            .to_string(),
        other => {
            let prefix = info.name.split_whitespace().next().unwrap_or("vendor");
            format!("{prefix} (0x{other:04x})")
        }
    }
}

fn driver_string(info: &wgpu::AdapterInfo) -> String {
    match (info.driver.trim(), info.driver_info.trim()) {
        ("", "") => format!("{:?}", info.backend),
        (driver, "") => driver.to_string(),
        ("", details) => details.to_string(),
        (driver, details) => format!("{driver} {details}"),
    }
}

fn device_class(kind: wgpu::DeviceType) -> DeviceClass {
    match kind {
        wgpu::DeviceType::DiscreteGpu
        | wgpu::DeviceType::IntegratedGpu
        | wgpu::DeviceType::VirtualGpu => DeviceClass::Accelerator,
        wgpu::DeviceType::Cpu | wgpu::DeviceType::Other => DeviceClass::GeneralPurpose,
    }
}

fn preference_rank(kind: wgpu::DeviceType, pref: wgpu::PowerPreference) -> u8 {
    match (pref, kind) {
        (wgpu::PowerPreference::LowPower, wgpu::DeviceType::IntegratedGpu) => 0,
        (wgpu::PowerPreference::LowPower, wgpu::DeviceType::DiscreteGpu) => 1,
        (_, wgpu::DeviceType::DiscreteGpu) => 0,
        (_, wgpu::DeviceType::IntegratedGpu) => 1,
        (_, wgpu::DeviceType::VirtualGpu) => 2,
        _ => 3,
    }
}

fn describe(platform: PlatformId, index: u32, adapter: &wgpu::Adapter) -> DeviceDescriptor {
    let info = adapter.get_info();
    let limits = adapter.limits();
    DeviceDescriptor {
        platform,
        index,
        class: device_class(info.device_type),
        name: info.name.clone(),
        vendor: canonical_vendor_name(&info),
        driver: driver_string(&info),
        max_work_group_size: limits.max_compute_invocations_per_workgroup,
        backend: format!("{:?}", info.backend),
    }
}

impl WgpuPlatform {
    pub fn new(options: &WgpuProviderOptions) -> Self {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let mut groups = Vec::new();
        for (backend, label) in BACKEND_ORDER {
            let mut adapters: Vec<wgpu::Adapter> =
                instance.enumerate_adapters(backend).into_iter().collect();
            if options.force_fallback_adapter {
                adapters.retain(|a| a.get_info().device_type == wgpu::DeviceType::Cpu);
            }
            if adapters.is_empty() {
                debug!("wgpu: no {label} adapters");
                continue;
            }
            adapters.sort_by_key(|a| preference_rank(a.get_info().device_type, options.power_preference));
            let id = PlatformId(groups.len() as u32);
            info!("wgpu: {label} platform with {} adapter(s)", adapters.len());
            groups.push(BackendGroup {
                info: PlatformInfo {
                    id,
                    name: format!("wgpu {label}"),
                    vendor: "wgpu".to_string(),
                    version: label.to_string(),
                },
                adapters,
            });
        }
        Self {
            _instance: instance,
            groups,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn group(&self, platform: PlatformId) -> Result<&BackendGroup> {
        self.groups
            .get(platform.0 as usize)
            .ok_or(OffloadError::NoPlatformFound)
    }
}

impl ComputePlatform for WgpuPlatform {
    fn backend_name(&self) -> &str {
        "wgpu"
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        Ok(self.groups.iter().map(|g| g.info.clone()).collect())
    }

    fn devices(&self, platform: PlatformId, class: DeviceClass) -> Result<Vec<DeviceDescriptor>> {
        let group = self.group(platform)?;
        Ok(group
            .adapters
            .iter()
            .enumerate()
            .map(|(index, adapter)| describe(platform, index as u32, adapter))
            .filter(|d| d.class == class)
            .collect())
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        queue: QueueProperties,
    ) -> Result<Arc<dyn DeviceContext>> {
        let group = self.group(device.platform)?;
        let adapter = group
            .adapters
            .get(device.index as usize)
            .ok_or_else(|| OffloadError::NoDeviceFound {
                platform: group.info.name.clone(),
            })?;
        let timestamps = queue.profiling && adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY);
        if queue.profiling && !timestamps {
            warn!(
                "wgpu: adapter '{}' lacks timestamp queries; kernel times use the host clock",
                device.name
            );
        }
        let required_features = if timestamps {
            wgpu::Features::TIMESTAMP_QUERY
        } else {
            wgpu::Features::empty()
        };
        let limits = adapter.limits();
        let (wgpu_device, wgpu_queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("offload-device"),
                required_features,
                required_limits: limits.clone(),
            },
            None,
        ))
        .map_err(|e| OffloadError::Backend(format!("request_device failed: {e}")))?;
        info!(
            "wgpu: opened '{}' ({}, {}) via {}",
            device.name, device.vendor, device.driver, device.backend
        );
        Ok(Arc::new(WgpuContext::new(
            device.clone(),
            wgpu_device,
            wgpu_queue,
            limits,
            queue.profiling,
            timestamps,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(vendor: u32, name: &str, driver: &str, driver_info: &str) -> wgpu::AdapterInfo {
        wgpu::AdapterInfo {
            name: name.to_string(),
            vendor,
            device: 0,
            device_type: wgpu::DeviceType::DiscreteGpu,
            driver: driver.to_string(),
            driver_info: driver_info.to_string(),
            backend: wgpu::Backend::Vulkan,
        }
    }

    #[test]
    fn vendor_names_are_canonical() {
        assert_eq!(canonical_vendor_name(&info(0x10DE, "RTX", "", "")), "NVIDIA");
        assert_eq!(canonical_vendor_name(&info(0, "llvmpipe (LLVM)", "", "")), "llvmpipe");
        assert_eq!(
            canonical_vendor_name(&info(0xBEEF, "Acme GPU", "", "")),
            "Acme (0xbeef)"
        );
    }

    #[test]
    fn driver_string_joins_both_fields() {
        assert_eq!(driver_string(&info(0, "x", "Mesa", "23.1")), "Mesa 23.1");
        assert_eq!(driver_string(&info(0, "x", "", "")), "Vulkan");
    }

    #[test]
    fn cpu_adapters_are_general_purpose() {
        assert_eq!(device_class(wgpu::DeviceType::Cpu), DeviceClass::GeneralPurpose);
        assert_eq!(device_class(wgpu::DeviceType::IntegratedGpu), DeviceClass::Accelerator);
    }
}
