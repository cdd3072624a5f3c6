//! Device resolution: the first platform, its first accelerator-class device,
//! else its first general-purpose device. Resolution creates no device state.

use log::{debug, info};
use offload_api::{
    ComputePlatform, DeviceClass, DeviceDescriptor, OffloadError, PlatformInfo, Result,
};

pub fn resolve(platform: &dyn ComputePlatform) -> Result<DeviceDescriptor> {
    let platforms = platform.platforms()?;
    let first = platforms.first().ok_or(OffloadError::NoPlatformFound)?;
    debug!(
        "resolver: {} platform(s) on {}, using '{}'",
        platforms.len(),
        platform.backend_name(),
        first.name
    );
    for class in [DeviceClass::Accelerator, DeviceClass::GeneralPurpose] {
        let devices = platform.devices(first.id, class)?;
        if let Some(device) = devices.into_iter().next() {
            info!("resolver: selected {class} device '{}'", device.name);
            return Ok(device);
        }
        debug!("resolver: no {class} devices on '{}'", first.name);
    }
    Err(OffloadError::NoDeviceFound {
        platform: first.name.clone(),
    })
}

/// Every platform with its devices of both classes, accelerators first.
pub fn describe_platforms(
    platform: &dyn ComputePlatform,
) -> Result<Vec<(PlatformInfo, Vec<DeviceDescriptor>)>> {
    let mut out = Vec::new();
    for info in platform.platforms()? {
        let mut devices = platform.devices(info.id, DeviceClass::Accelerator)?;
        devices.extend(platform.devices(info.id, DeviceClass::GeneralPurpose)?);
        out.push((info, devices));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_api::{DeviceContext, PlatformId, QueueProperties};
    use std::sync::Arc;

    struct FakePlatform {
        platforms: Vec<PlatformInfo>,
        devices: Vec<DeviceDescriptor>,
    }

    fn platform_info(id: u32, name: &str) -> PlatformInfo {
        PlatformInfo {
            id: PlatformId(id),
            name: name.to_string(),
            vendor: "test".to_string(),
            version: "1".to_string(),
        }
    }

    fn device(platform: u32, index: u32, class: DeviceClass, name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            platform: PlatformId(platform),
            index,
            class,
            name: name.to_string(),
            vendor: "test".to_string(),
            driver: "1.0".to_string(),
            max_work_group_size: 256,
            backend: "fake".to_string(),
        }
    }

    impl ComputePlatform for FakePlatform {
        fn backend_name(&self) -> &str {
            "fake"
        }

        fn platforms(&self) -> Result<Vec<PlatformInfo>> {
            Ok(self.platforms.clone())
        }

        fn devices(&self, platform: PlatformId, class: DeviceClass) -> Result<Vec<DeviceDescriptor>> {
            Ok(self
                .devices
                .iter()
                .filter(|d| d.platform == platform && d.class == class)
                .cloned()
                .collect())
        }

        fn open(&self, _: &DeviceDescriptor, _: QueueProperties) -> Result<Arc<dyn DeviceContext>> {
            Err(OffloadError::Backend("fake platform cannot open devices".into()))
        }
    }

    #[test]
    fn no_platforms_fails() {
        let p = FakePlatform {
            platforms: vec![],
            devices: vec![],
        };
        assert!(matches!(resolve(&p), Err(OffloadError::NoPlatformFound)));
    }

    #[test]
    fn prefers_accelerator_on_first_platform() {
        let p = FakePlatform {
            platforms: vec![platform_info(0, "a"), platform_info(1, "b")],
            devices: vec![
                device(0, 0, DeviceClass::GeneralPurpose, "cpu0"),
                device(0, 1, DeviceClass::Accelerator, "gpu0"),
                device(0, 2, DeviceClass::Accelerator, "gpu1"),
                device(1, 0, DeviceClass::Accelerator, "other"),
            ],
        };
        assert_eq!(resolve(&p).unwrap().name, "gpu0");
    }

    #[test]
    fn falls_back_to_general_purpose() {
        let p = FakePlatform {
            platforms: vec![platform_info(0, "a")],
            devices: vec![device(0, 0, DeviceClass::GeneralPurpose, "cpu0")],
        };
        assert_eq!(resolve(&p).unwrap().name, "cpu0");
    }

    #[test]
    fn ignores_devices_on_later_platforms() {
        let p = FakePlatform {
            platforms: vec![platform_info(0, "empty"), platform_info(1, "b")],
            devices: vec![device(1, 0, DeviceClass::Accelerator, "gpu")],
        };
        match resolve(&p) {
            Err(OffloadError::NoDeviceFound { platform }) => assert_eq!(platform, "empty"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn describe_lists_all_platforms() {
        let p = FakePlatform {
            platforms: vec![platform_info(0, "a"), platform_info(1, "b")],
            devices: vec![
                device(0, 0, DeviceClass::GeneralPurpose, "cpu0"),
                device(0, 1, DeviceClass::Accelerator, "gpu0"),
                device(1, 0, DeviceClass::Accelerator, "gpu1"),
            ],
        };
        let listing = describe_platforms(&p).unwrap();
        assert_eq!(listing.len(), 2);
        let names: Vec<&str> = listing[0].1.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["gpu0", "cpu0"]);
    }
}
