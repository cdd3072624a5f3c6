pub mod bindings;
pub mod context;
pub mod platform;
pub mod readback;
pub mod timestamps;

pub use context::WgpuContext;
pub use platform::{WgpuPlatform, WgpuProviderOptions};
