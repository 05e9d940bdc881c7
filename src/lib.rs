//! # MALIDRM - Mali-400 DRM platform driver glue
//!
//! The platform-driver and DRM-driver callbacks that bind a Mali-200/400 GPU
//! into a host's component framework, written against a narrow [`Host`]
//! trait so the glue runs and is tested without a kernel.
//!
//! ## Features
//!
//! - **Platform driver** matching `"arm,mali-400"` device-tree nodes
//! - **Component master** aggregation of the GPU's child nodes
//! - **DRM driver** load/unload and per-file open/close with owned private data
//! - **Typed handle table** with lowest-free reuse
//! - **Ioctl dispatch** with `AUTH`/`MASTER`/`ROOT_ONLY` permission checks
//! - **In-memory host** recording every host call, for simulation and tests
//! - **Allocation tracking** with injectable out-of-memory failures
//!
//! ## Quick Start
//!
//! ```rust
//! use malidrm::prelude::*;
//!
//! fn main() -> Result<(), DriverError> {
//!     let host = SimHost::new();
//!     let driver = MaliDriver::new(StubGpu::new(), AllocTracker::new());
//!     let mut reg = malidrm::module::init(&host, driver)?;
//!
//!     let node = DeviceNode::new("/soc/gpu@1c40000")
//!         .with_compatible("arm,mali-400")
//!         .with_child(DeviceNode::new("/soc/gpu@1c40000/gp@0"));
//!     let outcome = reg.device_added(PlatformDevice::from_node(node))?;
//!     assert_eq!(outcome, ProbeOutcome::Bound { minor: 0 });
//!
//!     reg.exit();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod alloc;
pub mod config;
pub mod driver;
pub mod error;
pub mod gpu;
pub mod host;
pub mod idr;
pub mod module;
pub mod of;
pub mod simulate;

// Re-export main API for easy access
pub use alloc::{AllocTracker, FailPolicy};
pub use config::{load_board_config, BoardConfig};
pub use driver::{DrmDevice, FileId, MaliDriver, MaliMaster};
pub use error::{DriverError, DriverResult};
pub use gpu::{GpuOps, StubGpu};
pub use host::sim::SimHost;
pub use host::{Host, PlatformDevice};
pub use idr::{Handle, HandleTable};
pub use module::{init, ModuleInfo, ProbeOutcome, Registration};
pub use of::{DeviceNode, MALI_400_COMPATIBLE};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
///
/// # Example
///
/// ```no_run
/// use malidrm;
///
/// println!("Using malidrm v{}", malidrm::version());
/// ```
pub fn version() -> &'static str {
    VERSION
}

/// Whether a node with this compatible string would be probed by the driver
///
/// # Example
///
/// ```
/// assert!(malidrm::is_supported("arm,mali-400"));
/// assert!(!malidrm::is_supported("arm,mali-t604"));
/// ```
pub fn is_supported(compatible: &str) -> bool {
    of::MALI_DT_IDS.matches_compatible(compatible)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert!(!version().is_empty());
    }

    #[test]
    fn test_is_supported() {
        assert!(is_supported(MALI_400_COMPATIBLE));
        assert!(is_supported("ARM,Mali-400"));
        assert!(!is_supported("arm,mali-450"));
    }
}

/// Prelude module for convenient imports
///
/// # Example
///
/// ```no_run
/// use malidrm::prelude::*;
///
/// let host = SimHost::new();
/// let driver = MaliDriver::new(StubGpu::new(), AllocTracker::new());
/// let reg = init(&host, driver)?;
/// reg.exit();
/// # Ok::<(), DriverError>(())
/// ```
pub mod prelude {
    pub use crate::alloc::{AllocTracker, FailPolicy};
    pub use crate::driver::{FileId, MaliDriver};
    pub use crate::error::{DriverError, DriverResult};
    pub use crate::gpu::StubGpu;
    pub use crate::host::sim::SimHost;
    pub use crate::host::{Host, PlatformDevice};
    pub use crate::module::{init, ProbeOutcome, Registration};
    pub use crate::of::DeviceNode;
    pub use crate::{is_supported, version};
}
