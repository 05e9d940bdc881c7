//! Board description for the simulator
//!
//! A board is described in JSON: the device-tree nodes offered to the driver,
//! the host calls and allocation sites to fail, the components that probe late,
//! and the client workload run against each DRM device.

use crate::alloc::FailPolicy;
use crate::error::{DriverError, DriverResult};
use crate::host::sim::HostCall;
use crate::of::DeviceNode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A host call failed on purpose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFailure {
    /// Host service to fail
    pub call: HostCall,
    /// Errno to fail with; either sign is accepted
    pub errno: i32,
}

impl HostFailure {
    /// Negative errno as the host reports it
    pub fn negative_errno(&self) -> i32 {
        -self.errno.abs()
    }
}

/// Client workload run against each bound DRM device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workload {
    /// Clients opened per device; the first one is the privileged master
    pub clients: u32,
    /// Size of the memory heap the master sets up
    pub heap_size: u64,
    /// Allocation each client requests
    pub alloc_size: u64,
    /// Whether clients free their objects before closing
    pub free_before_close: bool,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            clients: 2,
            heap_size: 1 << 20,
            alloc_size: 4096,
            free_before_close: false,
        }
    }
}

/// Board description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Board name, used in reports
    #[serde(default)]
    pub name: String,
    /// Device-tree nodes turned into platform devices, in order
    pub devices: Vec<DeviceNode>,
    /// Allocation failure policy
    #[serde(default)]
    pub alloc_failure: FailPolicy,
    /// Host calls to fail
    #[serde(default)]
    pub host_failures: Vec<HostFailure>,
    /// Component paths that probe only after their master
    #[serde(default)]
    pub late_components: Vec<String>,
    /// Client workload
    #[serde(default)]
    pub workload: Workload,
}

impl BoardConfig {
    /// Parse a board description from JSON
    pub fn from_json(json: &str) -> DriverResult<Self> {
        let config: BoardConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the description for obvious mistakes
    pub fn validate(&self) -> DriverResult<()> {
        if self.devices.is_empty() {
            return Err(DriverError::InvalidArgument("board has no devices".into()));
        }
        for path in &self.late_components {
            if !self.devices.iter().any(|d| contains_path(d, path)) {
                return Err(DriverError::InvalidArgument(format!("late component {} is not on the board", path)));
            }
        }
        Ok(())
    }
}

fn contains_path(node: &DeviceNode, path: &str) -> bool {
    node.path == path || node.children.iter().any(|c| contains_path(c, path))
}

/// Load a board description from a JSON file
pub fn load_board_config<P: AsRef<Path>>(path: P) -> DriverResult<BoardConfig> {
    let json = fs::read_to_string(path)?;
    BoardConfig::from_json(&json)
}
