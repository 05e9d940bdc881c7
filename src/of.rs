//! Device-tree nodes and match tables
//!
//! Nodes arrive already parsed (from the host, or from a board description
//! file); this module only answers "does this node belong to us" and "which
//! children are usable components".

use serde::{Deserialize, Serialize};

/// Compatible string of the Mali-400 GPU node
pub const MALI_400_COMPATIBLE: &str = "arm,mali-400";

/// A device-tree node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNode {
    /// Full path, e.g. `/soc/gpu@1c40000`
    pub path: String,
    /// Values of the `compatible` property
    #[serde(default)]
    pub compatible: Vec<String>,
    /// Value of the `status` property, if present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Child nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DeviceNode>,
}

impl DeviceNode {
    /// Node without properties or children
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            compatible: Vec::new(),
            status: None,
            children: Vec::new(),
        }
    }

    /// Add a compatible string
    pub fn with_compatible(mut self, compatible: impl Into<String>) -> Self {
        self.compatible.push(compatible.into());
        self
    }

    /// Set the `status` property
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Add a child node
    pub fn with_child(mut self, child: DeviceNode) -> Self {
        self.children.push(child);
        self
    }

    /// Node name without the unit address (`gpu` for `/soc/gpu@1c40000`)
    pub fn name(&self) -> &str {
        let last = self.path.rsplit('/').next().unwrap_or("");
        last.split('@').next().unwrap_or(last)
    }

    /// Unit address of the node (`1c40000` for `/soc/gpu@1c40000`)
    pub fn unit_address(&self) -> Option<&str> {
        let last = self.path.rsplit('/').next().unwrap_or("");
        last.split_once('@').map(|(_, addr)| addr).filter(|addr| !addr.is_empty())
    }

    /// Whether the node is enabled: no `status`, or `okay`/`ok`
    pub fn is_available(&self) -> bool {
        match self.status.as_deref() {
            None => true,
            Some(status) => status == "okay" || status == "ok",
        }
    }

    /// Whether any `compatible` entry equals `compat`, ignoring ASCII case
    pub fn is_compatible(&self, compat: &str) -> bool {
        self.compatible.iter().any(|c| c.eq_ignore_ascii_case(compat))
    }

    /// Enabled children, in declaration order
    pub fn available_children(&self) -> impl Iterator<Item = &DeviceNode> {
        self.children.iter().filter(|child| child.is_available())
    }

    /// Node identity comparison used when matching components
    pub fn same_node(&self, other: &DeviceNode) -> bool {
        self.path == other.path
    }
}

/// One entry of an OF match table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceId {
    /// Match on a `compatible` string
    Compatible(&'static str),
}

/// OF match table of a platform driver
#[derive(Debug, Clone, Copy)]
pub struct OfMatchTable {
    ids: &'static [DeviceId],
}

impl OfMatchTable {
    /// Table over the given ids
    pub const fn new(ids: &'static [DeviceId]) -> Self {
        Self { ids }
    }

    /// Ids in table order
    pub fn ids(&self) -> &'static [DeviceId] {
        self.ids
    }

    /// First id matching `node`
    pub fn match_node(&self, node: &DeviceNode) -> Option<&'static DeviceId> {
        self.ids.iter().find(|id| match id {
            DeviceId::Compatible(compat) => node.is_compatible(compat),
        })
    }

    /// Whether a node carrying exactly this compatible string would match
    pub fn matches_compatible(&self, compatible: &str) -> bool {
        self.ids.iter().any(|id| match id {
            DeviceId::Compatible(compat) => compat.eq_ignore_ascii_case(compatible),
        })
    }

    /// Module aliases used for autoloading, as emitted for `MODULE_DEVICE_TABLE(of, ...)`
    pub fn modaliases(&self) -> Vec<String> {
        self.ids
            .iter()
            .flat_map(|id| match id {
                DeviceId::Compatible(compat) => [
                    format!("of:N*T*C{}", compat),
                    format!("of:N*T*C{}C*", compat),
                ],
            })
            .collect()
    }
}

/// Device-tree ids served by this driver
pub const MALI_DT_IDS: OfMatchTable = OfMatchTable::new(&[DeviceId::Compatible(MALI_400_COMPATIBLE)]);
