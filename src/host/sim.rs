//! In-memory host
//!
//! `SimHost` implements [`Host`] without a kernel. It keeps the registries the
//! real driver core would keep, records every call as a [`HostEvent`], and can
//! be told to fail a given call with a chosen errno.

use super::{ComponentMatch, Host, MasterState, PlatformDevice};
use crate::driver::DriverInfo;
use crate::error::{DriverError, DriverResult};
use crate::of::OfMatchTable;
use log::debug;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;

/// Host services that can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostCall {
    /// [`Host::platform_driver_register`]
    PlatformDriverRegister,
    /// [`Host::platform_device_register_simple`]
    PlatformDeviceRegister,
    /// [`Host::component_master_add_with_match`]
    ComponentMasterAdd,
    /// [`Host::dma_set_coherent_mask`]
    DmaSetCoherentMask,
    /// [`Host::drm_dev_register`]
    DrmDevRegister,
    /// [`Host::drm_legacy_mmap`]
    DrmLegacyMmap,
}

impl HostCall {
    fn name(self) -> &'static str {
        match self {
            HostCall::PlatformDriverRegister => "platform_driver_register",
            HostCall::PlatformDeviceRegister => "platform_device_register_simple",
            HostCall::ComponentMasterAdd => "component_master_add_with_match",
            HostCall::DmaSetCoherentMask => "dma_set_coherent_mask",
            HostCall::DrmDevRegister => "drm_dev_register",
            HostCall::DrmLegacyMmap => "drm_legacy_mmap",
        }
    }
}

/// One recorded host call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    /// A platform driver was registered
    PlatformDriverRegistered {
        /// Driver name
        name: String,
        /// Compatible strings of its match table
        compatible: Vec<String>,
    },
    /// A platform driver was unregistered
    PlatformDriverUnregistered {
        /// Driver name
        name: String,
    },
    /// A platform device was registered by name
    PlatformDeviceRegistered {
        /// Device name
        device: String,
    },
    /// A platform device was unregistered
    PlatformDeviceUnregistered {
        /// Device name
        device: String,
    },
    /// A component master was added
    ComponentMasterAdded {
        /// Master device name
        master: String,
        /// Component node paths
        components: Vec<String>,
        /// Readiness reported back
        state: MasterState,
    },
    /// A component master was removed
    ComponentMasterDeleted {
        /// Master device name
        master: String,
    },
    /// Child devices of a node were destroyed
    Depopulated {
        /// Parent device name
        parent: String,
    },
    /// A coherent DMA mask was set
    DmaMaskSet {
        /// Device name
        device: String,
        /// Mask value
        mask: u64,
    },
    /// A DRM device was registered
    DrmDeviceRegistered {
        /// Assigned minor
        minor: u32,
        /// Driver name
        driver: String,
        /// Parent device name
        device: String,
    },
    /// A DRM device was unregistered
    DrmDeviceUnregistered {
        /// Minor number
        minor: u32,
    },
    /// The legacy mmap handler ran
    Mmap {
        /// Minor number
        minor: u32,
        /// Map offset
        offset: u64,
        /// Map length
        len: u64,
    },
    /// A host call was failed on purpose
    Failed {
        /// Failed service
        call: HostCall,
        /// Negative errno returned
        errno: i32,
    },
}

#[derive(Debug, Default)]
struct SimState {
    events: Vec<HostEvent>,
    drivers: BTreeSet<String>,
    devices: Vec<PlatformDevice>,
    masters: BTreeMap<String, ComponentMatch>,
    drm_minors: BTreeMap<u32, String>,
    next_minor: u32,
    failures: HashMap<HostCall, i32>,
    missing_components: BTreeSet<String>,
}

/// In-memory host framework
#[derive(Debug, Default)]
pub struct SimHost {
    state: RefCell<SimState>,
}

impl SimHost {
    /// Host with empty registries
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `call` fail with `errno` (negative)
    pub fn fail_on(&self, call: HostCall, errno: i32) {
        self.state.borrow_mut().failures.insert(call, errno);
    }

    /// Stop failing `call`
    pub fn clear_failure(&self, call: HostCall) {
        self.state.borrow_mut().failures.remove(&call);
    }

    /// Treat the component at `path` as not probed yet
    pub fn hold_component(&self, path: impl Into<String>) {
        self.state.borrow_mut().missing_components.insert(path.into());
    }

    /// Mark the component at `path` as present again
    ///
    /// Returns the masters whose components are now all present; the caller
    /// binds them.
    pub fn release_component(&self, path: &str) -> Vec<String> {
        let mut state = self.state.borrow_mut();
        state.missing_components.remove(path);
        let missing = &state.missing_components;
        state
            .masters
            .iter()
            .filter(|(_, components)| components.nodes().iter().any(|n| n.path == path))
            .filter(|(_, components)| components.nodes().iter().all(|n| !missing.contains(&n.path)))
            .map(|(master, _)| master.clone())
            .collect()
    }

    /// Every call recorded so far
    pub fn events(&self) -> Vec<HostEvent> {
        self.state.borrow().events.clone()
    }

    /// Registered platform driver names
    pub fn registered_drivers(&self) -> Vec<String> {
        self.state.borrow().drivers.iter().cloned().collect()
    }

    /// Platform devices registered by name and not yet unregistered
    pub fn registered_devices(&self) -> Vec<PlatformDevice> {
        self.state.borrow().devices.clone()
    }

    /// Minor numbers of the registered DRM devices
    pub fn drm_minors(&self) -> Vec<u32> {
        self.state.borrow().drm_minors.keys().copied().collect()
    }

    /// Names of the masters currently added
    pub fn masters(&self) -> Vec<String> {
        self.state.borrow().masters.keys().cloned().collect()
    }

    /// Event log as pretty JSON
    pub fn events_json(&self) -> DriverResult<String> {
        Ok(serde_json::to_string_pretty(&self.state.borrow().events)?)
    }

    /// Write the event log to a JSON file
    pub fn export_events(&self, path: &str) -> io::Result<()> {
        let json = self
            .events_json()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        fs::write(path, json)
    }

    fn record(&self, event: HostEvent) {
        debug!("host: {:?}", event);
        self.state.borrow_mut().events.push(event);
    }

    fn check(&self, call: HostCall) -> DriverResult<()> {
        let errno = self.state.borrow().failures.get(&call).copied();
        match errno {
            Some(errno) => {
                self.record(HostEvent::Failed { call, errno });
                Err(DriverError::from_errno(call.name(), errno))
            }
            None => Ok(()),
        }
    }
}

impl Host for SimHost {
    fn platform_driver_register(&self, name: &str, of_match: &OfMatchTable) -> DriverResult<()> {
        self.check(HostCall::PlatformDriverRegister)?;
        if !self.state.borrow_mut().drivers.insert(name.to_string()) {
            return Err(DriverError::Busy(format!("driver {} already registered", name)));
        }
        let compatible = of_match
            .ids()
            .iter()
            .map(|id| match id {
                crate::of::DeviceId::Compatible(c) => c.to_string(),
            })
            .collect();
        self.record(HostEvent::PlatformDriverRegistered {
            name: name.to_string(),
            compatible,
        });
        Ok(())
    }

    fn platform_driver_unregister(&self, name: &str) {
        self.state.borrow_mut().drivers.remove(name);
        self.record(HostEvent::PlatformDriverUnregistered {
            name: name.to_string(),
        });
    }

    fn platform_device_register_simple(&self, name: &str, id: i32) -> DriverResult<PlatformDevice> {
        self.check(HostCall::PlatformDeviceRegister)?;
        let pdev = PlatformDevice::simple(name, id);
        {
            let mut state = self.state.borrow_mut();
            if state.devices.iter().any(|d| d.dev_name() == pdev.dev_name()) {
                return Err(DriverError::Busy(format!("device {} exists", pdev.dev_name())));
            }
            state.devices.push(pdev.clone());
        }
        self.record(HostEvent::PlatformDeviceRegistered {
            device: pdev.dev_name(),
        });
        Ok(pdev)
    }

    fn platform_device_unregister(&self, pdev: &PlatformDevice) {
        let name = pdev.dev_name();
        self.state
            .borrow_mut()
            .devices
            .retain(|d| d.dev_name() != name);
        self.record(HostEvent::PlatformDeviceUnregistered { device: name });
    }

    fn component_master_add_with_match(
        &self,
        master: &PlatformDevice,
        components: &ComponentMatch,
    ) -> DriverResult<MasterState> {
        self.check(HostCall::ComponentMasterAdd)?;
        let state = {
            let mut sim = self.state.borrow_mut();
            let ready = components
                .nodes()
                .iter()
                .all(|n| !sim.missing_components.contains(&n.path));
            sim.masters.insert(master.dev_name(), components.clone());
            if ready {
                MasterState::Ready
            } else {
                MasterState::Waiting
            }
        };
        self.record(HostEvent::ComponentMasterAdded {
            master: master.dev_name(),
            components: components.nodes().iter().map(|n| n.path.clone()).collect(),
            state,
        });
        Ok(state)
    }

    fn component_master_del(&self, master: &PlatformDevice) {
        self.state.borrow_mut().masters.remove(&master.dev_name());
        self.record(HostEvent::ComponentMasterDeleted {
            master: master.dev_name(),
        });
    }

    fn of_platform_depopulate(&self, parent: &PlatformDevice) {
        self.record(HostEvent::Depopulated {
            parent: parent.dev_name(),
        });
    }

    fn dma_set_coherent_mask(&self, pdev: &PlatformDevice, mask: u64) -> DriverResult<()> {
        self.check(HostCall::DmaSetCoherentMask)?;
        self.record(HostEvent::DmaMaskSet {
            device: pdev.dev_name(),
            mask,
        });
        Ok(())
    }

    fn drm_dev_register(&self, info: &DriverInfo, pdev: &PlatformDevice) -> DriverResult<u32> {
        self.check(HostCall::DrmDevRegister)?;
        let minor = {
            let mut state = self.state.borrow_mut();
            let minor = state.next_minor;
            state.next_minor += 1;
            state.drm_minors.insert(minor, pdev.dev_name());
            minor
        };
        self.record(HostEvent::DrmDeviceRegistered {
            minor,
            driver: info.name.to_string(),
            device: pdev.dev_name(),
        });
        Ok(minor)
    }

    fn drm_dev_unregister(&self, minor: u32) {
        self.state.borrow_mut().drm_minors.remove(&minor);
        self.record(HostEvent::DrmDeviceUnregistered { minor });
    }

    fn drm_legacy_mmap(&self, minor: u32, offset: u64, len: u64) -> DriverResult<()> {
        self.check(HostCall::DrmLegacyMmap)?;
        if !self.state.borrow().drm_minors.contains_key(&minor) {
            return Err(DriverError::NoDevice(format!("minor {}", minor)));
        }
        self.record(HostEvent::Mmap { minor, offset, len });
        Ok(())
    }

    fn drm_poll(&self, minor: u32) -> u32 {
        // No event queue: a registered device is always writable, never readable.
        if self.state.borrow().drm_minors.contains_key(&minor) {
            libc::POLLOUT as u32
        } else {
            libc::POLLERR as u32
        }
    }
}
