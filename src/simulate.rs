//! Board simulation
//!
//! Runs the whole driver lifecycle for a [`BoardConfig`] on a [`SimHost`]:
//! module init, one probe per device, late components, a client workload on
//! every bound DRM device, module exit. The report carries the host event log
//! and the allocation ledger, so leaks and ordering problems are visible.

use crate::alloc::{AllocStats, AllocTracker};
use crate::config::{BoardConfig, Workload};
use crate::driver::fops::{drm_iow, drm_iowr};
use crate::driver::{FileId, MaliDriver};
use crate::error::{DriverError, DriverResult};
use crate::gpu::{
    alloc_arg, alloc_arg_handle, free_arg, heap_init_arg, StubGpu, ALLOC_ARG_SIZE, FREE_ARG_SIZE,
    HEAP_INIT_ARG_SIZE, MALI_MEM_ALLOC, MALI_MEM_FREE, MALI_MEM_INIT,
};
use crate::host::sim::{HostEvent, SimHost};
use crate::host::{Host, PlatformDevice};
use crate::idr::Handle;
use crate::module::{self, ModuleInfo, ProbeOutcome, Registration};
use log::{info, warn};
use serde::Serialize;

/// A failed call, as the host would see it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    /// Negative errno
    pub errno: i32,
    /// Error text
    pub message: String,
}

impl From<&DriverError> for ErrorReport {
    fn from(err: &DriverError) -> Self {
        Self {
            errno: err.to_errno(),
            message: err.to_string(),
        }
    }
}

/// What happened to one device of the board
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceReport {
    /// Device name
    pub device: String,
    /// Probe result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ProbeOutcome>,
    /// Probe or bind failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// One client of a workload session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientReport {
    /// File id, if the open succeeded
    pub file: Option<FileId>,
    /// Whether the client was the master
    pub master: bool,
    /// Handles allocated by the client
    pub handles: Vec<Handle>,
    /// Failed calls
    pub errors: Vec<ErrorReport>,
}

/// Workload run against one DRM device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    /// Minor number of the device
    pub minor: u32,
    /// Clients, in open order
    pub clients: Vec<ClientReport>,
    /// Objects left in the handle table after every client closed
    pub objects_after_close: usize,
}

/// Result of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    /// Board name
    pub board: String,
    /// Module metadata
    pub module: ModuleInfo,
    /// Module init failure; nothing else ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_error: Option<ErrorReport>,
    /// Per-device probe results
    pub devices: Vec<DeviceReport>,
    /// Per-device workload results
    pub sessions: Vec<SessionReport>,
    /// Every host call, in order
    pub events: Vec<HostEvent>,
    /// Allocation ledger at the end of the run
    pub alloc: AllocStats,
}

impl SimReport {
    /// Allocations still held after module exit
    pub fn leaked(&self) -> usize {
        self.alloc.live
    }

    /// Whether every probe and every client call succeeded
    pub fn is_clean(&self) -> bool {
        self.init_error.is_none()
            && self.devices.iter().all(|d| d.error.is_none())
            && self
                .sessions
                .iter()
                .flat_map(|s| &s.clients)
                .all(|c| c.errors.is_empty())
    }
}

/// Simulate `config` from module init to module exit
pub fn run(config: &BoardConfig) -> DriverResult<SimReport> {
    config.validate()?;

    let host = SimHost::new();
    for failure in &config.host_failures {
        host.fail_on(failure.call, failure.negative_errno());
    }
    for path in &config.late_components {
        host.hold_component(path.clone());
    }

    let tracker = AllocTracker::with_policy(config.alloc_failure.clone());
    let driver = MaliDriver::new(StubGpu::new(), tracker.clone());

    let mut report = SimReport {
        board: config.name.clone(),
        module: ModuleInfo::current(),
        init_error: None,
        devices: Vec::new(),
        sessions: Vec::new(),
        events: Vec::new(),
        alloc: tracker.stats(),
    };

    match module::init(&host, driver) {
        Ok(mut reg) => {
            probe_devices(&mut reg, config, &mut report);
            for path in &config.late_components {
                for master in host.release_component(path) {
                    bind_late(&mut reg, &master, &mut report);
                }
            }
            for minor in reg.minors() {
                report.sessions.push(run_workload(&mut reg, minor, &config.workload));
            }
            reg.exit();
        }
        Err(e) => {
            warn!("sim: module init failed: {}", e);
            report.init_error = Some(ErrorReport::from(&e));
        }
    }

    report.events = host.events();
    report.alloc = tracker.stats();
    info!(
        "sim: {} done, {} host events, {} live allocations",
        config.name,
        report.events.len(),
        report.leaked()
    );
    Ok(report)
}

fn probe_devices<H: Host>(reg: &mut Registration<H, StubGpu>, config: &BoardConfig, report: &mut SimReport) {
    for node in &config.devices {
        let pdev = PlatformDevice::from_node(node.clone());
        let device = pdev.dev_name();
        let entry = match reg.device_added(pdev) {
            Ok(outcome) => DeviceReport {
                device,
                outcome: Some(outcome),
                error: None,
            },
            Err(e) => DeviceReport {
                device,
                outcome: None,
                error: Some(ErrorReport::from(&e)),
            },
        };
        report.devices.push(entry);
    }
}

fn bind_late<H: Host>(reg: &mut Registration<H, StubGpu>, master: &str, report: &mut SimReport) {
    let result = reg.components_ready(master);
    if let Some(entry) = report.devices.iter_mut().find(|d| d.device == master) {
        match result {
            Ok(minor) => entry.outcome = Some(ProbeOutcome::Bound { minor }),
            Err(e) => entry.error = Some(ErrorReport::from(&e)),
        }
    }
}

fn run_workload<H: Host>(reg: &mut Registration<H, StubGpu>, minor: u32, workload: &Workload) -> SessionReport {
    let mut clients: Vec<ClientReport> = (0..workload.clients)
        .map(|i| {
            let master = i == 0;
            match reg.open(minor, master) {
                Ok(file) => ClientReport {
                    file: Some(file),
                    master,
                    handles: Vec::new(),
                    errors: Vec::new(),
                },
                Err(e) => ClientReport {
                    file: None,
                    master,
                    handles: Vec::new(),
                    errors: vec![ErrorReport::from(&e)],
                },
            }
        })
        .collect();

    if let Some(master) = clients.first_mut() {
        if let Some(file) = master.file {
            let mut arg = heap_init_arg(0, workload.heap_size);
            let cmd = drm_iow(MALI_MEM_INIT, HEAP_INIT_ARG_SIZE as u16);
            if let Err(e) = reg.ioctl(minor, file, cmd, &mut arg) {
                master.errors.push(ErrorReport::from(&e));
            }
        }
    }

    for client in clients.iter_mut() {
        let Some(file) = client.file else { continue };
        if !client.master {
            if let Err(e) = reg.authenticate(minor, file) {
                client.errors.push(ErrorReport::from(&e));
            }
        }

        let mut arg = alloc_arg(workload.alloc_size);
        let cmd = drm_iowr(MALI_MEM_ALLOC, ALLOC_ARG_SIZE as u16);
        match reg.ioctl(minor, file, cmd, &mut arg) {
            Ok(_) => client.handles.push(alloc_arg_handle(&arg)),
            Err(e) => client.errors.push(ErrorReport::from(&e)),
        }

        if let Err(e) = reg.poll(minor, file) {
            client.errors.push(ErrorReport::from(&e));
        }
        if client.master {
            if let Err(e) = reg.mmap(minor, file, 0, workload.alloc_size) {
                client.errors.push(ErrorReport::from(&e));
            }
        }
    }

    if workload.free_before_close {
        for client in clients.iter_mut() {
            let Some(file) = client.file else { continue };
            for handle in &client.handles {
                let mut arg = free_arg(*handle);
                let cmd = drm_iow(MALI_MEM_FREE, FREE_ARG_SIZE as u16);
                if let Err(e) = reg.ioctl(minor, file, cmd, &mut arg) {
                    client.errors.push(ErrorReport::from(&e));
                }
            }
        }
    }

    let objects_after_close = {
        for client in clients.iter_mut() {
            let Some(file) = client.file else { continue };
            if let Err(e) = reg.release(minor, file) {
                client.errors.push(ErrorReport::from(&e));
            }
        }
        reg.device(minor)
            .map(|d| d.private().objects().len())
            .unwrap_or(0)
    };

    SessionReport {
        minor,
        clients,
        objects_after_close,
    }
}
