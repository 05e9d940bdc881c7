#[cfg(test)]
mod integration_tests {
    use malidrm::driver::fops::{drm_iow, drm_iowr};
    use malidrm::driver::PmMessage;
    use malidrm::gpu::{
        alloc_arg, alloc_arg_handle, free_arg, heap_init_arg, MALI_FB_ALLOC, MALI_FB_INIT, MALI_MEM_ALLOC,
        MALI_MEM_FREE, MALI_MEM_INIT,
    };
    use malidrm::host::sim::{HostCall, HostEvent};
    use malidrm::prelude::*;
    use malidrm::{simulate, BoardConfig, MALI_400_COMPATIBLE};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn gpu_node(path: &str) -> DeviceNode {
        DeviceNode::new(path)
            .with_compatible("allwinner,sun4i-a10-mali")
            .with_compatible(MALI_400_COMPATIBLE)
            .with_child(DeviceNode::new(format!("{}/gp@0", path)))
            .with_child(DeviceNode::new(format!("{}/pp@0", path)))
    }

    fn driver(tracker: &AllocTracker) -> MaliDriver<StubGpu> {
        MaliDriver::new(StubGpu::new(), tracker.clone())
    }

    fn count(host: &SimHost, pred: impl Fn(&HostEvent) -> bool) -> usize {
        host.events().iter().filter(|e| pred(*e)).count()
    }

    #[test]
    fn test_library_initialization() {
        assert!(!malidrm::version().is_empty());
        assert_eq!(malidrm::ModuleInfo::current().license, "GPL and additional rights");
    }

    #[test]
    fn test_init_registers_exactly_one_driver_and_exit_unregisters() {
        let host = SimHost::new();
        let reg = init(&host, driver(&AllocTracker::new())).unwrap();
        assert_eq!(host.registered_drivers(), vec!["mali_drm".to_string()]);
        assert_eq!(
            count(&host, |e| matches!(e, HostEvent::PlatformDriverRegistered { .. })),
            1
        );

        reg.exit();
        assert!(host.registered_drivers().is_empty());
        assert_eq!(
            count(&host, |e| matches!(e, HostEvent::PlatformDriverUnregistered { .. })),
            1
        );
    }

    #[test]
    fn test_second_registration_is_refused() {
        let host = SimHost::new();
        let first = init(&host, driver(&AllocTracker::new())).unwrap();
        let err = init(&host, driver(&AllocTracker::new())).unwrap_err();
        assert_eq!(err.to_errno(), -libc::EBUSY);
        first.exit();
    }

    #[test]
    fn test_full_lifecycle_leaves_nothing_behind() {
        let host = SimHost::new();
        let tracker = AllocTracker::new();
        let mut reg = init(&host, driver(&tracker)).unwrap();

        let outcome = reg
            .device_added(PlatformDevice::from_node(gpu_node("/soc/gpu@1c40000")))
            .unwrap();
        assert_eq!(outcome, ProbeOutcome::Bound { minor: 0 });
        assert_eq!(host.drm_minors(), vec![0]);
        assert_eq!(tracker.live_tags(), vec!["dev_priv"]);

        let file = reg.open(0, true).unwrap();
        assert!(reg.device(0).unwrap().file(file).unwrap().private.objects().is_empty());
        reg.release(0, file).unwrap();

        reg.exit();
        assert_eq!(tracker.live_count(), 0);
        assert!(host.drm_minors().is_empty());
        assert!(host.masters().is_empty());
        assert!(host.registered_devices().is_empty());
    }

    #[test]
    fn test_probe_sets_32bit_dma_mask() {
        let host = SimHost::new();
        let mut reg = init(&host, driver(&AllocTracker::new())).unwrap();
        reg.device_added(PlatformDevice::from_node(gpu_node("/gpu"))).unwrap();
        assert!(host
            .events()
            .contains(&HostEvent::DmaMaskSet { device: "gpu".into(), mask: 0xffff_ffff }));
        reg.exit();
    }

    #[test]
    fn test_node_without_compatible_never_binds() {
        let host = SimHost::new();
        let mut reg = init(&host, driver(&AllocTracker::new())).unwrap();
        let node = DeviceNode::new("/soc/gpu@0")
            .with_compatible("arm,mali-t760")
            .with_child(DeviceNode::new("/soc/gpu@0/core@0"));

        let outcome = reg.device_added(PlatformDevice::from_node(node)).unwrap();
        assert_eq!(outcome, ProbeOutcome::NotMatched);
        assert!(host.drm_minors().is_empty());
        assert_eq!(
            count(&host, |e| matches!(e, HostEvent::ComponentMasterAdded { .. })),
            0
        );
        reg.exit();
    }

    #[test]
    fn test_load_allocation_failure() {
        let host = SimHost::new();
        let tracker = AllocTracker::with_policy(FailPolicy::Tag("dev_priv".into()));
        let mut reg = init(&host, driver(&tracker)).unwrap();

        let err = reg
            .device_added(PlatformDevice::from_node(gpu_node("/gpu")))
            .unwrap_err();
        assert_eq!(err.to_errno(), -libc::ENOMEM);
        assert!(host.drm_minors().is_empty());
        assert!(host.registered_devices().is_empty());
        assert!(reg.driver().default_platform_device().is_none());
        assert!(host.masters().is_empty());
        assert_eq!(tracker.live_count(), 0);
        reg.exit();
    }

    #[test]
    fn test_open_allocation_failure() {
        let host = SimHost::new();
        let tracker = AllocTracker::new();
        let mut reg = init(&host, driver(&tracker)).unwrap();
        reg.device_added(PlatformDevice::from_node(gpu_node("/gpu"))).unwrap();

        tracker.set_policy(FailPolicy::Tag("file_priv".into()));
        let err = reg.open(0, false).unwrap_err();
        assert_eq!(err.to_errno(), -libc::ENOMEM);
        assert_eq!(reg.device(0).unwrap().open_count(), 0);
        assert_eq!(tracker.live_tags(), vec!["dev_priv"]);

        tracker.set_policy(FailPolicy::Never);
        let file = reg.open(0, false).unwrap();
        assert!(reg.device(0).unwrap().file(file).unwrap().is_master);
        reg.exit();
        assert_eq!(tracker.live_count(), 0);
    }

    #[rstest]
    #[case(HostCall::ComponentMasterAdd, -libc::EPERM)]
    #[case(HostCall::DrmDevRegister, -libc::ENFILE)]
    #[case(HostCall::DmaSetCoherentMask, -libc::EIO)]
    fn test_host_errors_propagate_verbatim(#[case] call: HostCall, #[case] errno: i32) {
        let host = SimHost::new();
        let tracker = AllocTracker::new();
        host.fail_on(call, errno);
        let mut reg = init(&host, driver(&tracker)).unwrap();

        let err = reg
            .device_added(PlatformDevice::from_node(gpu_node("/gpu")))
            .unwrap_err();
        assert_eq!(err.to_errno(), errno);
        assert!(reg.minors().is_empty());
        assert!(host.drm_minors().is_empty());
        assert_eq!(tracker.live_count(), 0);
        reg.exit();
    }

    #[test]
    fn test_deferred_bind() {
        let host = SimHost::new();
        host.hold_component("/gpu/pp@0");
        let mut reg = init(&host, driver(&AllocTracker::new())).unwrap();

        let outcome = reg.device_added(PlatformDevice::from_node(gpu_node("/gpu"))).unwrap();
        assert_eq!(outcome, ProbeOutcome::Deferred);
        assert!(host.drm_minors().is_empty());

        assert!(host.release_component("/gpu/gp@0").is_empty());
        let ready = host.release_component("/gpu/pp@0");
        assert_eq!(ready, vec!["gpu".to_string()]);
        assert_eq!(reg.components_ready("gpu").unwrap(), 0);
        assert_eq!(reg.minors(), vec![0]);
        reg.exit();
    }

    #[test]
    fn test_device_removed_unbinds() {
        let host = SimHost::new();
        let tracker = AllocTracker::new();
        let mut reg = init(&host, driver(&tracker)).unwrap();
        reg.device_added(PlatformDevice::from_node(gpu_node("/gpu"))).unwrap();
        reg.open(0, false).unwrap();

        reg.device_removed("gpu").unwrap();
        assert!(reg.minors().is_empty());
        assert_eq!(tracker.live_count(), 0);
        let events = host.events();
        let tail: Vec<_> = events[events.len() - 3..].to_vec();
        assert_eq!(
            tail,
            vec![
                HostEvent::DrmDeviceUnregistered { minor: 0 },
                HostEvent::ComponentMasterDeleted { master: "gpu".into() },
                HostEvent::Depopulated { parent: "gpu".into() },
            ]
        );
        assert_eq!(reg.device_removed("gpu").unwrap_err().to_errno(), -libc::ENODEV);
        reg.exit();
    }

    #[test]
    fn test_ioctl_workflow() {
        let host = SimHost::new();
        let tracker = AllocTracker::new();
        let mut reg = init(&host, driver(&tracker)).unwrap();
        reg.device_added(PlatformDevice::from_node(gpu_node("/gpu"))).unwrap();

        let master = reg.open(0, true).unwrap();
        let client = reg.open(0, false).unwrap();

        // Heap setup needs master and root.
        let init_cmd = drm_iow(MALI_MEM_INIT, 16);
        let err = reg.ioctl(0, client, init_cmd, &mut heap_init_arg(0, 1 << 16)).unwrap_err();
        assert_eq!(err.to_errno(), -libc::EACCES);
        reg.ioctl(0, master, init_cmd, &mut heap_init_arg(0, 1 << 16)).unwrap();

        // Allocation needs authentication.
        let alloc_cmd = drm_iowr(MALI_MEM_ALLOC, 16);
        let mut arg = alloc_arg(4096);
        assert_eq!(reg.ioctl(0, client, alloc_cmd, &mut arg).unwrap_err().to_errno(), -libc::EACCES);
        reg.authenticate(0, client).unwrap();
        reg.ioctl(0, client, alloc_cmd, &mut arg).unwrap();
        let handle = alloc_arg_handle(&arg);
        assert_eq!(handle.raw(), 1);

        // Only the owner may free.
        let free_cmd = drm_iow(MALI_MEM_FREE, 4);
        let err = reg.ioctl(0, master, free_cmd, &mut free_arg(handle)).unwrap_err();
        assert_eq!(err.to_errno(), -libc::EINVAL);
        reg.ioctl(0, client, free_cmd, &mut free_arg(handle)).unwrap();

        // The framebuffer heap was never set up.
        let mut arg = alloc_arg(4096);
        let err = reg.ioctl(0, master, drm_iowr(MALI_FB_ALLOC, 16), &mut arg).unwrap_err();
        assert_eq!(err.to_errno(), -libc::EINVAL);
        reg.ioctl(0, master, drm_iow(MALI_FB_INIT, 16), &mut heap_init_arg(0, 8192)).unwrap();
        reg.ioctl(0, master, drm_iowr(MALI_FB_ALLOC, 16), &mut arg).unwrap();
        let err = reg.ioctl(0, master, drm_iow(MALI_FB_INIT, 16), &mut heap_init_arg(0, 8192)).unwrap_err();
        assert_eq!(err.to_errno(), -libc::EBUSY);

        // Past the table and into a hole.
        assert_eq!(reg.ioctl(0, master, drm_iowr(0x17, 16), &mut [0u8; 16]).unwrap_err().to_errno(), -libc::EINVAL);
        assert_eq!(reg.ioctl(0, master, drm_iowr(0x10, 16), &mut [0u8; 16]).unwrap_err().to_errno(), -libc::EINVAL);

        reg.exit();
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_close_reclaims_objects_and_reuses_handles() {
        let host = SimHost::new();
        let mut reg = init(&host, driver(&AllocTracker::new())).unwrap();
        reg.device_added(PlatformDevice::from_node(gpu_node("/gpu"))).unwrap();

        let master = reg.open(0, true).unwrap();
        let client = reg.open(0, false).unwrap();
        reg.authenticate(0, client).unwrap();
        reg.ioctl(0, master, drm_iow(MALI_MEM_INIT, 16), &mut heap_init_arg(0, 1 << 20)).unwrap();

        let alloc_cmd = drm_iowr(MALI_MEM_ALLOC, 16);
        let mut handles = Vec::new();
        for file in [client, client, master] {
            let mut arg = alloc_arg(128);
            reg.ioctl(0, file, alloc_cmd, &mut arg).unwrap();
            handles.push(alloc_arg_handle(&arg).raw());
        }
        assert_eq!(handles, vec![1, 2, 3]);

        reg.release(0, client).unwrap();
        assert_eq!(reg.device(0).unwrap().private().objects().len(), 1);

        // Handles 1 and 2 are free again; the lowest is handed out first.
        let mut arg = alloc_arg(128);
        reg.ioctl(0, master, alloc_cmd, &mut arg).unwrap();
        assert_eq!(alloc_arg_handle(&arg).raw(), 1);
        reg.exit();
    }

    #[test]
    fn test_file_operations() {
        let host = SimHost::new();
        let mut reg = init(&host, driver(&AllocTracker::new())).unwrap();
        reg.device_added(PlatformDevice::from_node(gpu_node("/gpu"))).unwrap();
        let file = reg.open(0, false).unwrap();

        assert_eq!(reg.poll(0, file).unwrap(), libc::POLLOUT as u32);
        reg.mmap(0, file, 0x1000, 4096).unwrap();
        assert!(host.events().contains(&HostEvent::Mmap { minor: 0, offset: 0x1000, len: 4096 }));
        assert_eq!(reg.llseek(0, file, 42, 100, 0).unwrap(), 42);
        #[cfg(feature = "compat")]
        assert_eq!(
            reg.compat_ioctl(0, file, drm_iowr(0x17, 4), &mut [0u8; 4]).unwrap_err().to_errno(),
            -libc::EINVAL
        );
        reg.dma_quiescent(0).unwrap();
        assert_eq!(reg.driver().gpu().idle_calls(), 1);

        reg.suspend(PmMessage::Suspend).unwrap();
        reg.resume().unwrap();

        reg.release(0, file).unwrap();
        assert_eq!(reg.poll(0, file).unwrap_err().to_errno(), -libc::EINVAL);
        reg.exit();
    }

    #[test]
    fn test_two_gpus_get_distinct_minors() {
        let host = SimHost::new();
        let tracker = AllocTracker::new();
        let mut reg = init(&host, driver(&tracker)).unwrap();
        reg.device_added(PlatformDevice::from_node(gpu_node("/soc/gpu@1000"))).unwrap();
        let err = reg
            .device_added(PlatformDevice::from_node(gpu_node("/soc/gpu@1000")))
            .unwrap_err();
        assert_eq!(err.to_errno(), -libc::EBUSY);

        let second = PlatformDevice::from_node(gpu_node("/soc/gpu@2000"));
        assert_eq!(second.dev_name(), "2000.gpu");
        assert_eq!(reg.device_added(second).unwrap(), ProbeOutcome::Bound { minor: 1 });
        assert_eq!(reg.minors(), vec![0, 1]);
        assert_eq!(tracker.live_tags(), vec!["dev_priv", "dev_priv"]);

        reg.device_removed("1000.gpu").unwrap();
        assert_eq!(reg.minors(), vec![1]);
        reg.exit();
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_dropped_registration_cleans_up() {
        let host = SimHost::new();
        let tracker = AllocTracker::new();
        {
            let mut reg = init(&host, driver(&tracker)).unwrap();
            reg.device_added(PlatformDevice::from_node(gpu_node("/gpu"))).unwrap();
        }
        assert!(host.registered_drivers().is_empty());
        assert!(host.drm_minors().is_empty());
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_simulate_board_file() {
        let json = r#"{
            "name": "a10",
            "devices": [
                {
                    "path": "/soc/gpu@1c40000",
                    "compatible": ["arm,mali-400"],
                    "children": [ { "path": "/soc/gpu@1c40000/gp@0" } ]
                },
                { "path": "/soc/uart@1c28000", "compatible": ["snps,dw-apb-uart"] }
            ],
            "workload": { "clients": 3, "free_before_close": true }
        }"#;
        let config = BoardConfig::from_json(json).unwrap();
        let report = simulate::run(&config).unwrap();

        assert!(report.is_clean());
        assert_eq!(report.devices[1].outcome, Some(ProbeOutcome::NotMatched));
        assert_eq!(report.sessions[0].clients.len(), 3);
        assert_eq!(report.leaked(), 0);
        assert!(matches!(report.events.last(), Some(HostEvent::PlatformDriverUnregistered { .. })));
    }

    #[test]
    fn test_sample_board() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/boards/sun4i-a10.json");
        let config = malidrm::load_board_config(path).unwrap();
        let report = simulate::run(&config).unwrap();

        assert!(report.is_clean(), "{:#?}", report);
        assert_eq!(report.devices[0].outcome, Some(ProbeOutcome::Bound { minor: 0 }));
        let components = report.events.iter().find_map(|e| match e {
            HostEvent::ComponentMasterAdded { components, .. } => Some(components.len()),
            _ => None,
        });
        assert_eq!(components, Some(2));
        assert_eq!(report.leaked(), 0);
    }
}
