//! Character device file operations and ioctl number encoding

use serde::Serialize;

/// Ioctl type byte of the DRM subsystem (`'d'`)
pub const DRM_IOCTL_BASE: u8 = b'd';
/// First `nr` of driver-specific ioctls
pub const DRM_COMMAND_BASE: u32 = 0x40;
/// One past the last `nr` of driver-specific ioctls
pub const DRM_COMMAND_END: u32 = 0xA0;

/// `_IOC_NONE`
pub const IOC_NONE: u8 = 0;
/// `_IOC_WRITE`
pub const IOC_WRITE: u8 = 1;
/// `_IOC_READ`
pub const IOC_READ: u8 = 2;

/// Build an ioctl command number
pub fn ioc(dir: u8, ty: u8, nr: u8, size: u16) -> u32 {
    ((dir as u32) << 30) | ((size as u32 & 0x3fff) << 16) | ((ty as u32) << 8) | (nr as u32)
}

/// Direction bits of `cmd`
pub fn ioc_dir(cmd: u32) -> u8 {
    (cmd >> 30) as u8
}

/// Type byte of `cmd`
pub fn ioc_type(cmd: u32) -> u8 {
    (cmd >> 8) as u8
}

/// Number byte of `cmd`
pub fn ioc_nr(cmd: u32) -> u32 {
    cmd & 0xff
}

/// Argument size of `cmd`
pub fn ioc_size(cmd: u32) -> u16 {
    ((cmd >> 16) & 0x3fff) as u16
}

/// Command number of driver ioctl `nr` reading and writing `size` bytes
pub fn drm_iowr(nr: u32, size: u16) -> u32 {
    ioc(IOC_READ | IOC_WRITE, DRM_IOCTL_BASE, (DRM_COMMAND_BASE + nr) as u8, size)
}

/// Command number of driver ioctl `nr` only writing `size` bytes to the kernel
pub fn drm_iow(nr: u32, size: u16) -> u32 {
    ioc(IOC_WRITE, DRM_IOCTL_BASE, (DRM_COMMAND_BASE + nr) as u8, size)
}

/// Who services a file operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "handler", rename_all = "snake_case")]
pub enum FopHandler {
    /// Generic DRM core handler
    Generic(&'static str),
    /// Does nothing
    Noop(&'static str),
}

/// File operations of the device node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileOperations {
    /// Open
    pub open: FopHandler,
    /// Release
    pub release: FopHandler,
    /// Unified ioctl entry point
    pub unlocked_ioctl: FopHandler,
    /// Memory map
    pub mmap: FopHandler,
    /// Poll
    pub poll: FopHandler,
    /// 32-bit compatibility ioctl entry point
    pub compat_ioctl: Option<FopHandler>,
    /// Seek
    pub llseek: FopHandler,
}

/// File operations of the Mali DRM device node
pub const MALI_DRIVER_FOPS: FileOperations = FileOperations {
    open: FopHandler::Generic("drm_open"),
    release: FopHandler::Generic("drm_release"),
    unlocked_ioctl: FopHandler::Generic("drm_ioctl"),
    mmap: FopHandler::Generic("drm_legacy_mmap"),
    poll: FopHandler::Generic("drm_poll"),
    #[cfg(feature = "compat")]
    compat_ioctl: Some(FopHandler::Generic("drm_compat_ioctl")),
    #[cfg(not(feature = "compat"))]
    compat_ioctl: None,
    llseek: FopHandler::Noop("noop_llseek"),
};

/// Seek that leaves the file position where it is
pub fn noop_llseek(pos: i64, _offset: i64, _whence: i32) -> i64 {
    pos
}
