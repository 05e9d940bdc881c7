//! GPU hooks supplied to the driver
//!
//! The driver itself does no GPU work. Ioctl handling, idling and buffer
//! reclaim are delegated to a [`GpuOps`] implementation. [`StubGpu`] is a
//! bookkeeping-only implementation: it tracks heap sizes and object handles
//! but never touches hardware.

use crate::driver::{DevicePrivate, FilePrivate, IoctlDesc, IoctlFlags, Pool};
use crate::error::{DriverError, DriverResult};
use crate::idr::Handle;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Allocate from the framebuffer heap
pub const MALI_FB_ALLOC: u32 = 0x04;
/// Free a framebuffer heap object
pub const MALI_FB_FREE: u32 = 0x05;
/// Set up the general memory heap
pub const MALI_MEM_INIT: u32 = 0x13;
/// Allocate from the general memory heap
pub const MALI_MEM_ALLOC: u32 = 0x14;
/// Free a general memory heap object
pub const MALI_MEM_FREE: u32 = 0x15;
/// Set up the framebuffer heap
pub const MALI_FB_INIT: u32 = 0x16;

const ADMIN: IoctlFlags = IoctlFlags::AUTH
    .union(IoctlFlags::MASTER)
    .union(IoctlFlags::ROOT_ONLY);

/// Mali driver ioctl table
pub static MALI_IOCTLS: &[IoctlDesc] = &[
    IoctlDesc { nr: MALI_FB_ALLOC, name: "MALI_FB_ALLOC", flags: IoctlFlags::AUTH },
    IoctlDesc { nr: MALI_FB_FREE, name: "MALI_FB_FREE", flags: IoctlFlags::AUTH },
    IoctlDesc { nr: MALI_MEM_INIT, name: "MALI_MEM_INIT", flags: ADMIN },
    IoctlDesc { nr: MALI_MEM_ALLOC, name: "MALI_MEM_ALLOC", flags: IoctlFlags::AUTH },
    IoctlDesc { nr: MALI_MEM_FREE, name: "MALI_MEM_FREE", flags: IoctlFlags::AUTH },
    IoctlDesc { nr: MALI_FB_INIT, name: "MALI_FB_INIT", flags: ADMIN },
];

/// Size of the heap init argument: `offset: u64, size: u64`
pub const HEAP_INIT_ARG_SIZE: usize = 16;
/// Size of the alloc argument: `size: u64` in, `handle: u32` out, 4 bytes padding
pub const ALLOC_ARG_SIZE: usize = 16;
/// Size of the free argument: `handle: u32`
pub const FREE_ARG_SIZE: usize = 4;

/// GPU work delegated by the driver
pub trait GpuOps {
    /// Driver ioctl table
    fn ioctls(&self) -> &'static [IoctlDesc];

    /// Handle driver ioctl `nr` for `file`
    fn ioctl(
        &mut self,
        dev: &mut DevicePrivate,
        file: &mut FilePrivate,
        nr: u32,
        data: &mut [u8],
    ) -> DriverResult<i32>;

    /// Wait until the GPU is idle
    fn idle(&mut self, dev: &mut DevicePrivate) -> DriverResult<()>;

    /// Drop the buffers a closing client still holds
    fn reclaim_buffers_locked(&mut self, dev: &mut DevicePrivate, file: &mut FilePrivate);

    /// Called when the last client closed the device
    fn lastclose(&mut self, dev: &mut DevicePrivate);
}

/// Heap set up by an init ioctl
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heap {
    /// Start offset
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
    /// Bytes handed out
    pub used: u64,
}

/// Bookkeeping-only [`GpuOps`]
#[derive(Debug, Clone, Default)]
pub struct StubGpu {
    fb: Option<Heap>,
    mem: Option<Heap>,
    idle_calls: usize,
}

impl StubGpu {
    /// No heap set up
    pub fn new() -> Self {
        Self::default()
    }

    /// Heap backing `pool`, if set up
    pub fn heap(&self, pool: Pool) -> Option<&Heap> {
        match pool {
            Pool::Fb => self.fb.as_ref(),
            Pool::Mem => self.mem.as_ref(),
        }
    }

    /// Number of idle requests served
    pub fn idle_calls(&self) -> usize {
        self.idle_calls
    }

    fn heap_mut(&mut self, pool: Pool) -> &mut Option<Heap> {
        match pool {
            Pool::Fb => &mut self.fb,
            Pool::Mem => &mut self.mem,
        }
    }

    fn init_heap(&mut self, pool: Pool, data: &[u8]) -> DriverResult<i32> {
        let offset = read_u64(data, 0)?;
        let size = read_u64(data, 8)?;
        if let Some(heap) = self.heap(pool).filter(|heap| heap.used > 0) {
            warn!("mali: {:?} heap re-init refused, {} bytes in use", pool, heap.used);
            return Err(DriverError::Busy(format!("{:?} heap has live objects", pool)));
        }
        debug!("mali: {:?} heap at 0x{:x}, {} bytes", pool, offset, size);
        *self.heap_mut(pool) = Some(Heap { offset, size, used: 0 });
        Ok(0)
    }

    fn alloc(&mut self, dev: &mut DevicePrivate, file: &mut FilePrivate, pool: Pool, data: &mut [u8]) -> DriverResult<i32> {
        let size = read_u64(data, 0)?;
        if data.len() < ALLOC_ARG_SIZE {
            return Err(DriverError::InvalidArgument("alloc argument too short".into()));
        }
        let heap = self.heap_mut(pool).as_mut().ok_or_else(|| {
            DriverError::InvalidArgument(format!("{:?} heap is not initialized", pool))
        })?;
        if size == 0 {
            return Err(DriverError::InvalidArgument("zero-sized allocation".into()));
        }
        if heap.size - heap.used < size {
            return Err(DriverError::OutOfMemory("mali heap"));
        }

        let handle = dev.insert_object(file, pool, size)?;
        heap.used += size;
        data[8..12].copy_from_slice(&handle.raw().to_le_bytes());
        Ok(0)
    }

    fn free(&mut self, dev: &mut DevicePrivate, file: &mut FilePrivate, data: &[u8]) -> DriverResult<i32> {
        let handle = Handle::from_raw(read_u32(data, 0)?);
        let obj = dev.remove_object(file, handle)?;
        self.give_back(obj.pool, obj.size);
        Ok(0)
    }

    fn give_back(&mut self, pool: Pool, size: u64) {
        if let Some(heap) = self.heap_mut(pool).as_mut() {
            heap.used = heap.used.saturating_sub(size);
        }
    }
}

impl GpuOps for StubGpu {
    fn ioctls(&self) -> &'static [IoctlDesc] {
        MALI_IOCTLS
    }

    fn ioctl(
        &mut self,
        dev: &mut DevicePrivate,
        file: &mut FilePrivate,
        nr: u32,
        data: &mut [u8],
    ) -> DriverResult<i32> {
        match nr {
            MALI_FB_INIT => self.init_heap(Pool::Fb, data),
            MALI_MEM_INIT => self.init_heap(Pool::Mem, data),
            MALI_FB_ALLOC => self.alloc(dev, file, Pool::Fb, data),
            MALI_MEM_ALLOC => self.alloc(dev, file, Pool::Mem, data),
            MALI_FB_FREE | MALI_MEM_FREE => self.free(dev, file, data),
            _ => Err(DriverError::InvalidArgument(format!("unknown ioctl 0x{:02x}", nr))),
        }
    }

    fn idle(&mut self, _dev: &mut DevicePrivate) -> DriverResult<()> {
        self.idle_calls += 1;
        Ok(())
    }

    fn reclaim_buffers_locked(&mut self, dev: &mut DevicePrivate, file: &mut FilePrivate) {
        let objects = dev.reclaim(file);
        if !objects.is_empty() {
            warn!("mali: reclaiming {} objects left by {}", objects.len(), file.id());
        }
        for obj in objects {
            self.give_back(obj.pool, obj.size);
        }
    }

    fn lastclose(&mut self, _dev: &mut DevicePrivate) {
        self.fb = None;
        self.mem = None;
    }
}

fn read_u64(data: &[u8], offset: usize) -> DriverResult<u64> {
    data.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| DriverError::InvalidArgument(format!("argument shorter than {} bytes", offset + 8)))
}

fn read_u32(data: &[u8], offset: usize) -> DriverResult<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| DriverError::InvalidArgument(format!("argument shorter than {} bytes", offset + 4)))
}

/// Encode a heap init argument
pub fn heap_init_arg(offset: u64, size: u64) -> [u8; HEAP_INIT_ARG_SIZE] {
    let mut arg = [0u8; HEAP_INIT_ARG_SIZE];
    arg[..8].copy_from_slice(&offset.to_le_bytes());
    arg[8..].copy_from_slice(&size.to_le_bytes());
    arg
}

/// Encode an alloc argument
pub fn alloc_arg(size: u64) -> [u8; ALLOC_ARG_SIZE] {
    let mut arg = [0u8; ALLOC_ARG_SIZE];
    arg[..8].copy_from_slice(&size.to_le_bytes());
    arg
}

/// Handle written back by an alloc ioctl
pub fn alloc_arg_handle(arg: &[u8; ALLOC_ARG_SIZE]) -> Handle {
    Handle::from_raw(u32::from_le_bytes([arg[8], arg[9], arg[10], arg[11]]))
}

/// Encode a free argument
pub fn free_arg(handle: Handle) -> [u8; FREE_ARG_SIZE] {
    handle.raw().to_le_bytes()
}
