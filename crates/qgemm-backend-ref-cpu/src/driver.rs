//! Device driver over host memory.
//!
//! Allocations get synthetic, non-zero, 256-byte aligned addresses so device
//! pointers behave like real ones: offsets inside an allocation resolve, and
//! stale or foreign addresses are rejected.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use qgemm::backend::driver::DeviceDriver;
use qgemm::{BackendError, BackendResult, DevicePtr, NativeStream, StreamHandle};

const BASE_ADDRESS: u64 = 0x1000_0000;
const ALIGNMENT: u64 = 256;
/// Fill byte for fresh allocations; kernels must overwrite every output byte.
pub const POISON: u8 = 0xCD;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostDriverStats {
    pub allocations: u64,
    pub deallocations: u64,
    pub host_to_device_copies: u64,
    pub device_to_host_copies: u64,
    pub synchronizations: u64,
    pub live_allocations: usize,
}

struct Arena {
    next: u64,
    blocks: BTreeMap<u64, Vec<u8>>,
}

impl Arena {
    /// Returns the block containing `[ptr, ptr + len)` and the offset of `ptr` in it.
    fn locate(&mut self, ptr: DevicePtr, len: usize) -> BackendResult<(&mut Vec<u8>, usize)> {
        let (base, block) = self
            .blocks
            .range_mut(..=ptr.0)
            .next_back()
            .ok_or_else(|| unknown_address(ptr))?;
        let offset = (ptr.0 - *base) as usize;
        match offset.checked_add(len) {
            Some(end) if end <= block.len() => Ok((block, offset)),
            _ => Err(BackendError::invalid_operand(format!(
                "access of {len} bytes at {ptr:?} overruns allocation at {:#x} of {} bytes",
                base,
                block.len()
            ))),
        }
    }
}

fn unknown_address(ptr: DevicePtr) -> BackendError {
    BackendError::invalid_operand(format!("{ptr:?} is not a live host allocation"))
}

pub struct HostDriver {
    arena: Mutex<Arena>,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    h2d: AtomicU64,
    d2h: AtomicU64,
    syncs: AtomicU64,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDriver {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena {
                next: BASE_ADDRESS,
                blocks: BTreeMap::new(),
            }),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            h2d: AtomicU64::new(0),
            d2h: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        }
    }

    fn arena(&self) -> BackendResult<std::sync::MutexGuard<'_, Arena>> {
        self.arena
            .lock()
            .map_err(|_| BackendError::execution("host arena mutex poisoned"))
    }

    /// Copies `len` bytes out of device memory without touching the copy counters.
    pub fn read_bytes(&self, ptr: DevicePtr, len: usize) -> BackendResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut arena = self.arena()?;
        let (block, offset) = arena.locate(ptr, len)?;
        Ok(block[offset..offset + len].to_vec())
    }

    /// Like [`HostDriver::read_bytes`], reinterpreting the bytes as int8.
    pub fn read_i8(&self, ptr: DevicePtr, len: usize) -> BackendResult<Vec<i8>> {
        Ok(self
            .read_bytes(ptr, len)?
            .into_iter()
            .map(|byte| byte as i8)
            .collect())
    }

    pub fn write_bytes(&self, ptr: DevicePtr, src: &[u8]) -> BackendResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        let mut arena = self.arena()?;
        let (block, offset) = arena.locate(ptr, src.len())?;
        block[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn write_i8(&self, ptr: DevicePtr, values: &[i8]) -> BackendResult<()> {
        let bytes: Vec<u8> = values.iter().map(|value| *value as u8).collect();
        self.write_bytes(ptr, &bytes)
    }

    pub fn stats(&self) -> HostDriverStats {
        HostDriverStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            host_to_device_copies: self.h2d.load(Ordering::Relaxed),
            device_to_host_copies: self.d2h.load(Ordering::Relaxed),
            synchronizations: self.syncs.load(Ordering::Relaxed),
            live_allocations: self.arena().map(|arena| arena.blocks.len()).unwrap_or(0),
        }
    }

    pub fn is_live(&self, ptr: DevicePtr) -> bool {
        self.arena()
            .map(|arena| arena.blocks.contains_key(&ptr.0))
            .unwrap_or(false)
    }
}

impl DeviceDriver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn allocate(&self, bytes: usize) -> BackendResult<DevicePtr> {
        let mut arena = self.arena()?;
        let addr = arena.next;
        let span = (bytes.max(1) as u64).div_ceil(ALIGNMENT) * ALIGNMENT;
        arena.next = addr
            .checked_add(span)
            .ok_or_else(|| BackendError::execution("host address space exhausted"))?;
        arena.blocks.insert(addr, vec![POISON; bytes]);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(DevicePtr(addr))
    }

    fn deallocate(&self, ptr: DevicePtr) -> BackendResult<()> {
        let mut arena = self.arena()?;
        arena
            .blocks
            .remove(&ptr.0)
            .ok_or_else(|| unknown_address(ptr))?;
        self.deallocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn copy_host_to_device(
        &self,
        _stream: StreamHandle,
        dst: DevicePtr,
        src: &[u8],
    ) -> BackendResult<()> {
        self.h2d.fetch_add(1, Ordering::Relaxed);
        self.write_bytes(dst, src)
    }

    fn copy_device_to_host(
        &self,
        _stream: StreamHandle,
        src: DevicePtr,
        dst: &mut [u8],
    ) -> BackendResult<()> {
        self.d2h.fetch_add(1, Ordering::Relaxed);
        if dst.is_empty() {
            return Ok(());
        }
        let mut arena = self.arena()?;
        let (block, offset) = arena.locate(src, dst.len())?;
        dst.copy_from_slice(&block[offset..offset + dst.len()]);
        Ok(())
    }

    fn synchronize_stream(&self, _stream: StreamHandle) -> BackendResult<()> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn native_stream_handle(&self, stream: StreamHandle) -> BackendResult<NativeStream> {
        Ok(NativeStream(stream.0))
    }
}
