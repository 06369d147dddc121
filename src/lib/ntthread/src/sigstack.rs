//! Per-thread memory: the control-block region with its signal stack, and the
//! native stacks of worker threads.
//!
//! A region is laid out as
//!
//! ```text
//! base                                                     base + size
//! | Teb | StartupBundle | pad | guard page | signal stack ... |
//! ```
//!
//! and is aligned to its own (power of two) size, so that the base can be
//! recovered from any address inside it.

use std::ffi::c_void;

use log::warn;
use nt_api::{NtResult, NtStatus};
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};

use crate::lifecycle::StartupBundle;
use crate::teb::Teb;

/// Worker stacks are never smaller than this.
const MIN_THREAD_STACK: usize = 64 * 1024;

fn round_up(value: usize, to: usize) -> usize {
    debug_assert!(to.is_power_of_two());
    (value + to - 1) & !(to - 1)
}

/// Offsets within a region. Fixed per process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionLayout {
    pub size: usize,
    pub bundle_offset: usize,
    pub guard_offset: usize,
    pub stack_offset: usize,
    pub page_size: usize,
}

impl RegionLayout {
    /// Layout whose signal stack has at least `min_signal_stack` bytes, and no
    /// less than the host's `MINSIGSTKSZ`.
    pub fn new(min_signal_stack: usize) -> Self {
        let page_size = rustix::param::page_size();
        let stack_size = round_up(min_signal_stack.max(libc::MINSIGSTKSZ), page_size);
        let bundle_offset = round_up(
            std::mem::size_of::<Teb>(),
            std::mem::align_of::<StartupBundle>(),
        );
        let guard_offset = round_up(
            bundle_offset + std::mem::size_of::<StartupBundle>(),
            page_size,
        );
        let stack_offset = guard_offset + page_size;
        Self {
            size: (stack_offset + stack_size).next_power_of_two(),
            bundle_offset,
            guard_offset,
            stack_offset,
            page_size,
        }
    }

    pub fn signal_stack_size(&self) -> usize {
        self.size - self.stack_offset
    }
}

/// A zeroed region, aligned to its size. Unmapped on drop, which must not
/// happen while its thread may still run on the signal stack.
#[derive(Debug)]
pub struct StackRegion {
    base: *mut u8,
    layout: RegionLayout,
}

// SAFETY: plain memory; who may touch it is governed by the thread lifecycle.
unsafe impl Send for StackRegion {}

impl StackRegion {
    pub fn allocate(layout: &RegionLayout) -> NtResult<Self> {
        let size = layout.size;
        // Over-allocate, then trim to an aligned window.
        let raw = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                2 * size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }
        .map_err(|e| {
            warn!("couldn't map a {size:#x} byte thread region: {e}");
            NtStatus::NO_MEMORY
        })?;

        let raw_addr = raw as usize;
        let aligned = round_up(raw_addr, size);
        let head = aligned - raw_addr;
        let tail = size - head;
        unsafe {
            if head > 0 {
                rustix::mm::munmap(raw, head).unwrap();
            }
            if tail > 0 {
                rustix::mm::munmap((aligned + size) as *mut c_void, tail).unwrap();
            }
        }

        let region = Self {
            base: aligned as *mut u8,
            layout: *layout,
        };
        unsafe {
            rustix::mm::mprotect(
                region.base.add(layout.guard_offset).cast(),
                layout.page_size,
                MprotectFlags::empty(),
            )
        }
        .map_err(|e| {
            warn!("couldn't protect the signal stack guard page: {e}");
            // `region` unmaps the window.
            NtStatus::NO_MEMORY
        })?;
        Ok(region)
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn teb(&self) -> *mut Teb {
        self.base.cast()
    }

    pub fn bundle(&self) -> *mut StartupBundle {
        unsafe { self.base.add(self.layout.bundle_offset).cast() }
    }

    /// Lowest address of the signal stack, and its size.
    pub fn signal_stack(&self) -> (*mut u8, usize) {
        (
            unsafe { self.base.add(self.layout.stack_offset) },
            self.layout.signal_stack_size(),
        )
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        unsafe { rustix::mm::munmap(self.base.cast(), self.layout.size) }.unwrap();
    }
}

/// The native stack of a worker thread, with a guard page at the low end.
#[derive(Debug)]
pub struct ThreadStack {
    base: *mut u8,
    len: usize,
    guard: usize,
}

// SAFETY: as for `StackRegion`.
unsafe impl Send for ThreadStack {}

impl ThreadStack {
    /// `reserve` is rounded up to whole pages.
    pub fn allocate(reserve: usize) -> NtResult<Self> {
        let guard = rustix::param::page_size();
        let usable = reserve
            .max(MIN_THREAD_STACK)
            .checked_next_multiple_of(guard)
            .ok_or(NtStatus::NO_MEMORY)?;
        let len = usable.checked_add(guard).ok_or(NtStatus::NO_MEMORY)?;

        let base = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE | MapFlags::NORESERVE,
            )
        }
        .map_err(|e| {
            warn!("couldn't map a {len:#x} byte thread stack: {e}");
            NtStatus::NO_MEMORY
        })?;
        let stack = Self {
            base: base.cast(),
            len,
            guard,
        };
        unsafe { rustix::mm::mprotect(base, guard, MprotectFlags::empty()) }.map_err(|e| {
            warn!("couldn't protect the thread stack guard page: {e}");
            NtStatus::NO_MEMORY
        })?;
        Ok(stack)
    }

    /// Lowest address of the whole mapping, guard page included.
    pub fn allocation_base(&self) -> *mut u8 {
        self.base
    }

    /// Lowest usable address.
    pub fn limit(&self) -> *mut u8 {
        unsafe { self.base.add(self.guard) }
    }

    /// One past the highest usable address.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    pub fn usable_size(&self) -> usize {
        self.len - self.guard
    }
}

impl Drop for ThreadStack {
    fn drop(&mut self) {
        unsafe { rustix::mm::munmap(self.base.cast(), self.len) }.unwrap();
    }
}

/// Makes the signal stack of the region at `base` the calling thread's
/// alternate signal stack.
pub fn install_sigaltstack(base: *mut u8, layout: &RegionLayout) {
    let stack = libc::stack_t {
        ss_sp: base.wrapping_add(layout.stack_offset).cast(),
        ss_flags: 0,
        ss_size: layout.signal_stack_size(),
    };
    let rv = unsafe { libc::sigaltstack(&stack, std::ptr::null_mut()) };
    assert_eq!(rv, 0, "sigaltstack: {}", std::io::Error::last_os_error());
}

/// Removes the calling thread's alternate signal stack.
pub fn disable_sigaltstack() {
    let stack = libc::stack_t {
        ss_sp: std::ptr::null_mut(),
        ss_flags: libc::SS_DISABLE,
        ss_size: 0,
    };
    let rv = unsafe { libc::sigaltstack(&stack, std::ptr::null_mut()) };
    assert_eq!(rv, 0, "sigaltstack: {}", std::io::Error::last_os_error());
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_layout() {
        let layout = RegionLayout::new(100 * 1024);
        assert!(layout.size.is_power_of_two());
        assert!(layout.signal_stack_size() >= 100 * 1024);
        assert!(layout.bundle_offset >= std::mem::size_of::<Teb>());
        assert!(layout.guard_offset >= layout.bundle_offset + std::mem::size_of::<StartupBundle>());
        assert_eq!(layout.guard_offset % layout.page_size, 0);
        assert_eq!(layout.stack_offset, layout.guard_offset + layout.page_size);

        // The host minimum still applies.
        let tiny = RegionLayout::new(1);
        assert!(tiny.signal_stack_size() >= libc::MINSIGSTKSZ);
    }

    #[test]
    fn test_region_alignment() {
        let layout = RegionLayout::new(100 * 1024);
        let regions: Vec<_> = (0..8)
            .map(|_| StackRegion::allocate(&layout).unwrap())
            .collect();
        for region in &regions {
            let base = region.base() as usize;
            assert_eq!(base % layout.size, 0);
            // Zeroed and writable up to the guard page.
            let teb = unsafe { std::slice::from_raw_parts(region.base(), layout.guard_offset) };
            assert!(teb.iter().all(|b| *b == 0));
            let (sp, size) = region.signal_stack();
            unsafe { sp.add(size - 1).write(1) };
            assert_eq!(
                crate::teb::teb_from_stack_address(sp as usize + size / 2, layout.size),
                region.teb()
            );
        }
    }

    #[test]
    fn test_thread_stack() {
        let stack = ThreadStack::allocate(1 << 20).unwrap();
        assert_eq!(stack.usable_size(), 1 << 20);
        assert_eq!(stack.top() as usize - stack.limit() as usize, 1 << 20);
        unsafe { stack.top().sub(1).write(1) };

        // Rounded up to pages, and to the minimum.
        let small = ThreadStack::allocate(1).unwrap();
        assert_eq!(small.usable_size(), MIN_THREAD_STACK);

        assert_eq!(ThreadStack::allocate(1 << 48).err(), Some(NtStatus::NO_MEMORY));
        assert_eq!(ThreadStack::allocate(usize::MAX).err(), Some(NtStatus::NO_MEMORY));
    }
}
