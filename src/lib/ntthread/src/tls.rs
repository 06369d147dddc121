//! TLS slots.
//!
//! Indices below [`TLS_MINIMUM_AVAILABLE`] live inline in [`Teb::tls_slots`];
//! the next [`TLS_EXPANSION_SLOTS`] in an array the thread allocates the first
//! time it stores into that range. Only the owning thread allocates or stores,
//! except that a freed index is zeroed in every thread.

use std::ffi::c_void;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

use log::debug;
use nt_api::{NtResult, NtStatus};

use crate::teb::{current, Teb};

pub const TLS_MINIMUM_AVAILABLE: usize = 64;
pub const TLS_EXPANSION_SLOTS: usize = 1024;

const TLS_SLOTS: usize = TLS_MINIMUM_AVAILABLE + TLS_EXPANSION_SLOTS;
const WORDS: usize = TLS_SLOTS / 64;

static_assertions::const_assert_eq!(TLS_SLOTS % 64, 0);

/// Allocated indices of a process, both ranges.
#[derive(Debug)]
pub(crate) struct TlsBitmap {
    words: [u64; WORDS],
}

impl TlsBitmap {
    pub fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Takes the lowest free index.
    pub fn alloc(&mut self) -> Option<u32> {
        let (word_index, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let bit = (!*word).trailing_zeros();
        *word |= 1 << bit;
        Some(word_index as u32 * 64 + bit)
    }

    /// False if `index` wasn't allocated.
    pub fn free(&mut self, index: u32) -> bool {
        if !self.is_allocated(index) {
            return false;
        }
        self.words[index as usize / 64] &= !(1 << (index % 64));
        true
    }

    pub fn is_allocated(&self, index: u32) -> bool {
        let index = index as usize;
        index < TLS_SLOTS && self.words[index / 64] & (1 << (index % 64)) != 0
    }
}

enum Slot {
    Fixed(usize),
    Expansion(usize),
}

fn locate(index: u32) -> NtResult<Slot> {
    let index = index as usize;
    if index < TLS_MINIMUM_AVAILABLE {
        Ok(Slot::Fixed(index))
    } else if index < TLS_SLOTS {
        Ok(Slot::Expansion(index - TLS_MINIMUM_AVAILABLE))
    } else {
        Err(NtStatus::INVALID_PARAMETER)
    }
}

/// The cell for `slot` in `teb`, or `None` for an expansion slot whose
/// array doesn't exist.
fn cell<'a>(teb: &'a Teb, slot: &Slot) -> Option<&'a AtomicPtr<c_void>> {
    match *slot {
        Slot::Fixed(index) => Some(&teb.tls_slots[index]),
        Slot::Expansion(offset) => {
            let array = teb.tls_expansion_slots.load(Ordering::Acquire);
            // SAFETY: published arrays hold `TLS_EXPANSION_SLOTS` cells and
            // live as long as the block.
            (!array.is_null()).then(|| unsafe { &*array.add(offset) })
        }
    }
}

fn expansion_array(teb: &Teb) -> *mut AtomicPtr<c_void> {
    let array = teb.tls_expansion_slots.load(Ordering::Acquire);
    if !array.is_null() {
        return array;
    }
    let fresh: Box<[AtomicPtr<c_void>]> = (0..TLS_EXPANSION_SLOTS)
        .map(|_| AtomicPtr::new(null_mut()))
        .collect();
    let fresh = Box::into_raw(fresh).cast::<AtomicPtr<c_void>>();
    // Only the owner stores this field while the thread runs.
    teb.tls_expansion_slots.store(fresh, Ordering::Release);
    debug!("thread {} allocated its TLS expansion slots", teb.thread_id());
    fresh
}

/// Frees `teb`'s expansion array. The block must be off the thread list, so
/// that no zeroing walk sees the array go away.
pub(crate) fn release_expansion(teb: &Teb) {
    let array = teb.tls_expansion_slots.swap(null_mut(), Ordering::AcqRel);
    if !array.is_null() {
        // SAFETY: made from a boxed slice of this length in `expansion_array`.
        drop(unsafe {
            Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                array,
                TLS_EXPANSION_SLOTS,
            ))
        });
    }
}

/// Zeroes `index` in every thread of the calling process.
pub(crate) fn zero_tls_cell(index: u32) -> NtResult<()> {
    let slot = locate(index)?;
    let teb = current()?;
    let guard = teb.process().state.lock();
    for block in guard.borrow().threads.iter() {
        // SAFETY: blocks on the list are live while the lock is held.
        if let Some(cell) = cell(unsafe { &*block }, &slot) {
            cell.store(null_mut(), Ordering::Relaxed);
        }
    }
    Ok(())
}

/// Reserves the lowest free index in the calling process.
pub fn tls_alloc() -> NtResult<u32> {
    let teb = current()?;
    let guard = teb.process().state.lock();
    let index = guard.borrow_mut().tls.alloc().ok_or(NtStatus::NO_MEMORY)?;
    Ok(index)
}

/// Zeroes `index` everywhere and returns it to the pool.
pub fn tls_free(index: u32) -> NtResult<()> {
    let teb = current()?;
    let guard = teb.process().state.lock();
    if !guard.borrow().tls.is_allocated(index) {
        return Err(NtStatus::INVALID_PARAMETER);
    }
    zero_tls_cell(index)?;
    guard.borrow_mut().tls.free(index);
    Ok(())
}

pub fn tls_get(index: u32) -> NtResult<*mut c_void> {
    let slot = locate(index)?;
    let teb = current()?;
    Ok(cell(teb, &slot).map_or(null_mut(), |cell| cell.load(Ordering::Relaxed)))
}

pub fn tls_set(index: u32, value: *mut c_void) -> NtResult<()> {
    let slot = locate(index)?;
    let teb = current()?;
    let cell = match slot {
        Slot::Fixed(index) => &teb.tls_slots[index],
        Slot::Expansion(offset) => unsafe { &*expansion_array(teb).add(offset) },
    };
    cell.store(value, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bitmap_lowest_first() {
        let mut map = TlsBitmap::new();
        assert_eq!(map.alloc(), Some(0));
        assert_eq!(map.alloc(), Some(1));
        assert_eq!(map.alloc(), Some(2));
        assert!(map.free(1));
        assert!(!map.free(1));
        assert_eq!(map.alloc(), Some(1));
        assert!(!map.is_allocated(3));
        assert!(!map.free(TLS_SLOTS as u32));
    }

    #[test]
    fn test_bitmap_exhaustion() {
        let mut map = TlsBitmap::new();
        let indices: Vec<u32> = std::iter::from_fn(|| map.alloc()).collect();
        assert_eq!(indices.len(), TLS_SLOTS);
        // The fixed range is used up first.
        assert_eq!(indices[TLS_MINIMUM_AVAILABLE], TLS_MINIMUM_AVAILABLE as u32);
        assert_eq!(map.alloc(), None);

        assert!(map.free(700));
        assert_eq!(map.alloc(), Some(700));
    }

    #[test]
    fn test_locate() {
        assert!(matches!(locate(63), Ok(Slot::Fixed(63))));
        assert!(matches!(locate(64), Ok(Slot::Expansion(0))));
        assert!(matches!(locate(1087), Ok(Slot::Expansion(1023))));
        assert!(matches!(locate(1088), Err(NtStatus::INVALID_PARAMETER)));
    }
}
