//! Unified memory management.
//!
//! Unified allocations are addressable from both the host and the device
//! without explicit transfers. Access is partitioned in time rather than by
//! locks: the host owns a [`SharedBuffer`] while initializing it, hands it to
//! the device by moving it into a launched kernel, and gets it back only after
//! the device has released it.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::error::{OffloadError, Result};

/// Device allocations are charged in multiples of this many bytes.
pub const ALLOCATION_GRANULARITY: usize = 256;

/// Element types that may live in unified memory.
///
/// # Safety
///
/// Implementors must be plain data: valid for any bit pattern including all
/// zeroes, with no pointers or drop glue.
pub unsafe trait DeviceCopy: Copy + Send + Sync + 'static {}

macro_rules! impl_device_copy {
    ($($ty:ty),* $(,)?) => {
        $(unsafe impl DeviceCopy for $ty {})*
    };
}

impl_device_copy!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

/// Accounting for the memory of one device.
///
/// Every allocation reserves its charged size up front and releases it
/// exactly once when dropped.
#[derive(Debug)]
pub struct MemoryTracker {
    /// Device capacity in bytes, `None` for unbounded.
    capacity: Option<usize>,
    /// Bytes currently charged.
    in_use: AtomicUsize,
    /// High-water mark of `in_use`.
    peak: AtomicUsize,
    /// Allocations not yet released.
    live: AtomicUsize,
    /// Allocations ever made.
    total_allocations: AtomicU64,
}

impl MemoryTracker {
    /// Create a tracker for a device with the given capacity.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            total_allocations: AtomicU64::new(0),
        }
    }

    /// Reserve `bytes`, failing with `OutOfMemory` past capacity.
    pub fn reserve(&self, bytes: usize) -> Result<()> {
        let mut current = self.in_use.load(Ordering::Acquire);
        let next = loop {
            let next = current
                .checked_add(bytes)
                .filter(|next| self.capacity.map_or(true, |cap| *next <= cap))
                .ok_or(OffloadError::OutOfMemory {
                    requested: bytes,
                    available: self.available_from(current),
                })?;

            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break next,
                Err(actual) => current = actual,
            }
        };

        self.peak.fetch_max(next, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release a previous reservation.
    pub fn release(&self, bytes: usize) {
        let previous = self.in_use.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "released more than was reserved");
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Device capacity in bytes.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Bytes currently charged.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// High-water mark in bytes.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Bytes that can still be reserved.
    pub fn available(&self) -> usize {
        self.available_from(self.in_use())
    }

    /// Allocations not yet released.
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Allocations ever made.
    pub fn total_allocations(&self) -> u64 {
        self.total_allocations.load(Ordering::Relaxed)
    }

    fn available_from(&self, in_use: usize) -> usize {
        match self.capacity {
            Some(cap) => cap.saturating_sub(in_use),
            None => usize::MAX - in_use,
        }
    }
}

/// Raw unified allocation.
///
/// Owns its storage and its charge against the device; both are released
/// when the allocation is dropped.
pub struct UnifiedAllocation {
    ptr: NonNull<u8>,
    layout: Layout,
    charged: usize,
    tracker: Arc<MemoryTracker>,
}

impl UnifiedAllocation {
    /// Allocate `size` zeroed bytes aligned to `align`, charged to `tracker`.
    pub fn new(tracker: Arc<MemoryTracker>, size: usize, align: usize) -> Result<Self> {
        if size == 0 {
            return Err(OffloadError::InvalidArgument(
                "Cannot allocate zero-sized buffer".to_string(),
            ));
        }

        if !align.is_power_of_two() {
            return Err(OffloadError::InvalidArgument(format!(
                "Alignment {} is not a power of two",
                align
            )));
        }

        let layout = Layout::from_size_align(size, align).map_err(|_| OffloadError::OutOfMemory {
            requested: size,
            available: tracker.available(),
        })?;

        let charged = align::align_up(size, ALLOCATION_GRANULARITY);
        tracker.reserve(charged)?;

        let Some(ptr) = NonNull::new(unsafe { alloc_zeroed(layout) }) else {
            tracker.release(charged);
            return Err(OffloadError::OutOfMemory {
                requested: size,
                available: tracker.available(),
            });
        };
        debug_assert!(align::is_aligned(ptr.as_ptr() as usize, align));

        trace!(size, charged, "unified allocation");

        Ok(Self {
            ptr,
            layout,
            charged,
            tracker,
        })
    }

    /// Requested size in bytes.
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Bytes charged against the device.
    pub fn charged_bytes(&self) -> usize {
        self.charged
    }

    /// Alignment of the storage.
    pub fn align(&self) -> usize {
        self.layout.align()
    }

    /// Base pointer of the storage.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for UnifiedAllocation {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
        self.tracker.release(self.charged);
        trace!(size = self.layout.size(), charged = self.charged, "unified free");
    }
}

impl fmt::Debug for UnifiedAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnifiedAllocation")
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .field("charged", &self.charged)
            .finish()
    }
}

// SAFETY: the allocation is exclusively owned; access is mediated by the
// owning SharedBuffer.
unsafe impl Send for UnifiedAllocation {}
unsafe impl Sync for UnifiedAllocation {}

/// Typed buffer in unified memory.
///
/// The buffer exclusively owns its storage. Whoever holds the buffer (the
/// host, or a kernel resident on the device) is the only side that can reach
/// the elements.
pub struct SharedBuffer<T: DeviceCopy> {
    alloc: UnifiedAllocation,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: DeviceCopy> SharedBuffer<T> {
    /// Wrap an allocation as `len` elements of `T`.
    pub fn from_allocation(alloc: UnifiedAllocation, len: usize) -> Result<Self> {
        let needed = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| OffloadError::InvalidArgument(format!("buffer length {len} overflows")))?;
        if len == 0 || alloc.size() < needed || alloc.align() < std::mem::align_of::<T>() {
            return Err(OffloadError::InvalidArgument(format!(
                "allocation of {} bytes cannot hold {} elements",
                alloc.size(),
                len
            )));
        }

        Ok(Self {
            alloc,
            len,
            _marker: PhantomData,
        })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: zero-length buffers are rejected at allocation.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// Host view of the elements.
    pub fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.alloc.as_ptr() as *const T, self.len) }
    }

    /// Mutable host view of the elements.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.alloc.as_ptr() as *mut T, self.len) }
    }

    /// Set every element to `value`, sequentially.
    pub fn fill(&mut self, value: T) {
        for v in self.as_mut_slice() {
            *v = value;
        }
    }

    /// Element pointer for device-side access from inside a kernel.
    pub fn device_ptr(&self) -> DevicePtr<'_, T> {
        DevicePtr {
            ptr: self.alloc.ptr.cast::<T>(),
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T: DeviceCopy> fmt::Debug for SharedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len)
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

/// Device-side element pointer, borrowed from a [`SharedBuffer`].
pub struct DevicePtr<'a, T: DeviceCopy> {
    ptr: NonNull<T>,
    len: usize,
    _marker: PhantomData<&'a SharedBuffer<T>>,
}

impl<'a, T: DeviceCopy> Clone for DevicePtr<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: DeviceCopy> Copy for DevicePtr<'a, T> {}

impl<'a, T: DeviceCopy> DevicePtr<'a, T> {
    /// Number of elements behind the pointer.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false, see [`SharedBuffer::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read element `index`.
    ///
    /// # Safety
    ///
    /// `index < len`, and no other device thread writes `index` concurrently.
    #[inline]
    pub unsafe fn read(self, index: usize) -> T {
        debug_assert!(index < self.len);
        unsafe { self.ptr.as_ptr().add(index).read() }
    }

    /// Write element `index`.
    ///
    /// # Safety
    ///
    /// `index < len`, and no other device thread reads or writes `index`
    /// concurrently.
    #[inline]
    pub unsafe fn write(self, index: usize, value: T) {
        debug_assert!(index < self.len);
        unsafe { self.ptr.as_ptr().add(index).write(value) }
    }
}

/// Alignment utilities.
pub mod align {
    /// Align a value up to the next multiple of alignment.
    #[inline]
    pub const fn align_up(value: usize, alignment: usize) -> usize {
        let mask = alignment - 1;
        (value + mask) & !mask
    }

    /// Check if a value is aligned.
    #[inline]
    pub const fn is_aligned(value: usize, alignment: usize) -> bool {
        value & (alignment - 1) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(capacity: Option<usize>) -> Arc<MemoryTracker> {
        Arc::new(MemoryTracker::new(capacity))
    }

    fn buffer(tracker: &Arc<MemoryTracker>, len: usize) -> SharedBuffer<f32> {
        let alloc = UnifiedAllocation::new(
            Arc::clone(tracker),
            len * std::mem::size_of::<f32>(),
            std::mem::align_of::<f32>(),
        )
        .unwrap();
        SharedBuffer::from_allocation(alloc, len).unwrap()
    }

    #[test]
    fn test_shared_buffer_zeroed_and_writable() {
        let tracker = tracker(None);
        let mut buf = buffer(&tracker, 1024);
        assert_eq!(buf.len(), 1024);
        assert_eq!(buf.size_bytes(), 1024 * 4);
        assert!(buf.as_slice().iter().all(|v| *v == 0.0));

        for (i, v) in buf.as_mut_slice().iter_mut().enumerate() {
            *v = i as f32;
        }
        assert_eq!(buf.as_slice()[42], 42.0);
    }

    #[test]
    fn test_fill() {
        let tracker = tracker(None);
        let mut buf = buffer(&tracker, 7);
        buf.fill(2.0);
        assert_eq!(buf.as_slice(), &[2.0; 7]);
    }

    #[test]
    fn test_device_ptr_roundtrip() {
        let tracker = tracker(None);
        let mut buf = buffer(&tracker, 4);
        buf.fill(1.5);
        let ptr = buf.device_ptr();
        assert_eq!(ptr.len(), 4);
        unsafe {
            ptr.write(3, ptr.read(3) * 2.0);
        }
        assert_eq!(buf.as_slice(), &[1.5, 1.5, 1.5, 3.0]);
    }

    #[test]
    fn test_allocation_charges_and_releases() {
        let tracker = tracker(None);
        let buf = buffer(&tracker, 10);
        assert_eq!(tracker.in_use(), ALLOCATION_GRANULARITY);
        assert_eq!(tracker.live_allocations(), 1);

        drop(buf);
        assert_eq!(tracker.in_use(), 0);
        assert_eq!(tracker.live_allocations(), 0);
        assert_eq!(tracker.peak(), ALLOCATION_GRANULARITY);
        assert_eq!(tracker.total_allocations(), 1);
    }

    #[test]
    fn test_capacity_exhausted() {
        let tracker = tracker(Some(1024));
        let _first = buffer(&tracker, 200);

        let result = UnifiedAllocation::new(Arc::clone(&tracker), 1024, 4);
        match result {
            Err(OffloadError::OutOfMemory {
                requested,
                available,
            }) => {
                assert_eq!(requested, 1024);
                assert_eq!(available, 0);
            }
            other => panic!("expected OutOfMemory, got {:?}", other),
        }
        assert_eq!(tracker.live_allocations(), 1);
    }

    #[test]
    fn test_zero_size_rejected() {
        let tracker = tracker(None);
        let result = UnifiedAllocation::new(tracker, 0, 4);
        assert!(matches!(result, Err(OffloadError::InvalidArgument(_))));
    }

    #[test]
    fn test_oversized_layout_is_out_of_memory() {
        let tracker = tracker(None);
        let result = UnifiedAllocation::new(Arc::clone(&tracker), usize::MAX - 8, 4);
        assert!(matches!(result, Err(OffloadError::OutOfMemory { .. })));
        assert_eq!(tracker.in_use(), 0);
    }

    #[test]
    fn test_bad_alignment_is_invalid_argument() {
        let tracker = tracker(None);
        for align in [0, 3, 24] {
            let result = UnifiedAllocation::new(Arc::clone(&tracker), 64, align);
            assert!(matches!(result, Err(OffloadError::InvalidArgument(_))));
        }
        assert_eq!(tracker.in_use(), 0);
        assert_eq!(tracker.live_allocations(), 0);
    }

    #[test]
    fn test_from_allocation_too_small() {
        let tracker = tracker(None);
        let alloc = UnifiedAllocation::new(tracker, 8, 4).unwrap();
        let result = SharedBuffer::<f32>::from_allocation(alloc, 3);
        assert!(matches!(result, Err(OffloadError::InvalidArgument(_))));
    }

    #[test]
    fn test_align_up() {
        use align::*;

        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn test_is_aligned() {
        use align::*;

        assert!(is_aligned(0, 64));
        assert!(is_aligned(128, 64));
        assert!(!is_aligned(63, 64));
    }
}
