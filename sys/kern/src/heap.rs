// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel heap.
//!
//! On the embedded target this installs `linked_list_allocator` over the
//! region between the linker-provided heap symbols; `startup` initializes it
//! before anything allocates. Host builds use the platform allocator and
//! none of this exists.

#[cfg(all(target_os = "none", target_arch = "arm"))]
mod embedded {
    use linked_list_allocator::LockedHeap;

    #[global_allocator]
    static HEAP: LockedHeap = LockedHeap::empty();

    extern "C" {
        // Provided by the linker script.
        static mut _sheap: u8;
        static mut _eheap: u8;
    }

    /// Hands the linker-defined heap region to the allocator.
    ///
    /// # Safety
    ///
    /// Call exactly once, before the first allocation, with interrupts
    /// masked.
    pub unsafe fn init() {
        let start = core::ptr::addr_of_mut!(_sheap);
        let end = core::ptr::addr_of_mut!(_eheap);
        let size = end as usize - start as usize;
        unsafe {
            HEAP.lock().init(start, size);
        }
    }

    /// Total heap size, for `sysconf`-style reporting.
    pub fn heap_size() -> usize {
        unsafe {
            core::ptr::addr_of!(_eheap) as usize
                - core::ptr::addr_of!(_sheap) as usize
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "arm"))]
pub use embedded::*;

#[cfg(not(all(target_os = "none", target_arch = "arm")))]
pub unsafe fn init() {}

#[cfg(not(all(target_os = "none", target_arch = "arm")))]
pub fn heap_size() -> usize {
    0
}
