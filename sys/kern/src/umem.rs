// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Safely accessing user memory.
//!
//! A [`USlice`] is a base/length pair received from unprivileged code. It
//! can describe any amount of memory, anywhere -- merely holding one grants
//! no access. Before a syscall handler dereferences it, the slice is checked
//! against the caller's accessible memory; only then is it converted into a
//! real Rust slice. Validation failure surfaces as `InvalidArg`, which the
//! syscall layer reports as `EFAULT`-shaped failure to the caller.

use abi::{ErrorCode, KResult};
use core::marker::PhantomData;

/// One region of memory user code may touch, with read/write permission.
#[derive(Copy, Clone, Debug)]
pub struct UserRegion {
    pub base: usize,
    pub size: usize,
    pub writable: bool,
}

impl UserRegion {
    fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    fn covers(&self, base: usize, end: usize) -> bool {
        self.contains(base) && end <= self.end()
    }
}

/// A user-provided slice of `T`, not yet checked for accessibility.
#[derive(Copy, Clone, Debug)]
pub struct USlice<T> {
    base_address: usize,
    length: usize,
    _marker: PhantomData<*mut [T]>,
}

impl<T> USlice<T> {
    /// Constructs a `USlice` from a base and element count, validating the
    /// *shape* only: alignment, and no wrap around the end of the address
    /// space. Accessibility is checked separately.
    pub fn from_raw(base_address: usize, length: usize) -> KResult<Self> {
        if base_address % core::mem::align_of::<T>() != 0 {
            return Err(ErrorCode::InvalidArg);
        }
        let size = length
            .checked_mul(core::mem::size_of::<T>())
            .ok_or(ErrorCode::InvalidArg)?;
        base_address
            .checked_add(size)
            .ok_or(ErrorCode::InvalidArg)?;
        Ok(Self {
            base_address,
            length,
            _marker: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn base_addr(&self) -> usize {
        self.base_address
    }

    fn end_addr(&self) -> usize {
        self.base_address + self.length * core::mem::size_of::<T>()
    }

    /// Checks that the slice lies entirely inside a user region, with write
    /// permission when `write` is set.
    ///
    /// Empty slices always pass: they confer no authority, and user code
    /// routinely passes literals like `&[]` whose base address is a
    /// meaningless dangling-but-aligned value.
    pub fn can_access(&self, regions: &[UserRegion], write: bool) -> bool {
        if self.is_empty() {
            return true;
        }
        regions.iter().any(|r| {
            r.covers(self.base_address, self.end_addr()) && (!write || r.writable)
        })
    }

    /// Converts into a readable Rust slice after an access check.
    pub fn try_read<'a>(&self, regions: &[UserRegion]) -> KResult<&'a [T]> {
        if !self.can_access(regions, false) {
            return Err(ErrorCode::InvalidArg);
        }
        if self.is_empty() {
            return Ok(&[]);
        }
        // Safety: the region table vouches for this memory, and the shape
        // was validated in from_raw.
        Ok(unsafe {
            core::slice::from_raw_parts(self.base_address as *const T, self.length)
        })
    }

    /// Converts into a writable Rust slice after an access check.
    pub fn try_write<'a>(&mut self, regions: &[UserRegion]) -> KResult<&'a mut [T]> {
        if !self.can_access(regions, true) {
            return Err(ErrorCode::InvalidArg);
        }
        if self.is_empty() {
            return Ok(&mut []);
        }
        // Safety: as in try_read, plus the region is writable.
        Ok(unsafe {
            core::slice::from_raw_parts_mut(self.base_address as *mut T, self.length)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions() -> [UserRegion; 2] {
        [
            UserRegion {
                base: 0x2000_0000,
                size: 0x1_0000,
                writable: true,
            },
            UserRegion {
                base: 0x0800_0000,
                size: 0x10_0000,
                writable: false,
            },
        ]
    }

    #[test]
    fn misaligned_base_is_rejected() {
        assert!(USlice::<u32>::from_raw(0x2000_0001, 4).is_err());
        assert!(USlice::<u32>::from_raw(0x2000_0004, 4).is_ok());
        // Byte slices have no alignment to violate.
        assert!(USlice::<u8>::from_raw(0x2000_0001, 4).is_ok());
    }

    #[test]
    fn address_space_wrap_is_rejected() {
        assert!(USlice::<u8>::from_raw(usize::MAX - 2, 4).is_err());
        assert!(USlice::<u32>::from_raw(8, usize::MAX / 2).is_err());
    }

    #[test]
    fn coverage_respects_region_bounds() {
        let regions = regions();
        let inside = USlice::<u8>::from_raw(0x2000_0010, 16).unwrap();
        assert!(inside.can_access(&regions, false));
        assert!(inside.can_access(&regions, true));

        let spills = USlice::<u8>::from_raw(0x2000_fff0, 0x20).unwrap();
        assert!(!spills.can_access(&regions, false));

        let outside = USlice::<u8>::from_raw(0x4000_0000, 4).unwrap();
        assert!(!outside.can_access(&regions, false));
    }

    #[test]
    fn write_requires_writable_region() {
        let regions = regions();
        let flash = USlice::<u8>::from_raw(0x0800_0100, 16).unwrap();
        assert!(flash.can_access(&regions, false));
        assert!(!flash.can_access(&regions, true));
    }

    #[test]
    fn empty_slices_always_pass() {
        let regions = regions();
        let empty = USlice::<u32>::from_raw(0xdddd_dddc, 0).unwrap();
        assert!(empty.can_access(&regions, true));
        assert_eq!(empty.try_read(&regions).unwrap().len(), 0);
    }

    #[test]
    fn try_read_reads_real_memory() {
        let data = [1u32, 2, 3, 4];
        let region = [UserRegion {
            base: data.as_ptr() as usize,
            size: core::mem::size_of_val(&data),
            writable: false,
        }];
        let slice =
            USlice::<u32>::from_raw(data.as_ptr() as usize, data.len()).unwrap();
        assert_eq!(slice.try_read(&region).unwrap(), &[1, 2, 3, 4]);
    }
}
