//! Double mapping through a pagefile-backed section object (Windows)

use std::ffi::c_void;
use std::ptr::{self, NonNull};

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_ALL_ACCESS, MEM_RELEASE, MEM_RESERVE,
    MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFileEx, PAGE_NOACCESS, PAGE_READWRITE,
    UnmapViewOfFile, VirtualAlloc, VirtualFree,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use super::{AllocError, AllocResult, VmCircBufBackend, VmRegion, check_size};

/// Views must start on this boundary, which is coarser than the page size.
pub(super) fn allocation_granularity() -> usize {
    // SAFETY: GetSystemInfo fills the struct it is given.
    let info = unsafe {
        let mut info: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut info);
        info
    };
    match info.dwAllocationGranularity as usize {
        0 => 65536,
        g => g,
    }
}

/// Maps two views of one anonymous section next to each other
#[derive(Debug, Default, Clone, Copy)]
pub struct CreateFileMapping;

struct Section(HANDLE);

impl Drop for Section {
    fn drop(&mut self) {
        // SAFETY: closing a handle returned by CreateFileMappingW.
        unsafe { CloseHandle(self.0) };
    }
}

fn map_view(section: &Section, size: usize, at: *mut u8) -> Option<*mut c_void> {
    // SAFETY: mapping a section we own; placement is verified by the caller.
    let view = unsafe {
        MapViewOfFileEx(section.0, FILE_MAP_ALL_ACCESS, 0, 0, size, at.cast::<c_void>())
    };
    if view.Value.is_null() { None } else { Some(view.Value) }
}

fn unmap_view(addr: *mut c_void) {
    // SAFETY: unmapping a view returned by MapViewOfFileEx.
    unsafe { UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS { Value: addr }) };
}

impl VmCircBufBackend for CreateFileMapping {
    fn name(&self) -> &'static str {
        "createfilemapping"
    }

    fn granularity(&self) -> usize {
        allocation_granularity()
    }

    fn make(&self, size: usize) -> AllocResult<VmRegion> {
        check_size(size, self.granularity())?;

        let high = ((size as u64) >> 32) as u32;
        let low = (size as u64 & 0xffff_ffff) as u32;
        // SAFETY: an unnamed section backed by the pagefile.
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                ptr::null(),
                PAGE_READWRITE,
                high,
                low,
                ptr::null(),
            )
        };
        if handle.is_null() {
            return Err(AllocError::last_os_error("CreateFileMappingW"));
        }
        let section = Section(handle);

        // Find a free 2N span, then give it back so the views can land there.
        // SAFETY: reserving address space only.
        let reserve = unsafe { VirtualAlloc(ptr::null(), 2 * size, MEM_RESERVE, PAGE_NOACCESS) };
        if reserve.is_null() {
            return Err(AllocError::last_os_error("VirtualAlloc"));
        }
        // SAFETY: releasing the reservation we just made.
        unsafe { VirtualFree(reserve, 0, MEM_RELEASE) };
        let first_at = reserve.cast::<u8>();

        let first = map_view(&section, size, first_at)
            .ok_or_else(|| AllocError::last_os_error("MapViewOfFileEx (first copy)"))?;
        // SAFETY: first_at + size lies inside the span reserved above.
        let second_at = unsafe { first_at.add(size) };
        let second = match map_view(&section, size, second_at) {
            Some(view) => view,
            None => {
                let err = AllocError::last_os_error("MapViewOfFileEx (second copy)");
                unmap_view(first);
                return Err(err);
            }
        };
        if first.cast::<u8>() != first_at || second.cast::<u8>() != second_at {
            unmap_view(second);
            unmap_view(first);
            return Err(AllocError::AllocationFailed(
                "views were placed away from the reserved span".to_string(),
            ));
        }

        let base = NonNull::new(first.cast::<u8>())
            .ok_or_else(|| AllocError::AllocationFailed("null view".to_string()))?;
        let handle = section.0 as usize;
        std::mem::forget(section);

        Ok(VmRegion::new(base, size, self.name(), move |base, size| {
            let first = base.as_ptr();
            // SAFETY: the second view starts right after the first.
            let second = unsafe { first.add(size) };
            unmap_view(second.cast());
            unmap_view(first.cast());
            drop(Section(handle as HANDLE));
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmcircbuf::self_test;

    #[test]
    fn test_createfilemapping_mirror() {
        self_test(&CreateFileMapping).unwrap();
    }

    #[test]
    fn test_granularity_is_power_of_two() {
        assert!(allocation_granularity().is_power_of_two());
    }
}
