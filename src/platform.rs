use std::{ptr::NonNull, sync::OnceLock};

use crate::{align::align_up, Pointer};

/// What the heap needs from the operating system: whole pages of zeroed,
/// readable and writable memory that it can hand back later.
trait BackingMemory {
    /// Maps `length` bytes, `length` being a multiple of the page size.
    unsafe fn acquire(length: usize) -> Pointer<u8>;

    /// Unmaps a region returned by [`Self::acquire`], all of it.
    unsafe fn release(address: NonNull<u8>, length: usize);

    unsafe fn page_size() -> usize;
}

/// Implements [`BackingMemory`] once per target below.
struct Os;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Page size of the machine, asked once.
pub(crate) fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe { Os::page_size() })
}

/// Pages owned by a heap, unmapped on drop. Backs the segment store when the
/// heap is not given a buffer, and always backs the small pool.
#[derive(Debug)]
pub(crate) struct Mapping {
    address: NonNull<u8>,
    length: usize,
}

// Nobody else has a pointer to the pages.
unsafe impl Send for Mapping {}

impl Mapping {
    /// Maps at least `length` bytes. `None` if `length` is 0 or the OS says
    /// no.
    pub fn new(length: usize) -> Option<Self> {
        if length == 0 {
            return None;
        }

        let length = align_up(length, page_size());
        let address = unsafe { Os::acquire(length)? };

        Some(Self { address, length })
    }

    #[inline]
    pub fn address(&self) -> NonNull<u8> {
        self.address
    }

    /// Mapped bytes, a multiple of the page size.
    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe { Os::release(self.address, self.length) }
    }
}

#[cfg(all(unix, not(miri)))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{BackingMemory, Os};
    use crate::Pointer;

    impl BackingMemory for Os {
        unsafe fn acquire(length: usize) -> Pointer<u8> {
            // Anonymous private pages, not backed by any file and not shared
            // with child processes. See mmap(2).
            let address = libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );

            if address == libc::MAP_FAILED {
                return None;
            }

            NonNull::new(address.cast())
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            // Nothing useful to do if this fails, the pages leak.
            libc::munmap(address.as_ptr().cast(), length);
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGESIZE) as usize
        }
    }
}

#[cfg(all(windows, not(miri)))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{BackingMemory, Os};
    use crate::Pointer;

    impl BackingMemory for Os {
        unsafe fn acquire(length: usize) -> Pointer<u8> {
            // Reserve and commit in one go, pages come back zeroed. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc
            let address = Memory::VirtualAlloc(
                None,
                length,
                Memory::MEM_RESERVE | Memory::MEM_COMMIT,
                Memory::PAGE_READWRITE,
            );

            NonNull::new(address.cast())
        }

        unsafe fn release(address: NonNull<u8>, _length: usize) {
            // MEM_RELEASE frees the whole reservation and wants a size of 0.
            Memory::VirtualFree(address.as_ptr().cast(), 0, Memory::MEM_RELEASE);
        }

        unsafe fn page_size() -> usize {
            let mut info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(info.as_mut_ptr());

            info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri can't call into the OS, so pages come from the global allocator.
    //! Leaked mappings then show up in Miri's leak report.

    use std::{
        alloc::{self, Layout},
        ptr::NonNull,
    };

    use super::{BackingMemory, Os};
    use crate::Pointer;

    const PAGE: usize = 4096;

    impl BackingMemory for Os {
        unsafe fn acquire(length: usize) -> Pointer<u8> {
            let layout = Layout::from_size_align(length, PAGE).ok()?;
            NonNull::new(alloc::alloc_zeroed(layout))
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            if let Ok(layout) = Layout::from_size_align(length, PAGE) {
                alloc::dealloc(address.as_ptr(), layout);
            }
        }

        unsafe fn page_size() -> usize {
            PAGE
        }
    }
}
