//! Locked, zero-on-free byte buffers
//!
//! Each buffer owns whole pages: the allocation is page aligned and rounded
//! up to a page multiple, so locking and unlocking one buffer never touches
//! the pages of another. The pages are locked into RAM (`mlock` on unix)
//! when possible. Locking is best effort: a failure is logged once and the
//! buffer stays usable. Contents are zeroized on drop.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use zeroize::Zeroize;

/// Stride used when touching buffers to keep them resident
const TOUCH_STRIDE: usize = 4096;

static LOCK_WARNED: AtomicBool = AtomicBool::new(false);

/// Fixed-size secret buffer in locked memory
pub struct SecureBuffer<const N: usize> {
    ptr: NonNull<[u8; N]>,
    layout: Layout,
    locked: bool,
}

// SAFETY: the buffer exclusively owns its allocation
unsafe impl<const N: usize> Send for SecureBuffer<N> {}
unsafe impl<const N: usize> Sync for SecureBuffer<N> {}

impl<const N: usize> SecureBuffer<N> {
    /// Allocate a zeroed, locked buffer
    pub fn new() -> Self {
        let layout = page_layout(N);
        // SAFETY: the layout has a non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        let locked = lock_region(raw, layout.size());
        Self {
            ptr: ptr.cast(),
            layout,
            locked,
        }
    }

    /// Allocate a buffer holding `bytes`
    ///
    /// Copies `min(N, bytes.len())` bytes; the rest stays zero.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::new();
        let n = bytes.len().min(N);
        buf.as_mut_bytes()[..n].copy_from_slice(&bytes[..n]);
        buf
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        // SAFETY: ptr is valid for N bytes, initialized and owned by self
        unsafe { self.ptr.as_ref() }
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8; N] {
        // SAFETY: as above, and &mut self guarantees exclusive access
        unsafe { self.ptr.as_mut() }
    }

    /// True if the memory lock succeeded
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Zeroize the contents, keeping the allocation
    pub fn clear(&mut self) {
        self.as_mut_bytes().as_mut_slice().zeroize();
    }

    /// Copy the contents into a freshly allocated locked buffer
    pub fn relocate(&self) -> Self {
        let mut moved = Self::new();
        moved.as_mut_bytes().copy_from_slice(self.as_bytes());
        moved
    }

    /// Read one byte per page so the buffer stays paged in
    pub fn touch(&self) {
        let data = self.as_bytes();
        for i in (0..N).step_by(TOUCH_STRIDE) {
            std::hint::black_box(data[i]);
        }
        if N > 0 {
            std::hint::black_box(data[N - 1]);
        }
    }
}

impl<const N: usize> Default for SecureBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Drop for SecureBuffer<N> {
    fn drop(&mut self) {
        let raw = self.ptr.as_ptr().cast::<u8>();
        // SAFETY: raw points to layout.size() bytes owned by self
        unsafe { std::slice::from_raw_parts_mut(raw, self.layout.size()) }.zeroize();
        if self.locked {
            unlock_region(raw, self.layout.size());
        }
        // SAFETY: allocated in new() with the same layout
        unsafe { alloc::dealloc(raw, self.layout) };
    }
}

impl<const N: usize> std::fmt::Debug for SecureBuffer<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("len", &N)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

/// Size of a memory page
pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(system_page_size)
}

/// Page aligned layout covering at least `len` bytes and at least one page
fn page_layout(len: usize) -> Layout {
    let page = page_size();
    let size = len.max(1).div_ceil(page) * page;
    match Layout::from_size_align(size, page) {
        Ok(layout) => layout,
        Err(_) => alloc::handle_alloc_error(Layout::new::<u8>()),
    }
}

#[cfg(unix)]
fn system_page_size() -> usize {
    // SAFETY: sysconf has no memory safety preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    match usize::try_from(size) {
        Ok(size) if size.is_power_of_two() => size,
        _ => 4096,
    }
}

#[cfg(not(unix))]
fn system_page_size() -> usize {
    4096
}

#[cfg(unix)]
fn lock_region(ptr: *const u8, len: usize) -> bool {
    // SAFETY: ptr and len describe a live, page aligned allocation owned by the caller
    let rc = unsafe { libc::mlock(ptr as *const libc::c_void, len) };
    if rc != 0 {
        if !LOCK_WARNED.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "mlock failed, secrets may be paged to disk"
            );
        }
        return false;
    }
    true
}

#[cfg(unix)]
fn unlock_region(ptr: *const u8, len: usize) {
    // SAFETY: the region was locked by lock_region and is still allocated
    unsafe {
        libc::munlock(ptr as *const libc::c_void, len);
    }
}

#[cfg(not(unix))]
fn lock_region(_ptr: *const u8, _len: usize) -> bool {
    if !LOCK_WARNED.swap(true, Ordering::Relaxed) {
        tracing::debug!("memory locking not supported on this platform");
    }
    false
}

#[cfg(not(unix))]
fn unlock_region(_ptr: *const u8, _len: usize) {}
