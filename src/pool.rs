//! Named, growable shared-memory pools
//!
//! A [`Pool`] owns one OS-level mapping of a named segment (a POSIX shared
//! memory object or a plain file). The segment can grow while other
//! processes are attached: the authoritative size lives in an atomic header
//! word at offset 0, and every attached process lazily remaps its view when
//! it observes a larger size than it has mapped.
//!
//! # Addressing
//!
//! Nothing stored inside a pool may be an absolute pointer, because each
//! attached process maps the segment at a different base address. All
//! intra-pool links are byte offsets; [`Pool::at`] converts an offset to a
//! local address that is valid only until the next remap.

use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{ftruncate, Mode, OFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, ShmOFlags};
use std::ffi::CString;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use tracing::debug;

/// Segments are sized in multiples of this
const PAGE_SIZE: u64 = 4096;

/// Maximum segment name length accepted by the OS naming rules
const MAX_NAME_LEN: usize = 255;

/// Backing store for a pool's segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// A file at the given path, memory-mapped shared
    File,
    /// A POSIX shared memory object (`shm_open`)
    Shm,
}

/// Pool open options
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Hard cap on segment size; `None` means bounded only by the OS
    pub max_size: Option<u64>,
    /// Backing store for the segment
    pub backing: Backing,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: None,
            backing: Backing::Shm,
        }
    }
}

/// Header at offset 0 of every pool
#[repr(C)]
struct PoolHeader {
    /// Authoritative segment size in bytes
    size: AtomicU64,
    /// Reserved for a pool-wide lock; writer coordination is the caller's
    /// responsibility
    _lock: AtomicU64,
}

/// Handle to a named, growable shared memory pool
///
/// Dropping a `Pool` unmaps this process's view and closes the descriptor;
/// the segment itself persists until [`Pool::delete`].
#[derive(Debug)]
pub struct Pool {
    fd: OwnedFd,
    /// Base of this process's mapping
    base: AtomicPtr<u8>,
    /// Length of this process's mapping; may lag the header's size
    mapped_len: AtomicU64,
    name: String,
    max_size: Option<u64>,
    backing: Backing,
}

// SAFETY: the local view (base, mapped_len) is held in atomics and updated
// with release stores in mapping-then-length order; readers load length
// before base, so a torn pair never names bytes outside a live mapping.
// Data races on pool contents are governed by the callers' single-writer
// discipline, not by this handle.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

/// `size_of::<PoolHeader>()` as a u64, the offset where pool consumers
/// (such as allocators) may place their own headers.
pub const POOL_HEADER_SIZE: u64 = std::mem::size_of::<PoolHeader>() as u64;

fn round_up_page(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// On macOS a shared memory object can be ftruncated only once, so growable
/// pools must fall back to file backing there.
fn resolve_backing(backing: Backing) -> Backing {
    if cfg!(target_os = "macos") {
        Backing::File
    } else {
        backing
    }
}

fn shm_name(name: &str) -> CString {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    // name length was validated before this point
    CString::new(full).expect("pool name contains NUL")
}

fn open_segment(name: &str, backing: Backing, exclusive: bool) -> rustix::io::Result<OwnedFd> {
    let mode = if exclusive {
        Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP
    } else {
        Mode::empty()
    };
    match backing {
        Backing::File => {
            let mut flags = OFlags::RDWR;
            if exclusive {
                flags |= OFlags::CREATE | OFlags::EXCL;
            }
            rustix::fs::open(name, flags, mode)
        }
        Backing::Shm => {
            let mut flags = ShmOFlags::RDWR;
            if exclusive {
                flags |= ShmOFlags::CREATE | ShmOFlags::EXCL;
            }
            shm_open(shm_name(name).as_c_str(), flags, mode)
        }
    }
}

fn unlink_segment(name: &str, backing: Backing) -> rustix::io::Result<()> {
    match backing {
        Backing::File => rustix::fs::unlink(name),
        Backing::Shm => shm_unlink(shm_name(name).as_c_str()),
    }
}

fn map_segment(fd: &OwnedFd, len: u64) -> Result<*mut u8> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            len as usize,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| Error::Mmap(e.into()))?
    };
    Ok(addr.cast::<u8>())
}

impl Pool {
    /// Create or attach to the named pool.
    ///
    /// The first opener creates the segment at one page and initializes the
    /// header; later openers attach to whatever size the segment has grown
    /// to. The two cases are distinguished by an exclusive-create attempt,
    /// so concurrent first opens are safe.
    pub fn open(name: &str, options: PoolOptions) -> Result<Self> {
        if name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong {
                max: MAX_NAME_LEN,
                got: name.len(),
            });
        }

        let backing = resolve_backing(options.backing);

        match open_segment(name, backing, true) {
            Ok(fd) => {
                // We created the segment; size it to one page and publish
                // the size in the header.
                let len = PAGE_SIZE;
                if let Err(e) = ftruncate(&fd, len) {
                    let _ = unlink_segment(name, backing);
                    return Err(Error::CannotResize {
                        name: name.to_string(),
                        source: e.into(),
                    });
                }
                let base = match map_segment(&fd, len) {
                    Ok(base) => base,
                    Err(e) => {
                        let _ = unlink_segment(name, backing);
                        return Err(e);
                    }
                };
                let header = base as *const PoolHeader;
                unsafe {
                    (*header).size.store(len, Ordering::Release);
                }
                debug!(name, size = len, "created pool");
                Ok(Self {
                    fd,
                    base: AtomicPtr::new(base),
                    mapped_len: AtomicU64::new(len),
                    name: name.to_string(),
                    max_size: options.max_size,
                    backing,
                })
            }
            Err(e) if e == rustix::io::Errno::EXIST => {
                // The segment already exists; attach at its current size.
                let fd = open_segment(name, backing, false).map_err(|e| Error::CannotOpen {
                    name: name.to_string(),
                    source: e.into(),
                })?;
                let stat = rustix::fs::fstat(&fd).map_err(|e| Error::CannotOpen {
                    name: name.to_string(),
                    source: e.into(),
                })?;
                let len = stat.st_size as u64;
                let base = map_segment(&fd, len)?;
                debug!(name, size = len, "attached to pool");
                Ok(Self {
                    fd,
                    base: AtomicPtr::new(base),
                    mapped_len: AtomicU64::new(len),
                    name: name.to_string(),
                    max_size: options.max_size,
                    backing,
                })
            }
            Err(e) => Err(Error::CannotOpen {
                name: name.to_string(),
                source: e.into(),
            }),
        }
    }

    /// Remove the named segment.
    ///
    /// Returns `true` if a segment existed and was removed, `false` if no
    /// segment by that name exists. Attached processes keep their mappings
    /// until they drop their handles.
    pub fn delete(name: &str, backing: Backing) -> Result<bool> {
        match unlink_segment(name, resolve_backing(backing)) {
            Ok(()) => Ok(true),
            Err(e) if e == rustix::io::Errno::NOENT => Ok(false),
            Err(e) => Err(Error::CannotOpen {
                name: name.to_string(),
                source: e.into(),
            }),
        }
    }

    /// Name the pool was opened with
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backing store actually in use
    #[inline]
    pub fn backing(&self) -> Backing {
        self.backing
    }

    fn header(&self) -> &PoolHeader {
        // The header lives in the first page, which every mapping covers.
        unsafe { &*(self.base.load(Ordering::Acquire) as *const PoolHeader) }
    }

    /// Authoritative segment size, read from the pool header.
    #[inline]
    pub fn size(&self) -> u64 {
        self.header().size.load(Ordering::Acquire)
    }

    /// Grow the segment to at least `new_size` bytes (rounded up to a page
    /// multiple), publish the new size, and remap this process's view.
    pub fn expand(&self, new_size: u64) -> Result<()> {
        let new_size = round_up_page(new_size);
        if new_size <= self.mapped_len.load(Ordering::Relaxed) {
            return Ok(());
        }
        if let Some(max) = self.max_size {
            if new_size > max {
                return Err(Error::ExceedsMax {
                    max,
                    requested: new_size,
                });
            }
        }

        ftruncate(&self.fd, new_size).map_err(|e| Error::CannotResize {
            name: self.name.clone(),
            source: e.into(),
        })?;
        self.header().size.store(new_size, Ordering::Release);
        debug!(name = %self.name, size = new_size, "expanded pool");
        self.check_size_and_remap()
    }

    /// Compare the header's authoritative size with this process's mapped
    /// length and remap if the segment has grown.
    ///
    /// Every consumer must call this before dereferencing offsets that may
    /// have been produced after another process expanded the pool.
    pub fn check_size_and_remap(&self) -> Result<()> {
        let authoritative = self.header().size.load(Ordering::Acquire);
        let local = self.mapped_len.load(Ordering::Relaxed);
        if authoritative == local {
            return Ok(());
        }

        // Map the new view first so a failure leaves the old one intact.
        let new_base = map_segment(&self.fd, authoritative)?;
        let old_base = self.base.swap(new_base, Ordering::Release);
        self.mapped_len.store(authoritative, Ordering::Release);
        unsafe {
            let _ = munmap(old_base.cast(), local as usize);
        }
        debug!(name = %self.name, from = local, to = authoritative, "remapped pool");
        Ok(())
    }

    fn view(&self) -> (*mut u8, u64) {
        // Length before base: pairing an old length with a new base stays
        // inside the (larger) new mapping, never the other way around.
        let len = self.mapped_len.load(Ordering::Acquire);
        let base = self.base.load(Ordering::Acquire);
        (base, len)
    }

    /// Transient local address of `offset`.
    ///
    /// The returned pointer is valid only until the next
    /// [`check_size_and_remap`](Self::check_size_and_remap) or
    /// [`expand`](Self::expand); never store it.
    #[inline]
    pub fn at<T>(&self, offset: u64) -> *mut T {
        let (base, len) = self.view();
        debug_assert!(
            offset + std::mem::size_of::<T>() as u64 <= len,
            "offset {} out of mapped range {}",
            offset,
            len,
        );
        unsafe { base.add(offset as usize) as *mut T }
    }

    /// The pool word at `offset`, viewed as an atomic.
    #[inline]
    pub fn atomic_u64(&self, offset: u64) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0, "unaligned atomic access at {}", offset);
        unsafe { &*self.at::<AtomicU64>(offset) }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let (base, len) = self.view();
        unsafe {
            let _ = munmap(base.cast(), len as usize);
        }
        // fd closes with OwnedFd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_options() -> PoolOptions {
        PoolOptions {
            max_size: None,
            backing: Backing::File,
        }
    }

    #[test]
    fn test_create_and_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool").to_str().unwrap().to_string();

        let pool1 = Pool::open(&path, file_options()).unwrap();
        assert_eq!(pool1.size(), PAGE_SIZE);

        unsafe {
            *pool1.at::<u8>(POOL_HEADER_SIZE) = 42;
        }

        // A second handle maps the same bytes.
        let pool2 = Pool::open(&path, file_options()).unwrap();
        let val = unsafe { *pool2.at::<u8>(POOL_HEADER_SIZE) };
        assert_eq!(val, 42);
    }

    #[test]
    fn test_expand_rounds_to_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool").to_str().unwrap().to_string();

        let pool = Pool::open(&path, file_options()).unwrap();
        pool.expand(PAGE_SIZE + 1).unwrap();
        assert_eq!(pool.size(), 2 * PAGE_SIZE);

        // Expanding below the current size is a no-op.
        pool.expand(PAGE_SIZE).unwrap();
        assert_eq!(pool.size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_stale_reader_remaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool").to_str().unwrap().to_string();

        let writer = Pool::open(&path, file_options()).unwrap();
        let reader = Pool::open(&path, file_options()).unwrap();

        writer.expand(64 * PAGE_SIZE).unwrap();
        let off = 32 * PAGE_SIZE;
        unsafe {
            *writer.at::<u64>(off) = 0xDEAD_BEEF;
        }

        // The reader's view is stale until it checks the header.
        reader.check_size_and_remap().unwrap();
        let val = unsafe { *reader.at::<u64>(off) };
        assert_eq!(val, 0xDEAD_BEEF);
    }

    #[test]
    fn test_max_size_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool").to_str().unwrap().to_string();

        let pool = Pool::open(
            &path,
            PoolOptions {
                max_size: Some(2 * PAGE_SIZE),
                backing: Backing::File,
            },
        )
        .unwrap();

        pool.expand(2 * PAGE_SIZE).unwrap();
        let err = pool.expand(3 * PAGE_SIZE).unwrap_err();
        assert!(matches!(err, Error::ExceedsMax { .. }));
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool").to_str().unwrap().to_string();

        let pool = Pool::open(&path, file_options()).unwrap();
        drop(pool);

        assert!(Pool::delete(&path, Backing::File).unwrap());
        assert!(!Pool::delete(&path, Backing::File).unwrap());
    }

    #[test]
    fn test_name_too_long() {
        let name = "x".repeat(300);
        let err = Pool::open(&name, file_options()).unwrap_err();
        assert!(matches!(err, Error::NameTooLong { .. }));
    }
}
