//! DMA memory management for the userspace driver.
//!
//! All packet buffers and descriptor rings live in memory the NIC can reach by
//! physical address, so this crate allocates page-locked, hugepage-backed
//! mappings and translates their virtual addresses through
//! `/proc/self/pagemap`. It also provides the volatile load/store primitives
//! that are the only sanctioned way to touch device registers or
//! descriptor memory shared with the hardware.

#[macro_use] extern crate log;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::{mem, process, ptr};

use driver_error::{Error, Result};

mod mmio;
pub use mmio::*;

/// Sequence number appended to hugepage file names, so that multiple
/// allocations (and multiple devices in one process) never collide.
static HUGEPAGE_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Mask of the physical frame number inside a pagemap entry (bits 0..55).
const PAGEMAP_PFN_MASK: u64 = 0x007F_FFFF_FFFF_FFFF;

/// How memory for a DMA allocation is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// Regular process pages.
    Standard,
    /// Hugepage-backed pages from the hugetlbfs mount.
    Huge,
}

/// Whether an allocation must be physically contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Pages may be scattered; only per-page translation is guaranteed.
    Standard,
    /// The whole allocation must sit inside one huge page.
    Contiguous,
}

/// A virtually and physically addressed region of page-locked memory.
///
/// Created by [`dma_allocate`] and owned by exactly one component (a mempool
/// or a descriptor ring) until freed or dropped.
#[derive(Debug)]
pub struct DmaMemory {
    virt: usize,
    phys: usize,
    size: usize,
    /// False for regions constructed over caller-provided memory, which
    /// must not be unmapped on drop.
    mapped: bool,
}

impl DmaMemory {
    /// Wraps memory that was not allocated by this crate (test rigs).
    /// The caller keeps ownership of the backing storage.
    pub fn external(virt: usize, phys: usize, size: usize) -> DmaMemory {
        DmaMemory { virt, phys, size, mapped: false }
    }

    pub fn virt(&self) -> usize {
        self.virt
    }

    pub fn phys(&self) -> usize {
        self.phys
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Releases the mapping. Dropping the value does the same; this form
    /// exists so callers can surface unmap failures.
    pub fn free(self) -> Result<()> {
        let ret = if self.mapped {
            unsafe { libc::munmap(self.virt as *mut libc::c_void, self.size) }
        } else {
            0
        };
        mem::forget(self);
        if ret != 0 {
            return Err(Error::last_os_error("unmapping DMA memory"));
        }
        Ok(())
    }
}

impl Drop for DmaMemory {
    fn drop(&mut self) {
        if self.mapped {
            let ret = unsafe { libc::munmap(self.virt as *mut libc::c_void, self.size) };
            if ret != 0 {
                warn!("failed to unmap DMA memory at {:#x}: {}", self.virt, std::io::Error::last_os_error());
            }
        }
    }
}

/// The process page size in bytes.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// The width of a pointer in bytes.
pub fn address_size() -> usize {
    mem::size_of::<usize>()
}

/// The size of one huge page in bytes, read from `/proc/meminfo`.
///
/// Fails with `Unsupported` when no hugetlbfs mount exists, because without
/// a mount there is nowhere to back an allocation from.
pub fn huge_page_size() -> Result<usize> {
    huge_page_mount()?;
    let meminfo = fs::read_to_string("/proc/meminfo")
        .map_err(|e| Error::io("reading /proc/meminfo", e))?;
    parse_hugepage_size(&meminfo)
        .ok_or_else(|| Error::unsupported("no Hugepagesize entry in /proc/meminfo"))
}

/// The mount point of the hugetlbfs filesystem.
pub fn huge_page_mount() -> Result<String> {
    let mtab = fs::read_to_string("/etc/mtab")
        .or_else(|_| fs::read_to_string("/proc/mounts"))
        .map_err(|e| Error::io("reading mount table", e))?;
    parse_hugetlbfs_mount(&mtab)
        .ok_or_else(|| Error::unsupported("no hugetlbfs mount found - mount one, e.g. at /mnt/huge"))
}

fn parse_hugepage_size(meminfo: &str) -> Option<usize> {
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("Hugepagesize:") {
            let kb: usize = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

fn parse_hugetlbfs_mount(mtab: &str) -> Option<String> {
    for line in mtab.lines() {
        let mut fields = line.split_whitespace();
        let _device = fields.next()?;
        let mount_point = fields.next()?;
        let fs_type = fields.next()?;
        if fs_type == "hugetlbfs" {
            return Some(mount_point.to_string());
        }
    }
    None
}

/// Allocates page-locked DMA memory and returns its virtual and physical
/// addresses.
///
/// `Huge` allocations are rounded up to a hugepage multiple and backed by a
/// file on the hugetlbfs mount which is unlinked immediately, so the mapping
/// alone keeps it alive. `Contiguous` allocations must fit inside a single
/// huge page since that is the only contiguity the hardware can rely on
/// without an IOMMU.
pub fn dma_allocate(size: usize, alloc: AllocKind, layout: Layout) -> Result<DmaMemory> {
    if size == 0 {
        return Err(Error::invalid_arg("cannot allocate zero-sized DMA memory"));
    }
    match alloc {
        AllocKind::Huge => {
            let hps = huge_page_size()?;
            if layout == Layout::Contiguous && size > hps {
                return Err(Error::invalid_arg("contiguous DMA allocation exceeds one huge page"));
            }
            let size = round_up(size, hps);
            allocate_hugepage_backed(size)
        }
        AllocKind::Standard => {
            if layout == Layout::Contiguous && size > page_size() {
                return Err(Error::invalid_arg("contiguous standard allocation exceeds one page"));
            }
            allocate_locked_anonymous(size)
        }
    }
}

/// Releases a DMA allocation. See [`DmaMemory::free`].
pub fn dma_free(dma: DmaMemory) -> Result<()> {
    dma.free()
}

fn allocate_hugepage_backed(size: usize) -> Result<DmaMemory> {
    let mount = huge_page_mount()?;
    let seq = HUGEPAGE_SEQ.fetch_add(1, Ordering::SeqCst);
    let path = format!("{}/ixy-{}-{}", mount, process::id(), seq);

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o700)
        .open(&path)
        .map_err(|e| Error::io("creating hugepage file", e))?;
    file.set_len(size as u64)
        .map_err(|e| Error::io("truncating hugepage file", e))?;

    let virt = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_HUGETLB,
            file.as_raw_fd(),
            0,
        )
    };
    // the mapping holds the backing memory; the name is no longer needed
    let _ = fs::remove_file(&path);

    if virt == libc::MAP_FAILED {
        let e = std::io::Error::last_os_error();
        return Err(match e.raw_os_error() {
            Some(libc::ENOMEM) => Error::out_of_memory("no free huge pages - reserve some via sysctl vm.nr_hugepages"),
            _ => Error::io("mapping hugepage file", e),
        });
    }

    lock_and_translate(virt as usize, size)
}

fn allocate_locked_anonymous(size: usize) -> Result<DmaMemory> {
    let virt = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if virt == libc::MAP_FAILED {
        return Err(Error::last_os_error("mapping anonymous DMA memory"));
    }
    lock_and_translate(virt as usize, size)
}

fn lock_and_translate(virt: usize, size: usize) -> Result<DmaMemory> {
    if unsafe { libc::mlock(virt as *const libc::c_void, size) } != 0 {
        let e = Error::last_os_error("locking DMA memory");
        unsafe { libc::munmap(virt as *mut libc::c_void, size) };
        return Err(e);
    }
    let phys = virt_to_phys(virt)?;
    debug!("allocated {} bytes of DMA memory: virt {:#x} phys {:#x}", size, virt, phys);
    Ok(DmaMemory { virt, phys, size, mapped: true })
}

/// Maps a file (BAR0's `resource0` in practice) read/write and shared.
pub fn mmap_file(path: &str, huge: bool, lock: bool) -> Result<(usize, usize)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::io("opening file for mmap", e))?;
    let size = file
        .metadata()
        .map_err(|e| Error::io("reading file size for mmap", e))?
        .len() as usize;

    let mut flags = libc::MAP_SHARED;
    if huge {
        flags |= libc::MAP_HUGETLB;
    }
    let virt = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            file.as_raw_fd(),
            0,
        )
    };
    if virt == libc::MAP_FAILED {
        return Err(Error::last_os_error("mapping file"));
    }
    if lock && unsafe { libc::mlock(virt, size) } != 0 {
        let e = Error::last_os_error("locking file mapping");
        unsafe { libc::munmap(virt, size) };
        return Err(e);
    }
    Ok((virt as usize, size))
}

/// Translates a virtual address of this process to its physical counterpart
/// by reading the pagemap entry of the containing page.
#[cfg(target_os = "linux")]
pub fn virt_to_phys(virt: usize) -> Result<usize> {
    let page_size = page_size();

    let mut pagemap = File::open("/proc/self/pagemap")
        .map_err(|e| Error::io("opening /proc/self/pagemap - are you root?", e))?;
    pagemap
        .seek(SeekFrom::Start((virt / page_size * mem::size_of::<u64>()) as u64))
        .map_err(|e| Error::io("seeking in pagemap", e))?;

    let mut entry = [0u8; mem::size_of::<u64>()];
    pagemap
        .read_exact(&mut entry)
        .map_err(|e| Error::io("reading pagemap entry", e))?;

    Ok(phys_from_pagemap_entry(u64::from_le_bytes(entry), virt, page_size))
}

#[cfg(not(target_os = "linux"))]
pub fn virt_to_phys(_virt: usize) -> Result<usize> {
    Err(Error::unsupported("virtual to physical translation requires Linux pagemap"))
}

fn phys_from_pagemap_entry(entry: u64, virt: usize, page_size: usize) -> usize {
    (entry & PAGEMAP_PFN_MASK) as usize * page_size + virt % page_size
}

fn round_up(value: usize, multiple: usize) -> usize {
    (value + multiple - 1) / multiple * multiple
}

/// Zeroes `len` bytes at `virt` with volatile stores, then fences so the
/// device observes the cleared memory before any subsequent register write.
///
/// # Safety
/// `virt..virt+len` must be a live mapping owned by the caller.
pub unsafe fn memset_volatile(virt: usize, len: usize, value: u8) {
    for i in 0..len {
        ptr::write_volatile((virt + i) as *mut u8, value);
    }
    fence(Ordering::SeqCst);
}
