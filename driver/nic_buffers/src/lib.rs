//! Packet buffers and mempools.
//!
//! A mempool carves one hugepage-backed DMA allocation into fixed-size
//! packet buffers and keeps the free ones on a LIFO stack. Each buffer starts
//! with a 64-byte header that lives in the DMA memory itself, so the
//! physical address and owning pool survive any hand-off between pool, ring
//! and application:
//!
//! ```text
//! byte  0..8   physical address of this buffer
//! byte  8..16  id of the owning mempool
//! byte 16..20  valid payload length
//! byte 20..64  reserved headroom
//! byte 64..    packet data
//! ```
//!
//! Pools are tracked in a process-wide registry keyed by id, so a buffer
//! received on one device can be returned to its pool by another component
//! that only knows the id from the buffer header.

#[macro_use] extern crate log;
#[macro_use] extern crate lazy_static;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use driver_error::{Error, Result};
use memory::{AllocKind, DmaMemory, Layout};

mod packet_buffer;
pub use packet_buffer::{PacketBuffer, PACKET_HEADER_SIZE};

/// Byte offset of the packet data behind the buffer header.
pub const DATA_OFFSET: usize = PACKET_HEADER_SIZE;

static POOL_ID: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    /// All mempools of this process, keyed by pool id. Insertions happen only
    /// at pool creation; the data path takes read locks exclusively.
    static ref POOL_REGISTRY: RwLock<HashMap<u64, Arc<Mempool>>> = RwLock::new(HashMap::new());
}

/// A fixed-capacity pool of equally sized DMA packet buffers.
pub struct Mempool {
    id: u64,
    entry_size: usize,
    num_entries: usize,
    base: DmaMemory,
    /// Virtual addresses of the currently free buffers, LIFO.
    free: Mutex<Vec<usize>>,
}

impl Mempool {
    /// Allocates a pool of `num_entries` buffers of `entry_size` bytes each
    /// from hugepage-backed DMA memory and registers it.
    ///
    /// `entry_size` must divide the huge page size so no buffer straddles a
    /// hugepage boundary, which would break physical contiguity of a buffer.
    pub fn create(num_entries: usize, entry_size: usize) -> Result<Arc<Mempool>> {
        let huge_page_size = memory::huge_page_size()?;
        if entry_size == 0 || huge_page_size % entry_size != 0 {
            return Err(Error::invalid_arg("mempool entry size must divide the huge page size"));
        }
        let dma = memory::dma_allocate(num_entries * entry_size, AllocKind::Huge, Layout::Standard)?;
        // buffers may span several huge pages; translate each one separately
        Self::build(dma, num_entries, entry_size, true)
    }

    /// Builds a pool over an existing DMA allocation. Physical addresses are
    /// derived linearly from the allocation base, which holds for memory that
    /// is physically contiguous (and for synthetic test memory).
    pub fn create_with_dma(dma: DmaMemory, num_entries: usize, entry_size: usize) -> Result<Arc<Mempool>> {
        if dma.size() < num_entries * entry_size {
            return Err(Error::invalid_arg("DMA allocation too small for the requested mempool"));
        }
        Self::build(dma, num_entries, entry_size, false)
    }

    fn build(dma: DmaMemory, num_entries: usize, entry_size: usize, translate: bool) -> Result<Arc<Mempool>> {
        if entry_size < PACKET_HEADER_SIZE {
            return Err(Error::invalid_arg("mempool entry size smaller than the buffer header"));
        }
        let id = POOL_ID.fetch_add(1, Ordering::SeqCst);
        unsafe { memory::memset_volatile(dma.virt(), num_entries * entry_size, 0) };

        let mut free = Vec::with_capacity(num_entries);
        for i in 0..num_entries {
            let virt = dma.virt() + i * entry_size;
            let phys = if translate {
                memory::virt_to_phys(virt)?
            } else {
                dma.phys() + i * entry_size
            };
            unsafe {
                memory::write_u64(virt, phys as u64);
                memory::write_u64(virt + 8, id);
                memory::write_u32(virt + 16, 0);
            }
            free.push(virt);
        }

        let pool = Arc::new(Mempool {
            id,
            entry_size,
            num_entries,
            base: dma,
            free: Mutex::new(free),
        });
        POOL_REGISTRY.write().insert(id, pool.clone());
        debug!("created mempool {}: {} entries of {} bytes", id, num_entries, entry_size);
        Ok(pool)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// The pool registered under `id`, if any.
    pub fn find_by_id(id: u64) -> Option<Arc<Mempool>> {
        POOL_REGISTRY.read().get(&id).cloned()
    }

    /// Pops a free buffer, or `None` when the pool is exhausted.
    pub fn acquire(&self) -> Option<PacketBuffer> {
        let virt = self.free.lock().pop()?;
        Some(unsafe { PacketBuffer::from_raw(virt, self.entry_size) })
    }

    /// Pops up to `n` free buffers into `out` and returns how many it got.
    pub fn acquire_batch(&self, out: &mut Vec<PacketBuffer>, n: usize) -> usize {
        let mut free = self.free.lock();
        let mut taken = 0;
        while taken < n {
            match free.pop() {
                Some(virt) => {
                    out.push(unsafe { PacketBuffer::from_raw(virt, self.entry_size) });
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    /// Returns a buffer to its pool. The buffer must have been allocated
    /// from this pool.
    pub fn release(&self, buf: PacketBuffer) -> Result<()> {
        if buf.pool_id() != self.id {
            return Err(Error::invalid_state("buffer released to a foreign mempool"));
        }
        self.free.lock().push(buf.virt_addr());
        Ok(())
    }

    /// Returns a buffer to whichever pool its header names. Used when the
    /// owning pool is not statically known, e.g. after forwarding between
    /// devices.
    pub fn release_to_owner(buf: PacketBuffer) -> Result<()> {
        let pool = Mempool::find_by_id(buf.pool_id())
            .ok_or_else(|| Error::invalid_state("buffer names a mempool that does not exist"))?;
        pool.release(buf)
    }

    /// Returns the buffer starting at `virt` to the pool named in its
    /// header. Rings record buffers by bare address, so this is the form
    /// the transmit clean-up path uses.
    ///
    /// # Safety
    /// `virt` must be the start of a live buffer carved by a registered
    /// pool, with no other handle outstanding for it.
    pub unsafe fn release_raw(virt: usize) -> Result<()> {
        let id = memory::read_u64(virt + packet_buffer::OFFSET_POOL_ID);
        let pool = Mempool::find_by_id(id)
            .ok_or_else(|| Error::invalid_state("buffer names a mempool that does not exist"))?;
        pool.release(PacketBuffer::from_raw(virt, pool.entry_size))
    }

    /// How many buffers are currently free.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Removes a pool from the process-wide registry. The pool's DMA memory
    /// is released once the last reference to it is gone.
    pub fn deregister(id: u64) -> Option<Arc<Mempool>> {
        POOL_REGISTRY.write().remove(&id)
    }

    #[cfg(test)]
    fn base_virt(&self) -> usize {
        self.base.virt()
    }
}
