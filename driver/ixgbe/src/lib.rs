//! Userspace driver for the Intel 82599 10 GbE controller family.
//!
//! The kernel driver is unbound from the device, BAR0 is mapped straight
//! into this process, and the receive/transmit descriptor rings are driven
//! by polling. Packets travel in [`PacketBuffer`]s drawn from per-queue
//! mempools; the data path never allocates, sleeps or logs above debug.
//!
//! Bring-up follows section 4.6 of the 82599 datasheet: global reset, link
//! auto-negotiation, receive and transmit ring programming, then per-queue
//! start. All register pokes go through the volatile helpers of the `pci`
//! crate.

#[macro_use] extern crate log;

pub mod devices;
pub mod regs;

use std::cmp;
use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use driver_error::{Error, Result};
use intel_ethernet::{AdvancedRxDescriptor, AdvancedTxDescriptor, RxDescriptor, TxDescriptor};
use memory::{AllocKind, DmaMemory, Layout};
use nic_buffers::{Mempool, PacketBuffer, DATA_OFFSET};
use pci::{DeviceRegisters, PciDevice};
use stats::DeviceStats;

/// Name of the kernel driver this one displaces.
const KERNEL_DRIVER: &str = "ixgbe";

/// The hardware supports up to 64 usable queues per direction here.
pub const MAX_QUEUES: u16 = 64;

const NUM_RX_QUEUE_ENTRIES: usize = 512;
const NUM_TX_QUEUE_ENTRIES: usize = 512;

/// Transmit descriptors are cleaned in blocks of this many slots.
const TX_CLEAN_BATCH: usize = 32;

/// Size of one packet buffer, header included.
const PKT_BUF_SIZE: usize = 2048;

/// Every receive queue gets at least this many buffers, so a slow consumer
/// does not starve the ring refill.
const MIN_MEMPOOL_ENTRIES: usize = 4096;

const RX_DESC_SIZE: usize = mem::size_of::<AdvancedRxDescriptor>();
const TX_DESC_SIZE: usize = mem::size_of::<AdvancedTxDescriptor>();

/// Advances a ring cursor by one. Ring sizes are powers of two.
const fn wrap_ring(index: usize, ring_size: usize) -> usize {
    (index + 1) & (ring_size - 1)
}

/// One receive ring: descriptor memory, the pool its buffers come from, and
/// the software cursor. `bufs_in_use` records, per slot, the virtual address
/// of the buffer whose physical address the descriptor carries.
struct IxgbeRxQueue {
    ring: DmaMemory,
    mempool: Option<Arc<Mempool>>,
    num_entries: usize,
    rx_index: usize,
    bufs_in_use: Vec<usize>,
}

impl IxgbeRxQueue {
    fn desc(&self, i: usize) -> &mut AdvancedRxDescriptor {
        debug_assert!(i < self.num_entries);
        unsafe { &mut *((self.ring.virt() + i * RX_DESC_SIZE) as *mut AdvancedRxDescriptor) }
    }
}

/// One transmit ring. `clean_index` chases `tx_index`; the slots between
/// them hold packets the hardware has not confirmed yet.
struct IxgbeTxQueue {
    ring: DmaMemory,
    num_entries: usize,
    clean_index: usize,
    tx_index: usize,
    bufs_in_use: Vec<usize>,
}

impl IxgbeTxQueue {
    fn desc(&self, i: usize) -> &mut AdvancedTxDescriptor {
        debug_assert!(i < self.num_entries);
        unsafe { &mut *((self.ring.virt() + i * TX_DESC_SIZE) as *mut AdvancedTxDescriptor) }
    }
}

/// An opened 82599-family NIC.
pub struct IxgbeDevice {
    pci: PciDevice,
    regs: DeviceRegisters,
    num_rx_queues: u16,
    num_tx_queues: u16,
    rx_queues: Vec<IxgbeRxQueue>,
    tx_queues: Vec<IxgbeTxQueue>,
}

impl IxgbeDevice {
    /// Takes the device at `pci_addr` away from the kernel and maps its
    /// registers. The device is not usable until [`configure`] ran.
    ///
    /// [`configure`]: Self::configure
    pub fn new(pci_addr: &str, num_rx_queues: u16, num_tx_queues: u16) -> Result<IxgbeDevice> {
        if num_rx_queues > MAX_QUEUES || num_tx_queues > MAX_QUEUES {
            return Err(Error::invalid_arg("queue count exceeds what the hardware offers"));
        }
        let pci = PciDevice::open(pci_addr, KERNEL_DRIVER)?;
        let vendor = pci.vendor_id()?;
        let device = pci.device_id()?;
        if !devices::is_supported(vendor, device) {
            return Err(Error::unsupported("PCI device is not a known ixgbe-family NIC"));
        }
        pci.unbind()?;
        pci.enable_dma()?;
        let regs = pci.map_resource()?;

        Ok(IxgbeDevice {
            pci,
            regs,
            num_rx_queues,
            num_tx_queues,
            rx_queues: Vec::with_capacity(num_rx_queues as usize),
            tx_queues: Vec::with_capacity(num_tx_queues as usize),
        })
    }

    pub fn pci_addr(&self) -> &str {
        self.pci.pci_addr()
    }

    pub fn num_rx_queues(&self) -> u16 {
        self.num_rx_queues
    }

    pub fn num_tx_queues(&self) -> u16 {
        self.num_tx_queues
    }

    /// Resets the device and brings every queue up. Calling it again resets
    /// and rebuilds the rings from scratch.
    pub fn configure(&mut self) -> Result<()> {
        self.rx_queues.clear();
        self.tx_queues.clear();

        // section 4.6.3.1 - disable all interrupts
        self.regs.set_reg(regs::EIMC, regs::EIMC_DISABLE_ALL);

        // section 4.6.3.2 - global reset
        self.regs.set_reg(regs::CTRL, regs::CTRL_RST_MASK);
        self.regs.wait_clear_flags(regs::CTRL, regs::CTRL_RST_MASK);
        thread::sleep(Duration::from_millis(10));

        // the reset also cleared the interrupt mask
        self.regs.set_reg(regs::EIMC, regs::EIMC_DISABLE_ALL);

        info!("initializing device {}", self.pci.pci_addr());

        // section 4.6.3 - wait for EEPROM auto read completion
        self.regs.wait_set_flags(regs::EEC, regs::EEC_ARD);

        // section 4.6.3 - wait for DMA initialization done
        self.regs.wait_set_flags(regs::RDRXCTL, regs::RDRXCTL_DMAIDONE);

        // section 4.6.4 - link auto negotiation
        self.init_link();

        // drain the clear-on-read counters so stats start from zero
        self.reset_stats();

        self.init_rx()?;
        self.init_tx()?;

        for i in 0..self.num_rx_queues {
            self.start_rx_queue(i)?;
        }
        for i in 0..self.num_tx_queues {
            self.start_tx_queue(i)?;
        }

        self.set_promisc(true);
        self.wait_for_link();

        let mac = self.mac_address();
        info!(
            "device {} has MAC address {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.pci.pci_addr(), mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        );
        Ok(())
    }

    // section 4.6.4
    fn init_link(&self) {
        self.regs.set_reg(
            regs::AUTOC,
            (self.regs.get_reg(regs::AUTOC) & !regs::AUTOC_LMS_MASK) | regs::AUTOC_LMS_10G_SERIAL,
        );
        self.regs.set_reg(
            regs::AUTOC,
            (self.regs.get_reg(regs::AUTOC) & !regs::AUTOC_10G_PMA_PMD_MASK) | regs::AUTOC_10G_PMA_PMD_XAUI,
        );
        self.regs.set_flags(regs::AUTOC, regs::AUTOC_AN_RESTART);
    }

    // section 4.6.7
    fn init_rx(&mut self) -> Result<()> {
        // receive must be off while reconfiguring
        self.regs.clear_flags(regs::RXCTRL, regs::RXCTRL_RXEN);

        // section 4.6.11.3.4 - all traffic goes to packet buffer 0
        self.regs.set_reg(regs::rxpbsize(0), regs::RXPBSIZE_128KB);
        for i in 1..8 {
            self.regs.set_reg(regs::rxpbsize(i), 0);
        }

        // CRC offloading; both bits must agree
        self.regs.set_flags(regs::HLREG0, regs::HLREG0_RXCRCSTRP);
        self.regs.set_flags(regs::RDRXCTL, regs::RDRXCTL_CRCSTRIP);

        // accept broadcast frames
        self.regs.set_flags(regs::FCTRL, regs::FCTRL_BAM);

        for i in 0..self.num_rx_queues {
            debug!("initializing rx queue {}", i);

            // advanced one-buffer descriptors, drop on descriptor underrun
            self.regs.set_reg(
                regs::srrctl(i),
                (self.regs.get_reg(regs::srrctl(i)) & !regs::SRRCTL_DESCTYPE_MASK)
                    | regs::SRRCTL_DESCTYPE_ADV_ONEBUF,
            );
            self.regs.set_flags(regs::srrctl(i), regs::SRRCTL_DROP_EN);

            // section 7.1.9 - descriptor ring
            let ring_bytes = NUM_RX_QUEUE_ENTRIES * RX_DESC_SIZE;
            let dma = memory::dma_allocate(ring_bytes, AllocKind::Huge, Layout::Contiguous)?;
            // poison the ring; valid descriptors are written at queue start
            unsafe { memory::memset_volatile(dma.virt(), ring_bytes, 0xFF) };

            self.regs.set_reg(regs::rdbal(i), (dma.phys() as u64 & 0xFFFF_FFFF) as u32);
            self.regs.set_reg(regs::rdbah(i), (dma.phys() as u64 >> 32) as u32);
            self.regs.set_reg(regs::rdlen(i), ring_bytes as u32);
            self.regs.set_reg(regs::rdh(i), 0);
            self.regs.set_reg(regs::rdt(i), 0);

            self.rx_queues.push(IxgbeRxQueue {
                ring: dma,
                mempool: None,
                num_entries: NUM_RX_QUEUE_ENTRIES,
                rx_index: 0,
                bufs_in_use: Vec::with_capacity(NUM_RX_QUEUE_ENTRIES),
            });
        }

        // last sentence of section 4.6.7
        self.regs.set_flags(regs::CTRL_EXT, regs::CTRL_EXT_NS_DIS);

        // per-queue magic from the datasheet's errata section
        for i in 0..self.num_rx_queues {
            self.regs.clear_flags(regs::dca_rxctrl(i), 1 << 12);
        }

        self.regs.set_flags(regs::RXCTRL, regs::RXCTRL_RXEN);
        Ok(())
    }

    // section 4.6.8
    fn init_tx(&mut self) -> Result<()> {
        // CRC insertion and padding of short frames
        self.regs.set_flags(regs::HLREG0, regs::HLREG0_TXCRCEN | regs::HLREG0_TXPADEN);

        // section 4.6.11.3.4 - one 40 KiB transmit packet buffer
        self.regs.set_reg(regs::txpbsize(0), regs::TXPBSIZE_40KB);
        for i in 1..8 {
            self.regs.set_reg(regs::txpbsize(i), 0);
        }

        // required settings when DCB and virtualization are off
        self.regs.set_reg(regs::DTXMXSZRQ, regs::DTXMXSZRQ_MAX);
        self.regs.clear_flags(regs::RTTDCS, regs::RTTDCS_ARBDIS);

        for i in 0..self.num_tx_queues {
            debug!("initializing tx queue {}", i);

            let ring_bytes = NUM_TX_QUEUE_ENTRIES * TX_DESC_SIZE;
            let dma = memory::dma_allocate(ring_bytes, AllocKind::Huge, Layout::Contiguous)?;
            unsafe { memory::memset_volatile(dma.virt(), ring_bytes, 0xFF) };

            self.regs.set_reg(regs::tdbal(i), (dma.phys() as u64 & 0xFFFF_FFFF) as u32);
            self.regs.set_reg(regs::tdbah(i), (dma.phys() as u64 >> 32) as u32);
            self.regs.set_reg(regs::tdlen(i), ring_bytes as u32);

            // descriptor write-back thresholds; these values keep the
            // hardware from writing back one descriptor at a time
            let mut txdctl = self.regs.get_reg(regs::txdctl(i));
            txdctl &= !regs::TXDCTL_THRESH_MASK;
            txdctl |= regs::TXDCTL_PTHRESH | regs::TXDCTL_HTHRESH | regs::TXDCTL_WTHRESH;
            self.regs.set_reg(regs::txdctl(i), txdctl);

            self.tx_queues.push(IxgbeTxQueue {
                ring: dma,
                num_entries: NUM_TX_QUEUE_ENTRIES,
                clean_index: 0,
                tx_index: 0,
                bufs_in_use: vec![0; NUM_TX_QUEUE_ENTRIES],
            });
        }

        self.regs.set_reg(regs::DMATXCTL, regs::DMATXCTL_TE);
        Ok(())
    }

    fn start_rx_queue(&mut self, queue_id: u16) -> Result<()> {
        debug!("starting rx queue {}", queue_id);
        let queue = &mut self.rx_queues[queue_id as usize];

        if !queue.num_entries.is_power_of_two() {
            return Err(Error::invalid_arg("number of queue entries must be a power of two"));
        }

        let entries = cmp::max(MIN_MEMPOOL_ENTRIES, NUM_RX_QUEUE_ENTRIES + NUM_TX_QUEUE_ENTRIES);
        let mempool = Mempool::create(entries, PKT_BUF_SIZE)?;

        // the ring starts out full of fresh buffers
        for i in 0..queue.num_entries {
            let buf = mempool
                .acquire()
                .ok_or_else(|| Error::out_of_memory("mempool too small to fill its rx ring"))?;
            queue.desc(i).refill(buf.phys_addr() + DATA_OFFSET);
            queue.bufs_in_use.push(buf.virt_addr());
        }
        queue.mempool = Some(mempool);

        let num_entries = queue.num_entries;
        self.regs.set_flags(regs::rxdctl(queue_id), regs::RXDCTL_ENABLE);
        self.regs.wait_set_flags(regs::rxdctl(queue_id), regs::RXDCTL_ENABLE);

        self.regs.set_reg(regs::rdh(queue_id), 0);
        self.regs.set_reg(regs::rdt(queue_id), (num_entries - 1) as u32);
        Ok(())
    }

    fn start_tx_queue(&mut self, queue_id: u16) -> Result<()> {
        debug!("starting tx queue {}", queue_id);
        let queue = &self.tx_queues[queue_id as usize];

        if !queue.num_entries.is_power_of_two() {
            return Err(Error::invalid_arg("number of queue entries must be a power of two"));
        }

        // the queue starts out empty
        self.regs.set_reg(regs::tdh(queue_id), 0);
        self.regs.set_reg(regs::tdt(queue_id), 0);

        self.regs.set_flags(regs::txdctl(queue_id), regs::TXDCTL_ENABLE);
        self.regs.wait_set_flags(regs::txdctl(queue_id), regs::TXDCTL_ENABLE);
        Ok(())
    }

    /// Receives up to `num_packets` packets from `queue_id` into `bufs`.
    ///
    /// Every produced slot is refilled with a fresh buffer from the queue's
    /// mempool. When the pool runs dry the batch ends early; buffers the
    /// application holds on to for too long show up here as short batches.
    pub fn rx_batch(&mut self, queue_id: u16, bufs: &mut Vec<PacketBuffer>, num_packets: usize) -> usize {
        let Some(queue) = self.rx_queues.get_mut(queue_id as usize) else {
            return 0;
        };
        rx_batch_queue(&self.regs, queue, queue_id, bufs, num_packets)
    }

    /// Enqueues packets from the front of `bufs` on `queue_id` and removes
    /// the enqueued ones from the vector. Returns how many were taken; the
    /// rest did not fit into the ring.
    ///
    /// Sent buffers are returned to their pools during the clean phase of a
    /// later call.
    pub fn tx_batch(&mut self, queue_id: u16, bufs: &mut Vec<PacketBuffer>) -> usize {
        let Some(queue) = self.tx_queues.get_mut(queue_id as usize) else {
            return 0;
        };
        tx_batch_queue(&self.regs, queue, queue_id, bufs)
    }

    /// Keeps calling [`tx_batch`](Self::tx_batch) until every buffer in
    /// `bufs` is enqueued.
    pub fn tx_busy_wait(&mut self, queue_id: u16, bufs: &mut Vec<PacketBuffer>) {
        while !bufs.is_empty() {
            self.tx_batch(queue_id, bufs);
        }
    }

    /// Accumulates the hardware counters into `stats`. The counters clear
    /// on read; the low half of each byte counter must be read first since
    /// it latches the high half.
    pub fn read_stats(&self, stats: &mut DeviceStats) {
        let rx_pkts = self.regs.get_reg(regs::GPRC) as u64;
        let tx_pkts = self.regs.get_reg(regs::GPTC) as u64;
        let rx_bytes = self.regs.get_reg(regs::GORCL) as u64
            | ((self.regs.get_reg(regs::GORCH) as u64) << 32);
        let tx_bytes = self.regs.get_reg(regs::GOTCL) as u64
            | ((self.regs.get_reg(regs::GOTCH) as u64) << 32);
        stats.add_rx(rx_pkts, rx_bytes);
        stats.add_tx(tx_pkts, tx_bytes);
    }

    /// Reads and discards all counters.
    pub fn reset_stats(&self) {
        let mut scratch = DeviceStats::default();
        self.read_stats(&mut scratch);
    }

    /// Accepts every frame regardless of destination MAC when enabled.
    pub fn set_promisc(&self, enabled: bool) {
        if enabled {
            debug!("enabling promiscuous mode on {}", self.pci.pci_addr());
            self.regs.set_flags(regs::FCTRL, regs::FCTRL_MPE | regs::FCTRL_UPE);
        } else {
            debug!("disabling promiscuous mode on {}", self.pci.pci_addr());
            self.regs.clear_flags(regs::FCTRL, regs::FCTRL_MPE | regs::FCTRL_UPE);
        }
    }

    /// The negotiated link speed in Mbit/s, or 0 while the link is down.
    pub fn get_link_speed(&self) -> u16 {
        let links = self.regs.get_reg(regs::LINKS);
        if links & regs::LINKS_UP == 0 {
            return 0;
        }
        match links & regs::LINKS_SPEED_82599 {
            regs::LINKS_SPEED_100_82599 => 100,
            regs::LINKS_SPEED_1G_82599 => 1000,
            regs::LINKS_SPEED_10G_82599 => 10000,
            _ => 0,
        }
    }

    /// The MAC address from the first receive-address register pair.
    pub fn mac_address(&self) -> [u8; 6] {
        let low = self.regs.get_reg(regs::RAL0);
        let high = self.regs.get_reg(regs::RAH0);
        [
            low as u8,
            (low >> 8) as u8,
            (low >> 16) as u8,
            (low >> 24) as u8,
            high as u8,
            (high >> 8) as u8,
        ]
    }

    fn wait_for_link(&self) {
        info!("waiting for link");
        let deadline = Instant::now() + Duration::from_secs(10);
        let poll_interval = Duration::from_millis(10);
        while self.get_link_speed() == 0 && Instant::now() < deadline {
            thread::sleep(poll_interval);
        }
        match self.get_link_speed() {
            0 => warn!("link still down after 10 seconds - is a cable plugged in?"),
            speed => info!("link speed is {} Mbit/s", speed),
        }
    }

    /// Tears the device down. Dropping it does the same; the explicit form
    /// reads better at call sites. A closed device cannot be used again,
    /// which the compiler enforces by the move.
    pub fn close(self) {}
}

impl Drop for IxgbeDevice {
    fn drop(&mut self) {
        // hand the NIC back quietly: no promiscuous snooping, pools gone;
        // the pci handle restores DMA and driver binding when it drops
        self.set_promisc(false);
        for queue in &self.rx_queues {
            if let Some(pool) = &queue.mempool {
                Mempool::deregister(pool.id());
            }
        }
    }
}

fn rx_batch_queue(
    mmio: &DeviceRegisters,
    queue: &mut IxgbeRxQueue,
    queue_id: u16,
    bufs: &mut Vec<PacketBuffer>,
    num_packets: usize,
) -> usize {
    let Some(mempool) = queue.mempool.clone() else {
        return 0;
    };

    let mut rx_index = queue.rx_index;
    let mut last_rx_index = rx_index;
    let mut received = 0;

    while received < num_packets {
        let desc = queue.desc(rx_index);
        if !desc.descriptor_done() {
            break;
        }
        if !desc.end_of_packet() {
            // a frame split over several descriptors means the buffers are
            // smaller than the MTU; that is a configuration error, not a
            // runtime condition to limp through
            panic!("multi-segment packet received - increase buffer size or decrease MTU");
        }

        // refill before handing the old buffer out, so a dry pool leaves
        // the slot untouched and the batch simply ends short
        let Some(new_buf) = mempool.acquire() else {
            debug!("mempool {} is out of buffers, rx batch cut short", mempool.id());
            break;
        };

        let len = desc.length();
        let mut buf = unsafe { PacketBuffer::from_raw(queue.bufs_in_use[rx_index], mempool.entry_size()) };
        if buf.set_size(len).is_err() {
            debug!("hardware reported an impossible packet length of {}", len);
        }
        bufs.push(buf);

        desc.refill(new_buf.phys_addr() + DATA_OFFSET);
        queue.bufs_in_use[rx_index] = new_buf.virt_addr();

        last_rx_index = rx_index;
        rx_index = wrap_ring(rx_index, queue.num_entries);
        received += 1;
    }

    if received > 0 {
        // tell the hardware it owns everything up to the last consumed slot
        mmio.set_reg(regs::rdt(queue_id), last_rx_index as u32);
        queue.rx_index = rx_index;
    }

    received
}

fn tx_batch_queue(
    mmio: &DeviceRegisters,
    queue: &mut IxgbeTxQueue,
    queue_id: u16,
    bufs: &mut Vec<PacketBuffer>,
) -> usize {
    clean_tx_queue(queue);

    let mut sent = 0;
    while sent < bufs.len() {
        let next_index = wrap_ring(queue.tx_index, queue.num_entries);
        if next_index == queue.clean_index {
            // one slot stays empty so a full ring and an empty ring are
            // distinguishable
            break;
        }
        let buf = &bufs[sent];
        queue.bufs_in_use[queue.tx_index] = buf.virt_addr();
        queue.desc(queue.tx_index).send(buf.phys_addr() + DATA_OFFSET, buf.size());
        queue.tx_index = next_index;
        sent += 1;
    }

    mmio.set_reg(regs::tdt(queue_id), queue.tx_index as u32);
    bufs.drain(0..sent);
    sent
}

/// Walks the completed span of a transmit ring in blocks of
/// [`TX_CLEAN_BATCH`] and returns the sent buffers to their pools. Checking
/// only the last descriptor of each block works because the hardware
/// completes descriptors in order.
fn clean_tx_queue(queue: &mut IxgbeTxQueue) {
    loop {
        let mut cleanable = queue.tx_index as isize - queue.clean_index as isize;
        if cleanable < 0 {
            cleanable += queue.num_entries as isize;
        }
        if (cleanable as usize) < TX_CLEAN_BATCH {
            break;
        }

        let mut cleanup_to = queue.clean_index + TX_CLEAN_BATCH - 1;
        if cleanup_to >= queue.num_entries {
            cleanup_to -= queue.num_entries;
        }

        if !queue.desc(cleanup_to).descriptor_done() {
            break;
        }

        let mut i = queue.clean_index;
        loop {
            if let Err(e) = unsafe { Mempool::release_raw(queue.bufs_in_use[i]) } {
                debug!("leaking a sent buffer: {}", e);
            }
            if i == cleanup_to {
                break;
            }
            i = wrap_ring(i, queue.num_entries);
        }
        queue.clean_index = wrap_ring(cleanup_to, queue.num_entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Descriptor ring over leaked, 16-byte aligned heap memory.
    fn fake_ring(entries: usize) -> DmaMemory {
        let ring: Vec<u128> = vec![0; entries];
        let leaked = Box::leak(ring.into_boxed_slice());
        let virt = leaked.as_mut_ptr() as usize;
        DmaMemory::external(virt, virt, entries * 16)
    }

    /// A register window over leaked heap memory, large enough for every
    /// offset the data path touches.
    fn fake_regs() -> DeviceRegisters {
        let backing: Vec<u32> = vec![0; 0x20000 / 4];
        let leaked = Box::leak(backing.into_boxed_slice());
        unsafe { DeviceRegisters::external(leaked.as_mut_ptr() as usize, leaked.len() * 4) }
    }

    fn fake_mempool(entries: usize) -> Arc<Mempool> {
        let buf: Vec<u8> = vec![0; entries * PKT_BUF_SIZE];
        let leaked = Box::leak(buf.into_boxed_slice());
        let virt = leaked.as_mut_ptr() as usize;
        let dma = DmaMemory::external(virt, virt, leaked.len());
        Mempool::create_with_dma(dma, entries, PKT_BUF_SIZE).unwrap()
    }

    /// An rx queue whose ring is filled from a fresh pool, the way
    /// `start_rx_queue` leaves it.
    fn fake_rx_queue(entries: usize, pool_entries: usize) -> IxgbeRxQueue {
        let mempool = fake_mempool(pool_entries);
        let mut queue = IxgbeRxQueue {
            ring: fake_ring(entries),
            mempool: None,
            num_entries: entries,
            rx_index: 0,
            bufs_in_use: Vec::with_capacity(entries),
        };
        for i in 0..entries {
            let buf = mempool.acquire().unwrap();
            queue.desc(i).refill(buf.phys_addr() + DATA_OFFSET);
            queue.bufs_in_use.push(buf.virt_addr());
        }
        queue.mempool = Some(mempool);
        queue
    }

    fn fake_tx_queue(entries: usize) -> IxgbeTxQueue {
        IxgbeTxQueue {
            ring: fake_ring(entries),
            num_entries: entries,
            clean_index: 0,
            tx_index: 0,
            bufs_in_use: vec![0; entries],
        }
    }

    /// Simulates the hardware completing an rx descriptor: write-back with
    /// DD, EOP and a packet length.
    fn complete_rx_desc(queue: &IxgbeRxQueue, i: usize, len: u64) {
        queue.desc(i).header_buffer_address.write(
            intel_ethernet::descriptors::RX_STATUS_DD
                | intel_ethernet::descriptors::RX_STATUS_EOP
                | (len << 32),
        );
    }

    #[test]
    fn rx_without_done_descriptors_reads_nothing() {
        let mmio = fake_regs();
        let mut queue = fake_rx_queue(8, 16);
        // sentinel: RDT must stay untouched on an empty batch
        mmio.set_reg(regs::rdt(0), 0xAA);

        let mut bufs = Vec::new();
        assert_eq!(rx_batch_queue(&mmio, &mut queue, 0, &mut bufs, 8), 0);
        assert!(bufs.is_empty());
        assert_eq!(mmio.get_reg(regs::rdt(0)), 0xAA);
        assert_eq!(queue.rx_index, 0);
    }

    #[test]
    fn rx_produces_packets_and_refills_slots() {
        let mmio = fake_regs();
        let mut queue = fake_rx_queue(8, 16);
        complete_rx_desc(&queue, 0, 60);
        complete_rx_desc(&queue, 1, 128);

        let slot0_va = queue.bufs_in_use[0];
        let mut bufs = Vec::new();
        assert_eq!(rx_batch_queue(&mmio, &mut queue, 0, &mut bufs, 8), 2);

        assert_eq!(bufs[0].virt_addr(), slot0_va);
        assert_eq!(bufs[0].size(), 60);
        assert_eq!(bufs[1].size(), 128);

        // both slots were refilled with different buffers
        assert_ne!(queue.bufs_in_use[0], slot0_va);
        assert_eq!(queue.rx_index, 2);
        // ring invariant: RDT points one behind the software cursor
        assert_eq!(mmio.get_reg(regs::rdt(0)), 1);
        // and the refreshed descriptors carry the new buffers' addresses
        let desc_addr = queue.desc(0).packet_buffer_address.read();
        let buf0 = unsafe { PacketBuffer::from_raw(queue.bufs_in_use[0], PKT_BUF_SIZE) };
        assert_eq!(desc_addr as usize, buf0.phys_addr() + DATA_OFFSET);
    }

    #[test]
    fn rx_stops_when_the_pool_runs_dry() {
        let mmio = fake_regs();
        // pool exactly as large as the ring: refills exhaust it immediately
        let mut queue = fake_rx_queue(8, 8);
        for i in 0..4 {
            complete_rx_desc(&queue, i, 60);
        }

        let mut bufs = Vec::new();
        assert_eq!(rx_batch_queue(&mmio, &mut queue, 0, &mut bufs, 8), 0);
        assert!(bufs.is_empty());
        // no progress was published
        assert_eq!(queue.rx_index, 0);
    }

    #[test]
    fn rx_wraps_around_the_ring() {
        let mmio = fake_regs();
        let mut queue = fake_rx_queue(4, 16);
        queue.rx_index = 3;
        complete_rx_desc(&queue, 3, 60);
        complete_rx_desc(&queue, 0, 60);

        let mut bufs = Vec::new();
        assert_eq!(rx_batch_queue(&mmio, &mut queue, 0, &mut bufs, 8), 2);
        assert_eq!(queue.rx_index, 1);
        assert_eq!(mmio.get_reg(regs::rdt(0)), 0);
    }

    #[test]
    fn tx_full_ring_accepts_nothing() {
        let mmio = fake_regs();
        let mut queue = fake_tx_queue(8);
        queue.tx_index = 7;
        queue.clean_index = 0;

        let pool = fake_mempool(16);
        let mut bufs = Vec::new();
        for _ in 0..10 {
            bufs.push(pool.acquire().unwrap());
        }
        assert_eq!(tx_batch_queue(&mmio, &mut queue, 0, &mut bufs), 0);
        assert_eq!(bufs.len(), 10);
        assert_eq!(queue.tx_index, 7);
    }

    #[test]
    fn tx_enqueues_and_publishes_the_tail() {
        let mmio = fake_regs();
        let mut queue = fake_tx_queue(8);
        let pool = fake_mempool(16);

        let mut bufs = Vec::new();
        for _ in 0..3 {
            let mut b = pool.acquire().unwrap();
            b.set_size(60).unwrap();
            bufs.push(b);
        }
        let vas: Vec<usize> = bufs.iter().map(|b| b.virt_addr()).collect();

        assert_eq!(tx_batch_queue(&mmio, &mut queue, 0, &mut bufs), 3);
        assert!(bufs.is_empty());
        assert_eq!(queue.tx_index, 3);
        assert_eq!(mmio.get_reg(regs::tdt(0)), 3);
        assert_eq!(&queue.bufs_in_use[0..3], &vas[..]);

        let ctl = queue.desc(0).cmd_type_len.read();
        assert_eq!(ctl & 0xFFFF, 60);
        assert_ne!(ctl & intel_ethernet::descriptors::TX_CMD_EOP, 0);
    }

    #[test]
    fn tx_ring_never_holds_num_entries_packets() {
        let mmio = fake_regs();
        let mut queue = fake_tx_queue(8);
        let pool = fake_mempool(16);

        let mut bufs = Vec::new();
        for _ in 0..10 {
            let mut b = pool.acquire().unwrap();
            b.set_size(60).unwrap();
            bufs.push(b);
        }
        // descriptors never complete, so at most entries-1 fit
        let sent = tx_batch_queue(&mmio, &mut queue, 0, &mut bufs);
        assert_eq!(sent, 7);
        assert_eq!(bufs.len(), 3);
    }

    #[test]
    fn tx_clean_returns_buffers_to_their_pool() {
        let mmio = fake_regs();
        let mut queue = fake_tx_queue(64);
        let pool = fake_mempool(64);

        let mut bufs = Vec::new();
        for _ in 0..40 {
            let mut b = pool.acquire().unwrap();
            b.set_size(60).unwrap();
            bufs.push(b);
        }
        assert_eq!(tx_batch_queue(&mmio, &mut queue, 0, &mut bufs), 40);
        assert_eq!(pool.free_count(), 64 - 40);

        // hardware finishes the first clean batch
        queue.desc(TX_CLEAN_BATCH - 1).paylen_status.write(intel_ethernet::descriptors::TX_STATUS_DD);
        let mut empty = Vec::new();
        tx_batch_queue(&mmio, &mut queue, 0, &mut empty);
        assert_eq!(pool.free_count(), 64 - 40 + TX_CLEAN_BATCH);
        assert_eq!(queue.clean_index, TX_CLEAN_BATCH);
    }

    #[test]
    fn tx_clean_crosses_the_ring_boundary() {
        let mmio = fake_regs();
        let mut queue = fake_tx_queue(64);
        queue.tx_index = 60;
        queue.clean_index = 60;
        let pool = fake_mempool(64);

        let mut bufs = Vec::new();
        for _ in 0..40 {
            let mut b = pool.acquire().unwrap();
            b.set_size(60).unwrap();
            bufs.push(b);
        }
        assert_eq!(tx_batch_queue(&mmio, &mut queue, 0, &mut bufs), 40);
        assert_eq!(queue.tx_index, 36);

        // the block 60..=63,0..=27 completes; its last slot is 27
        queue.desc(27).paylen_status.write(intel_ethernet::descriptors::TX_STATUS_DD);
        let mut empty = Vec::new();
        tx_batch_queue(&mmio, &mut queue, 0, &mut empty);
        assert_eq!(queue.clean_index, 28);
        assert_eq!(pool.free_count(), 64 - 40 + TX_CLEAN_BATCH);
    }

    #[test]
    fn rdt_always_trails_the_cursor_by_one() {
        let mmio = fake_regs();
        let mut queue = fake_rx_queue(8, 64);
        let mut bufs = Vec::new();

        for i in 0..4 {
            complete_rx_desc(&queue, i, 60);
        }
        assert_eq!(rx_batch_queue(&mmio, &mut queue, 0, &mut bufs, 8), 4);
        assert_eq!(queue.rx_index, 4);
        assert_eq!(mmio.get_reg(regs::rdt(0)) as usize, (queue.rx_index + 8 - 1) % 8);

        for i in 4..8 {
            complete_rx_desc(&queue, i, 60);
        }
        complete_rx_desc(&queue, 0, 60);
        complete_rx_desc(&queue, 1, 60);
        assert_eq!(rx_batch_queue(&mmio, &mut queue, 0, &mut bufs, 8), 6);
        assert_eq!(queue.rx_index, 2);
        assert_eq!(mmio.get_reg(regs::rdt(0)) as usize, (queue.rx_index + 8 - 1) % 8);
        assert_eq!(bufs.len(), 10);
    }

    #[test]
    fn wrap_ring_is_a_power_of_two_mask() {
        assert_eq!(wrap_ring(0, 512), 1);
        assert_eq!(wrap_ring(511, 512), 0);
        assert_eq!(wrap_ring(5, 8), 6);
        assert_eq!(wrap_ring(7, 8), 0);
    }
}
