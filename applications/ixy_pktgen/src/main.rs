//! Packet generator: fills a mempool with a fixed Ethernet/IPv4/UDP frame
//! and transmits it as fast as one queue allows, stamping each packet with a
//! sequence number. Rates are printed once a second.

#[macro_use] extern crate log;

use std::env;
use std::process;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use getopts::Options;
use zerocopy::AsBytes;

use driver_error::Result;
use ixgbe::IxgbeDevice;
use nic_buffers::Mempool;
use stats::DeviceStats;

/// Size of the generated frames on the wire (without FCS).
const PACKET_SIZE: usize = 60;

/// Buffers in the transmit pool; far more than one ring holds, so cleaning
/// never starves the generator.
const POOL_ENTRIES: usize = 2048;

const DEFAULT_BATCH_SIZE: usize = 32;

/// Stats cadence: the clock is sampled every 0x1000 batches and printed
/// once at least a second has passed.
const BATCH_SAMPLE_MASK: u32 = 0xFFF;
const PRINT_INTERVAL: Duration = Duration::from_secs(1);

/// The generated frame: broadcast-ish MACs, 10.0.0.1:42 -> 10.0.0.2:1337,
/// payload "ixy". Field order matches the wire; multi-byte fields are
/// big-endian byte arrays so the struct has no padding and can be copied
/// into packet buffers as raw bytes.
#[derive(AsBytes)]
#[repr(C)]
struct PacketTemplate {
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    ether_type: [u8; 2],
    version_ihl: u8,
    dscp_ecn: u8,
    total_length: [u8; 2],
    identification: [u8; 2],
    flags_fragment: [u8; 2],
    ttl: u8,
    protocol: u8,
    header_checksum: [u8; 2],
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    src_port: [u8; 2],
    dst_port: [u8; 2],
    udp_length: [u8; 2],
    udp_checksum: [u8; 2],
    payload: [u8; 3],
}

/// Byte offset of the IPv4 header inside an Ethernet frame.
const IP_HEADER_OFFSET: usize = 14;
const IP_HEADER_LEN: usize = 20;
/// Offset of the checksum field inside the IPv4 header.
const IP_CHECKSUM_OFFSET: usize = 10;

fn packet_template() -> PacketTemplate {
    let ip_len = (PACKET_SIZE - IP_HEADER_OFFSET) as u16;
    let udp_len = (PACKET_SIZE - IP_HEADER_OFFSET - IP_HEADER_LEN) as u16;
    let mut template = PacketTemplate {
        dst_mac: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
        src_mac: [0x11, 0x12, 0x13, 0x14, 0x15, 0x16],
        ether_type: [0x08, 0x00],
        version_ihl: 0x45,
        dscp_ecn: 0,
        total_length: ip_len.to_be_bytes(),
        identification: [0, 0],
        flags_fragment: [0, 0],
        ttl: 64,
        protocol: 0x11,
        header_checksum: [0, 0],
        src_ip: [10, 0, 0, 1],
        dst_ip: [10, 0, 0, 2],
        src_port: 42u16.to_be_bytes(),
        dst_port: 1337u16.to_be_bytes(),
        udp_length: udp_len.to_be_bytes(),
        udp_checksum: [0, 0],
        payload: *b"ixy",
    };
    let checksum = calc_ipv4_checksum(template.as_bytes(), IP_HEADER_OFFSET);
    template.header_checksum = checksum.to_le_bytes();
    template
}

/// Ones-complement sum over the 20-byte IPv4 header at `offset`, skipping
/// the checksum field itself. Words are read in host order and the result
/// is stored in host order too, which leaves the wire bytes correct.
fn calc_ipv4_checksum(packet: &[u8], offset: usize) -> u16 {
    let header = &packet[offset..offset + IP_HEADER_LEN];
    let mut checksum: u32 = 0;
    for i in (0..IP_HEADER_LEN).step_by(2) {
        if i == IP_CHECKSUM_OFFSET {
            continue;
        }
        checksum += LittleEndian::read_u16(&header[i..]) as u32;
        if checksum > 0xFFFF {
            checksum = (checksum & 0xFFFF) + 1;
        }
    }
    !(checksum as u16)
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut opts = Options::new();
    opts.optopt("b", "batch-size", "number of packets per transmit batch (default: 32)", "N");
    opts.optflag("h", "help", "print this help menu");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            print_usage(&args[0], &opts);
            process::exit(1);
        }
    };
    if matches.opt_present("h") || matches.free.len() != 1 {
        print_usage(&args[0], &opts);
        process::exit(if matches.opt_present("h") { 0 } else { 1 });
    }
    let batch_size: usize = match matches.opt_get_default("b", DEFAULT_BATCH_SIZE) {
        Ok(n) if n > 0 => n,
        _ => {
            eprintln!("batch size must be a positive integer");
            process::exit(1);
        }
    };
    let pci_addr = &matches.free[0];

    if let Err(e) = run(pci_addr, batch_size) {
        error!("{}", e);
        process::exit(1);
    }
}

fn print_usage(program: &str, opts: &Options) {
    print!("{}", opts.usage(&format!("Usage: {} [options] <pci-address>", program)));
}

fn run(pci_addr: &str, batch_size: usize) -> Result<()> {
    let mut device = IxgbeDevice::new(pci_addr, 1, 1)?;
    device.configure()?;

    let pool = Mempool::create(POOL_ENTRIES, 2048)?;

    // stamp the template into every buffer once; the hot loop only touches
    // the sequence number
    let template = packet_template();
    let mut prefill = Vec::with_capacity(POOL_ENTRIES);
    while let Some(mut buf) = pool.acquire() {
        buf.write_bytes(0, template.as_bytes())?;
        buf.set_size(PACKET_SIZE)?;
        prefill.push(buf);
    }
    for buf in prefill.drain(..) {
        pool.release(buf)?;
    }

    let mut stats = DeviceStats::default();
    let mut stats_old = DeviceStats::default();
    device.reset_stats();

    let mut bufs = Vec::with_capacity(batch_size);
    let mut seq_num: u32 = 0;
    let mut counter: u32 = 0;
    let mut last_print = Instant::now();

    info!("generating {}-byte packets on {}", PACKET_SIZE, pci_addr);
    loop {
        pool.acquire_batch(&mut bufs, batch_size);
        for buf in bufs.iter_mut() {
            buf.write_u32(PACKET_SIZE - 4, seq_num)
                .expect("sequence number fits the payload");
            seq_num = seq_num.wrapping_add(1);
        }
        device.tx_busy_wait(0, &mut bufs);

        // time-keeping is kept off the fast path
        counter = counter.wrapping_add(1);
        if counter & BATCH_SAMPLE_MASK == 0 {
            let elapsed = last_print.elapsed();
            if elapsed >= PRINT_INTERVAL {
                device.read_stats(&mut stats);
                stats.print_diff(&stats_old, pci_addr, elapsed.as_nanos() as u64);
                stats_old = stats;
                last_print = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_layout() {
        let template = packet_template();
        let bytes = template.as_bytes();
        assert_eq!(bytes.len(), 45);
        assert_eq!(&bytes[0..6], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(&bytes[12..14], &[0x08, 0x00]);
        // IP total length covers everything behind the Ethernet header
        assert_eq!(&bytes[16..18], &[0x00, 0x2E]);
        assert_eq!(bytes[23], 0x11);
        assert_eq!(&bytes[26..30], &[10, 0, 0, 1]);
        assert_eq!(&bytes[30..34], &[10, 0, 0, 2]);
        assert_eq!(&bytes[34..36], &42u16.to_be_bytes());
        assert_eq!(&bytes[36..38], &1337u16.to_be_bytes());
        assert_eq!(&bytes[42..45], b"ixy");
    }

    #[test]
    fn checksum_of_the_template() {
        let template = packet_template();
        let bytes = template.as_bytes();
        // the wire bytes of the checksum field for this exact header
        assert_eq!(&bytes[24..26], &[0x66, 0xBD]);
    }

    #[test]
    fn checksum_roundtrip() {
        // summing the full header including the checksum must give the
        // all-ones word; that is the defining property of the field
        let template = packet_template();
        let bytes = template.as_bytes();
        let mut sum: u32 = 0;
        for i in (IP_HEADER_OFFSET..IP_HEADER_OFFSET + IP_HEADER_LEN).step_by(2) {
            sum += LittleEndian::read_u16(&bytes[i..]) as u32;
            if sum > 0xFFFF {
                sum = (sum & 0xFFFF) + 1;
            }
        }
        assert_eq!(sum, 0xFFFF);
    }

    #[test]
    fn checksum_is_insensitive_to_its_own_field() {
        let template = packet_template();
        let with_field = calc_ipv4_checksum(template.as_bytes(), IP_HEADER_OFFSET);
        let mut cleared = packet_template();
        cleared.header_checksum = [0, 0];
        let without_field = calc_ipv4_checksum(cleared.as_bytes(), IP_HEADER_OFFSET);
        assert_eq!(with_field, without_field);
    }
}
