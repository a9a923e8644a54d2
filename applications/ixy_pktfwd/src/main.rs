//! Packet forwarder: shovels traffic between two NICs in both directions.
//!
//! Each received packet has one payload byte incremented before it goes out
//! on the other device, so the forwarding path really reads and writes every
//! packet instead of just moving pointers around.

#[macro_use] extern crate log;

use std::env;
use std::process;
use std::time::{Duration, Instant};

use getopts::Options;

use driver_error::Result;
use ixgbe::IxgbeDevice;
use nic_buffers::{Mempool, PacketBuffer};
use stats::DeviceStats;

const DEFAULT_BATCH_SIZE: usize = 32;

/// Payload byte the forwarder touches in every packet.
const TOUCH_OFFSET: usize = 48;

/// The clock is sampled every 0x100 forward iterations.
const SAMPLE_MASK: u32 = 0xFF;
const PRINT_INTERVAL: Duration = Duration::from_secs(1);

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut opts = Options::new();
    opts.optopt("b", "batch-size", "number of packets per forward batch (default: 32)", "N");
    opts.optflag("h", "help", "print this help menu");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            print_usage(&args[0], &opts);
            process::exit(1);
        }
    };
    if matches.opt_present("h") || matches.free.len() != 2 {
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

    if let Err(e) = run(&matches.free[0], &matches.free[1], batch_size) {
        error!("{}", e);
        process::exit(1);
    }
}

fn print_usage(program: &str, opts: &Options) {
    print!("{}", opts.usage(&format!("Usage: {} [options] <pci-address-1> <pci-address-2>", program)));
}

fn run(pci_addr_1: &str, pci_addr_2: &str, batch_size: usize) -> Result<()> {
    let mut dev1 = IxgbeDevice::new(pci_addr_1, 1, 1)?;
    dev1.configure()?;
    let mut dev2 = IxgbeDevice::new(pci_addr_2, 1, 1)?;
    dev2.configure()?;

    let mut stats1 = DeviceStats::default();
    let mut stats1_old = DeviceStats::default();
    let mut stats2 = DeviceStats::default();
    let mut stats2_old = DeviceStats::default();
    dev1.reset_stats();
    dev2.reset_stats();

    let mut bufs: Vec<PacketBuffer> = Vec::with_capacity(batch_size);
    let mut counter: u32 = 0;
    let mut last_print = Instant::now();

    info!("forwarding between {} and {}", pci_addr_1, pci_addr_2);
    loop {
        forward(&mut dev1, &mut dev2, batch_size, &mut bufs);
        forward(&mut dev2, &mut dev1, batch_size, &mut bufs);

        counter = counter.wrapping_add(1);
        if counter & SAMPLE_MASK == 0 {
            let elapsed = last_print.elapsed();
            if elapsed >= PRINT_INTERVAL {
                let nanos = elapsed.as_nanos() as u64;
                dev1.read_stats(&mut stats1);
                stats1.print_diff(&stats1_old, pci_addr_1, nanos);
                stats1_old = stats1;
                dev2.read_stats(&mut stats2);
                stats2.print_diff(&stats2_old, pci_addr_2, nanos);
                stats2_old = stats2;
                last_print = Instant::now();
            }
        }
    }
}

/// Moves one batch from `rx_dev` to `tx_dev`. Packets the transmit ring has
/// no room for go straight back to their pool; dropping beats blocking when
/// the output is slower than the input.
fn forward(rx_dev: &mut IxgbeDevice, tx_dev: &mut IxgbeDevice, batch_size: usize, bufs: &mut Vec<PacketBuffer>) {
    let received = rx_dev.rx_batch(0, bufs, batch_size);
    if received == 0 {
        return;
    }

    for buf in bufs.iter_mut() {
        if let Ok(b) = buf.read_u8(TOUCH_OFFSET) {
            let _ = buf.write_u8(TOUCH_OFFSET, b.wrapping_add(1));
        }
    }

    tx_dev.tx_batch(0, bufs);

    // the remainder did not fit into the tx ring
    for buf in bufs.drain(..) {
        if let Err(e) = Mempool::release_to_owner(buf) {
            debug!("dropping a packet without a home: {}", e);
        }
    }
}
