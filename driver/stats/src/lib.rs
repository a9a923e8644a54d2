//! Traffic counters and rate computation.
//!
//! The hardware counters are free-running and clear on read, so the driver
//! accumulates them into 64-bit totals. Applications keep two snapshots and
//! rotate them to turn totals into rates.

/// Accumulated totals for one device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub rx_pkts: u64,
    pub tx_pkts: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Bytes the wire carries per packet beyond the frame itself:
/// preamble (7), SFD (1), and the inter-frame gap (12).
const FRAMING_OVERHEAD_BYTES: u64 = 20;

impl DeviceStats {
    /// Adds received packets/bytes, clamping at the counter maximum instead
    /// of wrapping.
    pub fn add_rx(&mut self, pkts: u64, bytes: u64) {
        self.rx_pkts = self.rx_pkts.saturating_add(pkts);
        self.rx_bytes = self.rx_bytes.saturating_add(bytes);
    }

    /// Adds transmitted packets/bytes, clamping at the counter maximum.
    pub fn add_tx(&mut self, pkts: u64, bytes: u64) {
        self.tx_pkts = self.tx_pkts.saturating_add(pkts);
        self.tx_bytes = self.tx_bytes.saturating_add(bytes);
    }

    /// Prints the rx/tx rates between `prev` and `self` over `nanos`
    /// nanoseconds, in the canonical two-line format.
    pub fn print_diff(&self, prev: &DeviceStats, pci_addr: &str, nanos: u64) {
        println!(
            "[{}] RX: {:.2} Mbit/s {:.2} Mpps",
            pci_addr,
            mbits(self.rx_bytes - prev.rx_bytes, self.rx_pkts - prev.rx_pkts, nanos),
            mpps(self.rx_pkts - prev.rx_pkts, nanos),
        );
        println!(
            "[{}] TX: {:.2} Mbit/s {:.2} Mpps",
            pci_addr,
            mbits(self.tx_bytes - prev.tx_bytes, self.tx_pkts - prev.tx_pkts, nanos),
            mpps(self.tx_pkts - prev.tx_pkts, nanos),
        );
    }
}

/// Million packets per second over a span of `nanos` nanoseconds.
pub fn mpps(pkts: u64, nanos: u64) -> f64 {
    if nanos == 0 {
        return 0.0;
    }
    pkts as f64 / nanos as f64 * 1000.0
}

/// Megabits per second on the wire, accounting for the 20 framing bytes the
/// byte counters never see.
pub fn mbits(bytes: u64, pkts: u64, nanos: u64) -> f64 {
    if nanos == 0 {
        return 0.0;
    }
    let payload = bytes as f64 / nanos as f64 * 8000.0;
    payload + mpps(pkts, nanos) * (FRAMING_OVERHEAD_BYTES * 8) as f64
}
