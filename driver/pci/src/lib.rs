//! PCI device access through the Linux sysfs interface.
//!
//! A [`PciDevice`] owns the open `config` handle of one device under
//! `/sys/bus/pci/devices/<addr>/` and knows how to unbind the kernel driver,
//! flip the bus-master DMA bit, and memory-map BAR0. The mapped register
//! window is handed out as a separate [`DeviceRegisters`] value so the
//! device-specific driver can poke registers without holding the sysfs
//! state machine.

#[macro_use] extern crate log;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use driver_error::{Error, Result};

mod regs;
pub use regs::DeviceRegisters;

/// Offset of the vendor id in config space.
const CFG_VENDOR_ID: u64 = 0x00;
/// Offset of the device id in config space.
const CFG_DEVICE_ID: u64 = 0x02;
/// Offset of the command register in config space.
const CFG_COMMAND: u64 = 0x04;
/// Offset of the class code (3 bytes) in config space.
const CFG_CLASS: u64 = 0x09;
/// Offset of the first base address register in config space.
const CFG_BAR0: u64 = 0x10;

/// Bus-master enable bit of the command register.
const CMD_BUS_MASTER: u16 = 1 << 2;

/// State of the device as found at open time, reapplied on drop so the
/// kernel gets its device back the way it was.
#[derive(Debug, Clone, Copy)]
struct OpenSnapshot {
    was_bound: bool,
    dma_was_enabled: bool,
}

/// One PCI device addressed by its fully qualified `DDDD:BB:SS.F` string.
#[derive(Debug)]
pub struct PciDevice {
    pci_addr: String,
    driver: String,
    sysfs_root: PathBuf,
    /// Open handle on the device's `config` file; `None` once closed.
    config: Option<File>,
    snapshot: OpenSnapshot,
    /// When set, drop leaves the device exactly as close() left it.
    restore_on_drop: bool,
}

impl PciDevice {
    /// Opens the device below `/sys/bus/pci`. Only file handles are touched
    /// here; no MMIO happens until [`map_resource`](Self::map_resource).
    pub fn open(pci_addr: &str, driver: &str) -> Result<PciDevice> {
        Self::open_with_root("/sys/bus/pci", pci_addr, driver)
    }

    /// Opens the device below an alternate sysfs root. Exists so the state
    /// machine can be driven against a synthetic device tree.
    pub fn open_with_root(sysfs_root: impl AsRef<Path>, pci_addr: &str, driver: &str) -> Result<PciDevice> {
        if !valid_pci_addr(pci_addr) {
            return Err(Error::invalid_arg("PCI address must be fully qualified as DDDD:BB:SS.F"));
        }
        let sysfs_root = sysfs_root.as_ref().to_path_buf();
        let config_path = sysfs_root.join("devices").join(pci_addr).join("config");
        let config = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config_path)
            .map_err(|e| Error::io("opening PCI config file", e))?;

        let mut device = PciDevice {
            pci_addr: pci_addr.to_string(),
            driver: driver.to_string(),
            sysfs_root,
            config: Some(config),
            snapshot: OpenSnapshot { was_bound: false, dma_was_enabled: false },
            restore_on_drop: true,
        };
        device.snapshot = OpenSnapshot {
            was_bound: device.is_bound(),
            dma_was_enabled: device.is_dma_enabled()?,
        };
        debug!(
            "opened PCI device {}: bound={} dma={}",
            device.pci_addr, device.snapshot.was_bound, device.snapshot.dma_was_enabled
        );
        Ok(device)
    }

    pub fn pci_addr(&self) -> &str {
        &self.pci_addr
    }

    fn config(&self) -> Result<&File> {
        self.config
            .as_ref()
            .ok_or_else(|| Error::invalid_state("PCI device is closed"))
    }

    fn read_config(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut config = self.config()?;
        config
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io("seeking in PCI config space", e))?;
        config
            .read_exact(buf)
            .map_err(|e| Error::io("reading PCI config space", e))?;
        Ok(())
    }

    fn write_config(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut config = self.config()?;
        config
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io("seeking in PCI config space", e))?;
        config
            .write_all(buf)
            .map_err(|e| Error::io("writing PCI config space", e))?;
        Ok(())
    }

    pub fn vendor_id(&self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_config(CFG_VENDOR_ID, &mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    pub fn device_id(&self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_config(CFG_DEVICE_ID, &mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    /// The 24-bit class code: base class, sub class, programming interface.
    pub fn class_id(&self) -> Result<u32> {
        let mut buf = [0u8; 3];
        self.read_config(CFG_CLASS, &mut buf)?;
        Ok(LittleEndian::read_u24(&buf))
    }

    pub fn is_dma_enabled(&self) -> Result<bool> {
        Ok(self.command_register()? & CMD_BUS_MASTER != 0)
    }

    /// Sets the bus-master bit so the NIC may issue DMA reads and writes.
    pub fn enable_dma(&self) -> Result<()> {
        let cmd = self.command_register()?;
        self.set_command_register(cmd | CMD_BUS_MASTER)
    }

    pub fn disable_dma(&self) -> Result<()> {
        let cmd = self.command_register()?;
        self.set_command_register(cmd & !CMD_BUS_MASTER)
    }

    fn command_register(&self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_config(CFG_COMMAND, &mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    fn set_command_register(&self, value: u16) -> Result<()> {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.write_config(CFG_COMMAND, &buf)
    }

    /// Whether the expected kernel driver currently claims this device.
    pub fn is_bound(&self) -> bool {
        self.driver_dir().join(&self.pci_addr).exists()
    }

    /// Hands the device back to the kernel driver.
    pub fn bind(&self) -> Result<()> {
        self.config()?;
        self.write_driver_file("bind")
    }

    /// Takes the device away from the kernel driver.
    pub fn unbind(&self) -> Result<()> {
        self.config()?;
        if !self.is_bound() {
            return Ok(());
        }
        self.write_driver_file("unbind")
    }

    fn driver_dir(&self) -> PathBuf {
        self.sysfs_root.join("drivers").join(&self.driver)
    }

    fn write_driver_file(&self, name: &str) -> Result<()> {
        let path = self.driver_dir().join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| Error::io("opening driver bind/unbind file", e))?;
        file.write_all(self.pci_addr.as_bytes())
            .map_err(|e| Error::io("writing PCI address to driver file", e))?;
        Ok(())
    }

    /// BAR0 must be a memory BAR (bit 0 clear); I/O-port BARs cannot be
    /// mmapped.
    pub fn is_mappable(&self) -> Result<bool> {
        let mut buf = [0u8; 4];
        self.read_config(CFG_BAR0, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf) & 0x1 == 0)
    }

    /// Maps `resource0` (the BAR0 register file) and returns the register
    /// window. The window owns the mapping and unmaps it when dropped.
    pub fn map_resource(&self) -> Result<DeviceRegisters> {
        self.config()?;
        if !self.is_mappable()? {
            return Err(Error::unsupported("BAR0 is an I/O-port BAR, not memory-mappable"));
        }
        let path = self
            .sysfs_root
            .join("devices")
            .join(&self.pci_addr)
            .join("resource0");
        let path = path
            .to_str()
            .ok_or_else(|| Error::invalid_arg("sysfs path is not valid UTF-8"))?;
        let (virt, size) = memory::mmap_file(path, false, false)?;
        info!("mapped BAR0 of {} at {:#x} ({} KiB)", self.pci_addr, virt, size / 1024);
        Ok(unsafe { DeviceRegisters::new(virt, size) })
    }

    /// Releases the config handle. Every subsequent operation fails with
    /// `InvalidState`. The open-time snapshot is NOT reapplied; callers
    /// close precisely when they want to leave the device as-is.
    pub fn close(&mut self) {
        self.config = None;
        self.restore_on_drop = false;
    }

    fn restore_snapshot(&self) {
        if self.config.is_none() {
            return;
        }
        match (self.snapshot.dma_was_enabled, self.is_dma_enabled()) {
            (false, Ok(true)) => {
                if let Err(e) = self.disable_dma() {
                    warn!("could not restore DMA state of {}: {}", self.pci_addr, e);
                }
            }
            (true, Ok(false)) => {
                if let Err(e) = self.enable_dma() {
                    warn!("could not restore DMA state of {}: {}", self.pci_addr, e);
                }
            }
            _ => {}
        }
        if self.snapshot.was_bound && !self.is_bound() {
            if let Err(e) = self.bind() {
                warn!("could not rebind {} to {}: {}", self.pci_addr, self.driver, e);
            }
        }
    }
}

impl Drop for PciDevice {
    fn drop(&mut self) {
        if self.restore_on_drop {
            self.restore_snapshot();
        }
    }
}

/// Checks the `DDDD:BB:SS.F` form: four hex digits, colon, two, colon,
/// two, dot, one.
fn valid_pci_addr(addr: &str) -> bool {
    let bytes = addr.as_bytes();
    if bytes.len() != 12 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            4 | 7 => {
                if *b != b':' {
                    return false;
                }
            }
            10 => {
                if *b != b'.' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_sysfs(test: &str, config: &[u8]) -> (PathBuf, String) {
        let addr = "0000:01:00.0".to_string();
        let root = std::env::temp_dir()
            .join(format!("pci-test-{}-{}", std::process::id(), test));
        let dev_dir = root.join("devices").join(&addr);
        fs::create_dir_all(&dev_dir).unwrap();
        fs::create_dir_all(root.join("drivers").join("ixgbe")).unwrap();
        fs::write(dev_dir.join("config"), config).unwrap();
        (root, addr)
    }

    fn ixgbe_config() -> Vec<u8> {
        let mut cfg = vec![0u8; 64];
        LittleEndian::write_u16(&mut cfg[0..2], 0x8086);
        LittleEndian::write_u16(&mut cfg[2..4], 0x10FB);
        // command register: memory space + bus master enabled
        LittleEndian::write_u16(&mut cfg[4..6], 0x0006);
        // class code 0x020000 (ethernet controller)
        cfg[0x09] = 0x00;
        cfg[0x0A] = 0x00;
        cfg[0x0B] = 0x02;
        // BAR0: memory BAR at some address
        LittleEndian::write_u32(&mut cfg[0x10..0x14], 0xF790_0000);
        cfg
    }

    #[test]
    fn address_validation() {
        assert!(valid_pci_addr("0000:01:00.0"));
        assert!(valid_pci_addr("0000:af:1f.7"));
        assert!(!valid_pci_addr("01:00.0"));
        assert!(!valid_pci_addr("0000:01:00"));
        assert!(!valid_pci_addr("0000-01-00.0"));
        assert!(!valid_pci_addr("000g:01:00.0"));
    }

    #[test]
    fn config_space_fields() {
        let (root, addr) = fake_sysfs("fields", &ixgbe_config());
        let dev = PciDevice::open_with_root(&root, &addr, "ixgbe").unwrap();
        assert_eq!(dev.vendor_id().unwrap(), 0x8086);
        assert_eq!(dev.device_id().unwrap(), 0x10FB);
        assert_eq!(dev.class_id().unwrap(), 0x020000);
        assert!(dev.is_dma_enabled().unwrap());
        assert!(dev.is_mappable().unwrap());
    }

    #[test]
    fn dma_bit_toggling() {
        let (root, addr) = fake_sysfs("dma", &ixgbe_config());
        let mut dev = PciDevice::open_with_root(&root, &addr, "ixgbe").unwrap();
        // keep the fake sysfs as-is when the handle drops
        dev.restore_on_drop = false;
        dev.disable_dma().unwrap();
        assert!(!dev.is_dma_enabled().unwrap());
        dev.enable_dma().unwrap();
        assert!(dev.is_dma_enabled().unwrap());
    }

    #[test]
    fn closed_device_rejects_everything() {
        let (root, addr) = fake_sysfs("close", &ixgbe_config());
        let mut dev = PciDevice::open_with_root(&root, &addr, "ixgbe").unwrap();
        dev.close();
        let err = dev.vendor_id().unwrap_err();
        assert_eq!(err.kind(), driver_error::ErrorKind::InvalidState);
        let err = dev.enable_dma().unwrap_err();
        assert_eq!(err.kind(), driver_error::ErrorKind::InvalidState);
        assert!(dev.bind().is_err());
    }

    #[test]
    fn rejects_malformed_address() {
        let err = PciDevice::open("garbage", "ixgbe").unwrap_err();
        assert_eq!(err.kind(), driver_error::ErrorKind::InvalidArg);
    }

    #[test]
    fn bind_writes_the_address_to_the_driver_file() {
        let (root, addr) = fake_sysfs("bind", &ixgbe_config());
        let driver_dir = root.join("drivers").join("ixgbe");
        fs::write(driver_dir.join("bind"), b"").unwrap();
        fs::write(driver_dir.join("unbind"), b"").unwrap();

        let mut dev = PciDevice::open_with_root(&root, &addr, "ixgbe").unwrap();
        dev.restore_on_drop = false;

        dev.bind().unwrap();
        assert_eq!(fs::read(driver_dir.join("bind")).unwrap(), addr.as_bytes());

        // unbind is a no-op while the device is not bound
        dev.unbind().unwrap();
        assert_eq!(fs::read(driver_dir.join("unbind")).unwrap(), b"");

        // a bound device (the sysfs entry exists) gets written to unbind
        fs::create_dir_all(driver_dir.join(&addr)).unwrap();
        assert!(dev.is_bound());
        dev.unbind().unwrap();
        assert_eq!(fs::read(driver_dir.join("unbind")).unwrap(), addr.as_bytes());
    }
}
