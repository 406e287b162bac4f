//! Serial port discovery and ranking.
//!
//! Ports are classified against a table of known Meshtastic boards and USB-serial
//! bridge chips, then ranked so the most likely radio comes first. The table is an
//! injected [`DiscoveryConfig`]; enumeration and probing sit behind [`PortEnumerator`]
//! so ranking can be exercised against fixture port lists.
use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::error::{MeshError, Result};

pub const SCORE_WHITELISTED: u32 = 50;
pub const SCORE_UNKNOWN: u32 = 100;
pub const SCORE_BLACKLISTED: u32 = 1000;
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceProfile {
    pub name: String,
    pub description: String,
    pub vid: u16,
    /// `0` matches any product of the vendor.
    #[serde(default)]
    pub pid: u16,
    #[serde(default)]
    pub linux_prefixes: Vec<String>,
    #[serde(default)]
    pub mac_prefixes: Vec<String>,
    #[serde(default)]
    pub windows_prefixes: Vec<String>,
    /// Lower ranks first.
    pub priority: u32,
}

impl DeviceProfile {
    fn new(name: &str, description: &str, vid: u16, pid: u16, priority: u32) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            vid,
            pid,
            linux_prefixes: vec!["/dev/ttyUSB".into()],
            mac_prefixes: vec!["/dev/cu.usbserial".into()],
            windows_prefixes: vec!["COM".into()],
            priority,
        }
    }

    fn native_usb(mut self) -> Self {
        self.linux_prefixes = vec!["/dev/ttyACM".into()];
        self.mac_prefixes = vec!["/dev/cu.usbmodem".into()];
        self
    }

    /// Path prefixes for the platform we are running on.
    pub fn platform_prefixes(&self) -> &[String] {
        if cfg!(target_os = "windows") {
            &self.windows_prefixes
        } else if cfg!(target_os = "macos") {
            &self.mac_prefixes
        } else {
            &self.linux_prefixes
        }
    }

    fn matches_path(&self, port: &str) -> bool {
        self.platform_prefixes().iter().any(|p| port.starts_with(p.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub devices: Vec<DeviceProfile>,
    pub whitelist_vids: Vec<u16>,
    pub blacklist_vids: Vec<u16>,
    pub check_baud: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            devices: vec![
                DeviceProfile::new("RAK4631", "RAK WisBlock 4631 (nRF52840)", 0x239A, 0x8029, 1)
                    .native_usb(),
                DeviceProfile::new("Heltec V2", "Heltec WiFi LoRa 32 V2", 0x10C4, 0xEA60, 2),
                DeviceProfile::new("T-Beam", "LILYGO T-Beam", 0x10C4, 0xEA60, 3),
                DeviceProfile::new("ESP32 DevKit", "ESP32 board with CP210x bridge", 0x10C4, 0xEA60, 10),
                DeviceProfile::new("CH340", "CH340 USB serial bridge", 0x1A86, 0x7523, 15),
                DeviceProfile::new("FTDI", "FTDI USB serial bridge", 0x0403, 0x6001, 20),
            ],
            // Adafruit/nRF52, Espressif, Silicon Labs, WCH, FTDI
            whitelist_vids: vec![0x239A, 0x303A, 0x10C4, 0x1A86, 0x0403],
            // SEGGER J-Link, STMicro, Nordic DK, Lakeview, Cypress
            blacklist_vids: vec![0x1366, 0x0483, 0x1915, 0x0925, 0x04B4],
            check_baud: 115_200,
        }
    }
}

impl DiscoveryConfig {
    pub fn is_whitelisted(&self, vid: u16) -> bool {
        self.whitelist_vids.contains(&vid)
    }

    pub fn is_blacklisted(&self, vid: u16) -> bool {
        self.blacklist_vids.contains(&vid)
    }

    /// Best profile for a port: exact VID/PID on the expected path, then exact VID/PID,
    /// then a vendor-wide profile.
    pub fn match_profile(&self, port: &str, vid: u16, pid: u16) -> Option<&DeviceProfile> {
        let exact = |d: &&DeviceProfile| d.vid == vid && d.pid != 0 && d.pid == pid;
        self.devices
            .iter()
            .filter(exact)
            .find(|d| d.matches_path(port))
            .or_else(|| self.devices.iter().find(exact))
            .or_else(|| self.devices.iter().find(|d| d.vid == vid && d.pid == 0))
    }
}

/// Raw enumeration result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

pub trait PortEnumerator: Send + Sync {
    fn list_ports(&self) -> Result<Vec<PortCandidate>>;
    /// Open then close the port.
    fn try_open(&self, name: &str, baud: u32) -> Result<()>;
    /// Open with a short read timeout and try one read. A read timeout is a pass.
    fn test_read(&self, name: &str, baud: u32, timeout: Duration) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DiscoveredPort {
    pub name: String,
    pub description: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    /// Matched profile name.
    pub device_type: Option<String>,
    pub priority: u32,
    pub whitelisted: bool,
    pub blacklisted: bool,
}

impl fmt::Display for DiscoveredPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.description)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResult {
    pub ports: Vec<DiscoveredPort>,
    pub best_port: Option<DiscoveredPort>,
    pub multiple_found: bool,
}

pub struct Discovery {
    config: DiscoveryConfig,
    enumerator: Box<dyn PortEnumerator>,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig, enumerator: Box<dyn PortEnumerator>) -> Self {
        Self { config, enumerator }
    }

    #[cfg(feature = "serial")]
    pub fn system(config: DiscoveryConfig) -> Self {
        Self::new(config, Box::new(SystemPorts))
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn classify(&self, c: PortCandidate) -> DiscoveredPort {
        let (whitelisted, blacklisted) = match c.vid {
            Some(vid) => (self.config.is_whitelisted(vid), self.config.is_blacklisted(vid)),
            None => (false, false),
        };
        let profile = match (c.vid, c.pid) {
            (Some(vid), Some(pid)) => self.config.match_profile(&c.name, vid, pid),
            _ => None,
        };
        let priority = match profile {
            Some(p) => p.priority,
            None if whitelisted => SCORE_WHITELISTED,
            None if blacklisted => SCORE_BLACKLISTED,
            None => SCORE_UNKNOWN,
        };
        let description = match (profile, &c.product, c.vid) {
            (Some(p), _, _) => p.description.clone(),
            (None, Some(product), _) => product.clone(),
            (None, None, Some(_)) => "USB serial device".to_string(),
            (None, None, None) => "Serial port".to_string(),
        };
        DiscoveredPort {
            name: c.name,
            description,
            vid: c.vid,
            pid: c.pid,
            serial_number: c.serial_number,
            manufacturer: c.manufacturer,
            product: c.product,
            device_type: profile.map(|p| p.name.clone()),
            priority,
            whitelisted,
            blacklisted,
        }
    }

    /// Every openable port, classified but unfiltered.
    pub fn find_all_ports(&self) -> Result<Vec<DiscoveredPort>> {
        let mut out = Vec::new();
        for c in self.enumerator.list_ports()? {
            if let Err(e) = self.enumerator.try_open(&c.name, self.config.check_baud) {
                debug!("Skipping {}: {}", c.name, e);
                continue;
            }
            out.push(self.classify(c));
        }
        Ok(out)
    }

    /// Likely radios, best first.
    pub fn find_meshtastic_ports(&self) -> Result<Vec<DiscoveredPort>> {
        let all = self.find_all_ports()?;
        let mut ports: Vec<DiscoveredPort> = all
            .iter()
            .filter(|p| p.whitelisted && !p.blacklisted)
            .cloned()
            .collect();
        if ports.is_empty() {
            ports = all.into_iter().filter(|p| !p.blacklisted).collect();
        }
        ports.sort_by_key(|p| p.priority);
        Ok(ports)
    }

    pub fn find_best_port(&self) -> Result<DiscoveredPort> {
        let ports = self.find_meshtastic_ports()?;
        if ports.len() > 1 {
            info!("Found {} candidate devices:", ports.len());
            for p in &ports {
                info!("  {} [priority {}]", p, p.priority);
            }
        }
        let best = ports.into_iter().next().ok_or(MeshError::NoDeviceFound)?;
        info!("Selected {}", best);
        Ok(best)
    }

    pub fn discover(&self) -> Result<DiscoveryResult> {
        let ports = self.find_meshtastic_ports()?;
        Ok(DiscoveryResult {
            best_port: ports.first().cloned(),
            multiple_found: ports.len() > 1,
            ports,
        })
    }

    pub fn port_info(&self, name: &str) -> Result<DiscoveredPort> {
        self.enumerator
            .list_ports()?
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| self.classify(c))
            .ok_or_else(|| MeshError::PortNotFound(name.to_string()))
    }

    /// Poll until a radio shows up, the timeout passes or `cancel` fires.
    pub async fn wait_for_device(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DiscoveredPort> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find_best_port() {
                Ok(port) => return Ok(port),
                Err(MeshError::NoDeviceFound) => {}
                Err(e) => warn!("Port enumeration failed: {}", e),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MeshError::Timeout("device"));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(MeshError::Cancelled),
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL.min(remaining)) => {}
            }
        }
    }

    /// Whether `name` still shows up in the port enumeration. An open port stays
    /// listed, so this is safe to call while connected.
    pub fn is_device_connected(&self, name: &str) -> Result<bool> {
        Ok(self.enumerator.list_ports()?.iter().any(|c| c.name == name))
    }

    /// Poll `name` every `interval` until `cancel` fires, calling `on_change` whenever
    /// its presence flips. The first poll reports a present device.
    pub async fn monitor_device_connection<F>(
        &self,
        name: &str,
        interval: Duration,
        cancel: &CancellationToken,
        mut on_change: F,
    ) where
        F: FnMut(bool),
    {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => match self.is_device_connected(name) {
                    Ok(present) if present != last => {
                        last = present;
                        on_change(present);
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Port enumeration failed while watching {}: {}", name, e),
                },
            }
        }
        debug!("Stopped watching {}", name);
    }

    pub fn test_port_connection(&self, name: &str) -> Result<()> {
        self.enumerator
            .test_read(name, self.config.check_baud, Duration::from_secs(1))
    }
}

/// Glob-style hints for where radios usually appear on this platform.
pub fn platform_port_patterns() -> &'static [&'static str] {
    if cfg!(target_os = "windows") {
        &["COM*"]
    } else if cfg!(target_os = "macos") {
        &[
            "/dev/cu.usbserial*",
            "/dev/cu.usbmodem*",
            "/dev/cu.SLAB_USBtoUART*",
        ]
    } else {
        &["/dev/ttyUSB*", "/dev/ttyACM*", "/dev/ttyS*"]
    }
}

/// Enumerates real ports through `serialport`.
#[cfg(feature = "serial")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

#[cfg(feature = "serial")]
impl PortEnumerator for SystemPorts {
    fn list_ports(&self) -> Result<Vec<PortCandidate>> {
        use serialport::SerialPortType;
        let ports = serialport::available_ports()?
            .into_iter()
            .map(|info| match info.port_type {
                SerialPortType::UsbPort(usb) => PortCandidate {
                    name: info.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    serial_number: usb.serial_number,
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                },
                _ => PortCandidate {
                    name: info.port_name,
                    ..Default::default()
                },
            })
            .collect();
        Ok(ports)
    }

    fn try_open(&self, name: &str, baud: u32) -> Result<()> {
        let port = serialport::new(name, baud)
            .timeout(Duration::from_millis(100))
            .open()?;
        drop(port);
        Ok(())
    }

    fn test_read(&self, name: &str, baud: u32, timeout: Duration) -> Result<()> {
        let mut port = serialport::new(name, baud).timeout(timeout).open()?;
        let mut buf = [0u8; 64];
        match std::io::Read::read(&mut port, &mut buf) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture(Vec<PortCandidate>);

    impl PortEnumerator for Fixture {
        fn list_ports(&self) -> Result<Vec<PortCandidate>> {
            Ok(self.0.clone())
        }
        fn try_open(&self, name: &str, _baud: u32) -> Result<()> {
            if name.contains("busy") {
                Err(MeshError::PortNotFound(name.into()))
            } else {
                Ok(())
            }
        }
        fn test_read(&self, _name: &str, _baud: u32, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    fn usb(name: &str, vid: u16, pid: u16) -> PortCandidate {
        PortCandidate {
            name: name.into(),
            vid: Some(vid),
            pid: Some(pid),
            ..Default::default()
        }
    }

    #[test]
    fn vendor_only_profile_matches_any_pid() {
        let mut cfg = DiscoveryConfig::default();
        cfg.devices.push(DeviceProfile::new("Espressif", "Espressif native USB", 0x303A, 0, 5));
        let d = Discovery::new(cfg, Box::new(Fixture(vec![usb("/dev/ttyACM3", 0x303A, 0x1001)])));
        let p = d.port_info("/dev/ttyACM3").unwrap();
        assert_eq!(p.device_type.as_deref(), Some("Espressif"));
        assert_eq!(p.priority, 5);
    }

    #[test]
    fn unopenable_ports_are_skipped() {
        let d = Discovery::new(
            DiscoveryConfig::default(),
            Box::new(Fixture(vec![
                usb("/dev/ttyUSB-busy", 0x10C4, 0xEA60),
                usb("/dev/ttyUSB1", 0x1A86, 0x7523),
            ])),
        );
        let all = d.find_all_ports().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].device_type.as_deref(), Some("CH340"));
        assert_eq!(all[0].to_string(), "/dev/ttyUSB1 (CH340 USB serial bridge)");
    }

    #[test]
    fn missing_port_info() {
        let d = Discovery::new(DiscoveryConfig::default(), Box::new(Fixture(vec![])));
        assert!(matches!(d.port_info("COM9"), Err(MeshError::PortNotFound(_))));
        assert!(matches!(d.find_best_port(), Err(MeshError::NoDeviceFound)));
    }

    #[test]
    fn patterns_are_not_empty() {
        assert!(!platform_port_patterns().is_empty());
    }
}
