use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use meshlink::meshtastic::discovery::{
    DiscoveryConfig, PortCandidate, PortEnumerator, SCORE_UNKNOWN, SCORE_WHITELISTED,
};
use meshlink::meshtastic::{Discovery, MeshError, Result};

struct Fixture(Vec<PortCandidate>);

impl PortEnumerator for Fixture {
    fn list_ports(&self) -> Result<Vec<PortCandidate>> {
        Ok(self.0.clone())
    }
    fn try_open(&self, _name: &str, _baud: u32) -> Result<()> {
        Ok(())
    }
    fn test_read(&self, name: &str, _baud: u32, _timeout: Duration) -> Result<()> {
        if name.starts_with("COM") {
            Err(MeshError::Timeout("read"))
        } else {
            Ok(())
        }
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

fn plain(name: &str) -> PortCandidate {
    PortCandidate {
        name: name.into(),
        ..Default::default()
    }
}

fn discovery(ports: Vec<PortCandidate>) -> Discovery {
    Discovery::new(DiscoveryConfig::default(), Box::new(Fixture(ports)))
}

#[test]
fn known_boards_rank_before_generic_bridges() {
    let d = discovery(vec![
        usb("/dev/ttyUSB2", 0x0403, 0x6001),
        usb("/dev/ttyACM0", 0x239A, 0x8029),
        usb("/dev/ttyUSB1", 0x1A86, 0x7523),
    ]);
    let ports = d.find_meshtastic_ports().unwrap();
    let names: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["/dev/ttyACM0", "/dev/ttyUSB1", "/dev/ttyUSB2"]);
    assert_eq!(ports[0].device_type.as_deref(), Some("RAK4631"));

    let result = d.discover().unwrap();
    assert!(result.multiple_found);
    assert_eq!(result.best_port.map(|p| p.name), Some("/dev/ttyACM0".to_string()));
}

#[test]
fn blacklisted_debuggers_are_never_picked() {
    let d = discovery(vec![
        usb("/dev/ttyACM0", 0x1366, 0x0105),
        usb("/dev/ttyUSB0", 0x10C4, 0xEA60),
    ]);
    let ports = d.find_meshtastic_ports().unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].name, "/dev/ttyUSB0");
    assert!(ports[0].whitelisted);
}

#[test]
fn unknown_ports_are_a_fallback_only() {
    let d = discovery(vec![plain("/dev/ttyS0"), usb("/dev/ttyACM7", 0x2E8A, 0x000A)]);
    let ports = d.find_meshtastic_ports().unwrap();
    assert_eq!(ports.len(), 2);
    assert!(ports.iter().all(|p| p.priority == SCORE_UNKNOWN));
    // Equal priority keeps enumeration order.
    assert_eq!(ports[0].name, "/dev/ttyS0");
    assert_eq!(ports[0].description, "Serial port");
    assert_eq!(ports[1].description, "USB serial device");
}

#[test]
fn whitelisted_vendor_without_profile() {
    let d = discovery(vec![usb("/dev/ttyACM1", 0x303A, 0x1001)]);
    let best = d.find_best_port().unwrap();
    assert_eq!(best.priority, SCORE_WHITELISTED);
    assert!(best.device_type.is_none());
}

#[cfg(target_os = "linux")]
#[test]
fn shared_bridge_ids_prefer_profile_for_path() {
    let mut cfg = DiscoveryConfig::default();
    // Make the native-USB profile share the CP210x ids so only the path decides.
    cfg.devices[0].vid = 0x10C4;
    cfg.devices[0].pid = 0xEA60;
    let d = Discovery::new(cfg, Box::new(Fixture(vec![usb("/dev/ttyACM0", 0x10C4, 0xEA60)])));
    let p = d.port_info("/dev/ttyACM0").unwrap();
    assert_eq!(p.device_type.as_deref(), Some("RAK4631"));

    let p = d.classify(usb("/dev/ttyUSB0", 0x10C4, 0xEA60));
    assert_eq!(p.device_type.as_deref(), Some("Heltec V2"));
}

#[test]
fn custom_table_from_toml() {
    let toml = r#"
        whitelist_vids = [0x2E8A]
        blacklist_vids = []

        [[devices]]
        name = "Pico"
        description = "RP2040 radio"
        vid = 0x2E8A
        priority = 4
    "#;
    let cfg: DiscoveryConfig = toml::from_str(toml).unwrap();
    assert_eq!(cfg.check_baud, 115_200);
    let d = Discovery::new(cfg, Box::new(Fixture(vec![usb("/dev/ttyACM0", 0x2E8A, 0x000A)])));
    let best = d.find_best_port().unwrap();
    assert_eq!(best.device_type.as_deref(), Some("Pico"));
    assert_eq!(best.priority, 4);
}

#[test]
fn read_check_is_delegated() {
    let d = discovery(vec![]);
    assert!(d.test_port_connection("/dev/ttyUSB0").is_ok());
    assert!(d.test_port_connection("COM3").is_err());
}

#[tokio::test]
async fn waiting_for_absent_device_times_out() {
    let d = discovery(vec![]);
    let err = d
        .wait_for_device(Duration::from_millis(50), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Timeout(_)));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = d
        .wait_for_device(Duration::from_secs(5), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Cancelled));
}

/// Port list that can change while a watch is running.
struct Hotplug(Arc<Mutex<Vec<PortCandidate>>>);

impl PortEnumerator for Hotplug {
    fn list_ports(&self) -> Result<Vec<PortCandidate>> {
        Ok(self.0.lock().unwrap().clone())
    }
    fn try_open(&self, _name: &str, _baud: u32) -> Result<()> {
        Ok(())
    }
    fn test_read(&self, _name: &str, _baud: u32, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

#[test]
fn device_presence_follows_enumeration() {
    let d = discovery(vec![usb("/dev/ttyACM0", 0x239A, 0x8029)]);
    assert!(d.is_device_connected("/dev/ttyACM0").unwrap());
    assert!(!d.is_device_connected("/dev/ttyACM1").unwrap());
}

async fn next(rx: &mut tokio::sync::mpsc::UnboundedReceiver<bool>) -> Option<bool> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no presence change")
}

#[tokio::test]
async fn watch_reports_unplug_and_replug() {
    let ports = Arc::new(Mutex::new(vec![usb("/dev/ttyACM0", 0x239A, 0x8029)]));
    let d = Arc::new(Discovery::new(
        DiscoveryConfig::default(),
        Box::new(Hotplug(ports.clone())),
    ));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let watch = {
        let d = d.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            d.monitor_device_connection("/dev/ttyACM0", Duration::from_millis(10), &cancel, |up| {
                let _ = tx.send(up);
            })
            .await
        })
    };

    assert_eq!(next(&mut rx).await, Some(true));
    ports.lock().unwrap().clear();
    assert_eq!(next(&mut rx).await, Some(false));
    ports.lock().unwrap().push(usb("/dev/ttyACM0", 0x239A, 0x8029));
    assert_eq!(next(&mut rx).await, Some(true));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), watch)
        .await
        .expect("watch ignored cancel")
        .unwrap();
}
