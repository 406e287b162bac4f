//! Byte-stream transports.
//!
//! The connection only needs a blocking byte pipe: reads bounded by the transport's own
//! timeout, writes, and a cloned handle so the reader can run on its own thread while
//! the writer keeps the original. The serial port is the production transport;
//! [`PipeTransport`] is an in-memory stand-in that lets a fake radio drive the
//! connection in tests.
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::lock;

pub trait Transport: Send {
    /// Blocking read. `TimedOut`, `WouldBlock` and `Interrupted` mean "nothing yet";
    /// `Ok(0)` means the other end went away.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;
    fn name(&self) -> &str;
}

/// True for read errors that only mean no data arrived within the timeout.
pub fn is_idle_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialSettings {
    /// Device path. Empty means "discover one".
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// `none`, `odd` or `even`.
    pub parity: String,
    pub read_timeout_ms: u64,
    /// Keep DTR asserted when the port closes so the radio does not reset.
    pub disable_hupcl: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
            read_timeout_ms: 500,
            disable_hupcl: true,
        }
    }
}

impl SerialSettings {
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }
}

#[cfg(feature = "serial")]
pub use self::serial::SerialTransport;

#[cfg(feature = "serial")]
mod serial {
    use super::*;
    use crate::meshtastic::error::{MeshError, Result};
    use log::{debug, warn};
    use serialport::SerialPort;
    use std::io::Read;

    pub struct SerialTransport {
        name: String,
        port: Box<dyn SerialPort>,
    }

    impl SerialTransport {
        /// Open and prepare the port: line settings, DTR/RTS asserted, short settle.
        pub fn open(settings: &SerialSettings) -> Result<Self> {
            if settings.port.is_empty() {
                return Err(MeshError::InvalidConfig("serial port not set".into()));
            }
            debug!(
                "Opening serial port {} at {} baud",
                settings.port, settings.baud_rate
            );
            let builder = serialport::new(&settings.port, settings.baud_rate)
                .timeout(Duration::from_millis(settings.read_timeout_ms))
                .data_bits(data_bits(settings.data_bits)?)
                .stop_bits(stop_bits(settings.stop_bits)?)
                .parity(parity(&settings.parity)?)
                .flow_control(serialport::FlowControl::None);

            let mut port = open_port(builder, settings)?;

            let _ = port.write_data_terminal_ready(true);
            let _ = port.write_request_to_send(true);
            std::thread::sleep(Duration::from_millis(100));

            // Drop boot chatter that arrived before we were listening.
            let _ = port.clear(serialport::ClearBuffer::Input);

            debug!("Serial port {} ready", settings.port);
            Ok(Self {
                name: settings.port.clone(),
                port,
            })
        }
    }

    #[cfg(unix)]
    fn open_port(
        builder: serialport::SerialPortBuilder,
        settings: &SerialSettings,
    ) -> Result<Box<dyn SerialPort>> {
        use std::os::unix::io::AsRawFd;
        let port = builder.open_native()?;
        if settings.disable_hupcl {
            if let Err(e) = clear_hupcl(port.as_raw_fd()) {
                warn!(
                    "Could not disable HUPCL on {}: {} (radio may reset on close)",
                    settings.port, e
                );
            }
        }
        Ok(Box::new(port))
    }

    #[cfg(not(unix))]
    fn open_port(
        builder: serialport::SerialPortBuilder,
        settings: &SerialSettings,
    ) -> Result<Box<dyn SerialPort>> {
        if settings.disable_hupcl {
            warn!("HUPCL control is not available on this platform");
        }
        Ok(builder.open()?)
    }

    #[cfg(unix)]
    fn clear_hupcl(fd: std::os::unix::io::RawFd) -> io::Result<()> {
        // SAFETY: fd belongs to the port we just opened and outlives this call.
        unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut tio) != 0 {
                return Err(io::Error::last_os_error());
            }
            tio.c_cflag &= !libc::HUPCL;
            if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn data_bits(n: u8) -> Result<serialport::DataBits> {
        Ok(match n {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => {
                return Err(MeshError::InvalidConfig(format!(
                    "unsupported data bits {}",
                    other
                )))
            }
        })
    }

    fn stop_bits(n: u8) -> Result<serialport::StopBits> {
        Ok(match n {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => {
                return Err(MeshError::InvalidConfig(format!(
                    "unsupported stop bits {}",
                    other
                )))
            }
        })
    }

    fn parity(p: &str) -> Result<serialport::Parity> {
        Ok(match p.to_ascii_lowercase().as_str() {
            "none" | "n" => serialport::Parity::None,
            "odd" | "o" => serialport::Parity::Odd,
            "even" | "e" => serialport::Parity::Even,
            other => {
                return Err(MeshError::InvalidConfig(format!(
                    "unsupported parity {}",
                    other
                )))
            }
        })
    }

    impl Transport for SerialTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.port.read(buf)
        }

        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            io::Write::write_all(&mut self.port, data)
        }

        fn flush(&mut self) -> io::Result<()> {
            io::Write::flush(&mut self.port)
        }

        fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
            let port = self
                .port
                .try_clone()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            Ok(Box::new(SerialTransport {
                name: self.name.clone(),
                port,
            }))
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}

const PIPE_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// In-memory transport. Bytes fed through the paired [`PipeRemote`] come out of
/// `read`; everything written shows up at the remote.
pub struct PipeTransport {
    name: String,
    inbound: Arc<Mutex<std_mpsc::Receiver<Vec<u8>>>>,
    leftover: Arc<Mutex<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

/// Device side of a [`PipeTransport`].
pub struct PipeRemote {
    feed_tx: Mutex<Option<std_mpsc::Sender<Vec<u8>>>>,
    written_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl PipeTransport {
    pub fn pair(name: impl Into<String>) -> (Self, PipeRemote) {
        let (feed_tx, feed_rx) = std_mpsc::channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                name: name.into(),
                inbound: Arc::new(Mutex::new(feed_rx)),
                leftover: Arc::new(Mutex::new(Vec::new())),
                outbound: out_tx,
                closed: closed.clone(),
            },
            PipeRemote {
                feed_tx: Mutex::new(Some(feed_tx)),
                written_rx: out_rx,
                closed,
            },
        )
    }
}

impl Transport for PipeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut leftover = lock(&self.leftover);
        if leftover.is_empty() {
            let chunk = {
                let rx = lock(&self.inbound);
                match rx.recv_timeout(PIPE_READ_TIMEOUT) {
                    Ok(chunk) => chunk,
                    Err(std_mpsc::RecvTimeoutError::Timeout) => {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe read timeout"))
                    }
                    Err(std_mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
                }
            };
            *leftover = chunk;
        }
        let n = leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&leftover[..n]);
        leftover.drain(..n);
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        self.outbound
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(PipeTransport {
            name: self.name.clone(),
            inbound: self.inbound.clone(),
            leftover: self.leftover.clone(),
            outbound: self.outbound.clone(),
            closed: self.closed.clone(),
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl PipeRemote {
    /// Deliver bytes as if the device had sent them. Ignored after `hang_up`.
    pub fn feed(&self, data: &[u8]) {
        if let Some(tx) = lock(&self.feed_tx).as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Simulate the cable being pulled: reads return EOF, writes fail.
    pub fn hang_up(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.feed_tx).take();
    }

    /// Next chunk written by the host, or `None` once every transport clone is gone.
    pub async fn next_write(&mut self) -> Option<Vec<u8>> {
        self.written_rx.recv().await
    }

    pub fn try_next_write(&mut self) -> Option<Vec<u8>> {
        self.written_rx.try_recv().ok()
    }
}
