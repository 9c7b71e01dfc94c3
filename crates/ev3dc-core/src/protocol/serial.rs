//! Serial port handling
//!
//! Port discovery and opening for bricks paired over Bluetooth (SPP) or
//! attached by USB serial.

use regex::Regex;
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
#[cfg(target_os = "linux")]
use std::fs;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use super::{Ev3Error, Result, DEFAULT_BAUD_RATE};

/// A serial port as seen by the brick lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// e.g. "/dev/rfcomm0" or "COM3"
    pub name: String,
    /// USB vendor ID
    pub vid: Option<u16>,
    /// USB product ID
    pub pid: Option<u16>,
    /// USB manufacturer string
    pub manufacturer: Option<String>,
    /// USB product string
    pub product: Option<String>,
    /// Bluetooth and USB bricks report their ID in here
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb_info) => Self {
                name: info.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
                serial_number: usb_info.serial_number,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Port name prefixes a brick shows up under, most likely first
const BRICK_PORT_PREFIXES: [&str; 3] = ["rfcomm", "ttyACM", "ttyUSB"];

/// Ordering key: prefix rank, then port number, then name
fn port_rank(name: &str) -> (usize, usize, &str) {
    let base = name.rsplit('/').next().unwrap_or(name);
    BRICK_PORT_PREFIXES
        .iter()
        .enumerate()
        .find_map(|(rank, prefix)| {
            base.strip_prefix(prefix)
                .map(|n| (rank, n.parse().unwrap_or(usize::MAX), base))
        })
        .unwrap_or((BRICK_PORT_PREFIXES.len(), 0, base))
}

/// List serial ports a brick could be attached to
///
/// Bluetooth ports come first. On Linux, bound rfcomm nodes that the
/// enumeration API misses are picked up from /dev.
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();

    #[cfg(target_os = "linux")]
    ports.extend(dev_nodes().into_iter().map(PortInfo::bare));

    // Stable sort keeps enumerated entries, which carry USB details,
    // ahead of their bare /dev duplicates.
    ports.sort_by(|a, b| port_rank(&a.name).cmp(&port_rank(&b.name)));
    ports.dedup_by(|later, earlier| later.name == earlier.name);
    ports
}

#[cfg(target_os = "linux")]
fn dev_nodes() -> Vec<String> {
    let Ok(entries) = fs::read_dir("/dev") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| BRICK_PORT_PREFIXES.iter().any(|p| name.starts_with(p)))
        .map(|name| format!("/dev/{}", name))
        .collect()
}

/// Find the port a brick is attached to by its ID
///
/// The ID is the 12 hex digits shown under Settings > Brick Info. It is
/// matched as a whole token against the port's serial number, then its name.
pub fn find_brick_port<'a>(ports: &'a [PortInfo], brick_id: &str) -> Result<&'a PortInfo> {
    if brick_id.is_empty() || !brick_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Ev3Error::validation(format!(
            "brick ID {:?} must be hexadecimal",
            brick_id
        )));
    }

    let pattern = format!(
        r"(?i)(?:^|[^0-9a-f]){}(?:[^0-9a-f]|$)",
        regex::escape(brick_id)
    );
    let re = Regex::new(&pattern).map_err(|e| Ev3Error::validation(e.to_string()))?;

    ports
        .iter()
        .find(|p| {
            p.serial_number.as_deref().is_some_and(|s| re.is_match(s)) || re.is_match(&p.name)
        })
        .ok_or_else(|| Ev3Error::PortNotFound(format!("no port for brick {}", brick_id)))
}

/// Open a serial port for async I/O
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<SerialStream> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    let mut stream = tokio_serial::new(name, baud).open_native_async()?;
    configure_port(&mut stream)?;
    clear_buffers(&mut stream)?;
    debug!("opened {} at {} baud", name, baud);
    Ok(stream)
}

/// Put a port into 8N1 without flow control
pub fn configure_port(port: &mut dyn SerialPort) -> Result<()> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    // Bluetooth SPP ports often refuse modem lines; that is harmless.
    if let Err(e) = port.write_data_terminal_ready(true) {
        debug!("configure_port: failed to set DTR high: {} (continuing)", e);
    }

    Ok(())
}

/// Drop whatever a previous session left in the port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<()> {
    port.clear(serialport::ClearBuffer::All)?;
    Ok(())
}
