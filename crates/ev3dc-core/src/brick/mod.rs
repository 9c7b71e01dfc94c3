//! Brick connection and command catalog
//!
//! [`Brick`] owns a [`ProtocolSession`] and turns a handful of firmware
//! operations into typed methods. It knows opcodes and parameter lists;
//! everything about the wire format stays in [`crate::protocol`].

mod config;
pub mod opcodes;

pub use config::{ConnectionConfig, SUPPORTED_FIRMWARE};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::task::JoinHandle;
use tokio_serial::SerialStream;
use tracing::{info, warn};

use crate::protocol::{
    find_brick_port, list_ports, open_port, DecodedValue, Ev3Error, Parameter, Pointer,
    ProtocolSession, Result, Value,
};

/// Length of the version and name strings the firmware returns
const NAME_LENGTH: u16 = 30;

/// Length of a folder name buffer
const FOLDER_NAME_LENGTH: u16 = 64;

/// Button backlight color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedColor {
    /// Light off; the pattern is ignored
    Off,
    /// Green
    Green,
    /// Red
    Red,
    /// Orange
    Orange,
}

/// Button backlight effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedPattern {
    /// Steady light
    #[default]
    Still,
    /// Blinking
    Flash,
    /// Heartbeat pulse
    Pulse,
}

impl LedColor {
    /// Firmware LED code for this color and pattern
    pub fn code(self, pattern: LedPattern) -> u8 {
        let base = match self {
            LedColor::Off => return 0,
            LedColor::Green => 1,
            LedColor::Red => 2,
            LedColor::Orange => 3,
        };
        base + match pattern {
            LedPattern::Still => 0,
            LedPattern::Flash => 3,
            LedPattern::Pulse => 6,
        }
    }
}

/// A connected EV3 brick
pub struct Brick<W = WriteHalf<SerialStream>> {
    session: ProtocolSession<W>,
    reader_task: Mutex<Option<JoinHandle<Result<()>>>>,
    connected: AtomicBool,
}

impl Brick {
    /// Open the configured port and verify the brick answers
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let port_name = match (&config.port_name, &config.brick_id) {
            (Some(name), _) => name.clone(),
            (None, Some(id)) => find_brick_port(&list_ports(), id)?.name.clone(),
            (None, None) => {
                return Err(Ev3Error::Config(
                    "either port_name or brick_id must be set".to_string(),
                ))
            }
        };

        let stream = open_port(&port_name, Some(config.baud_rate))?;
        info!("connecting to brick on {}", port_name);

        let brick = Brick::from_stream(stream, config);
        if let Err(e) = brick.check_firmware(config).await {
            // Release the port so a retry can open it again.
            if let Err(close) = brick.disconnect().await {
                warn!("error while closing {}: {}", port_name, close);
            }
            return Err(e);
        }
        Ok(brick)
    }

    /// Connect to a brick on a known port
    pub async fn connect_by_port(port_name: &str) -> Result<Self> {
        Self::connect(&ConnectionConfig::for_port(port_name)).await
    }

    /// Connect to a brick located by its ID
    pub async fn connect_by_id(brick_id: &str) -> Result<Self> {
        Self::connect(&ConnectionConfig::for_brick_id(brick_id)).await
    }
}

impl<S> Brick<WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an already open duplex stream
    pub fn from_stream(stream: S, config: &ConnectionConfig) -> Self {
        let (session, reader_task) = ProtocolSession::over(stream, config.session_config());
        Self {
            session,
            reader_task: Mutex::new(Some(reader_task)),
            connected: AtomicBool::new(true),
        }
    }
}

impl<W> Brick<W>
where
    W: AsyncWrite + Unpin,
{
    /// Query the firmware version and warn when it is not the expected one
    ///
    /// Fails when the brick does not answer within the connect timeout.
    pub async fn check_firmware(&self, config: &ConnectionConfig) -> Result<String> {
        let version = tokio::time::timeout(config.connect_timeout(), self.firmware_version())
            .await
            .map_err(|_| Ev3Error::ConnectTimeout(config.connect_timeout_ms))??;

        if version != config.expected_firmware {
            warn!(
                "firmware {} differs from tested {}; some commands may misbehave",
                version, config.expected_firmware
            );
        } else {
            info!("brick firmware {}", version);
        }
        Ok(version)
    }

    /// Underlying session, for commands not in the catalog
    pub fn session(&self) -> &ProtocolSession<W> {
        &self.session
    }

    /// False once [`Brick::disconnect`] has run
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the transport and stop reading replies
    pub async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let shutdown = self.session.shutdown().await;
        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        info!("disconnected from brick");
        shutdown
    }

    /// Send a raw Direct Command and wait for its values
    pub async fn send_request(&self, params: &[Parameter]) -> Result<Vec<DecodedValue>> {
        if !self.is_connected() {
            return Err(Ev3Error::NotConnected);
        }
        self.session.request(params).await
    }

    /// Send a raw Direct Command without waiting for a reply
    pub async fn send_command(&self, params: &[Parameter]) -> Result<()> {
        if !self.is_connected() {
            return Err(Ev3Error::NotConnected);
        }
        self.session.command(params).await
    }

    /// Round-trip an empty command
    pub async fn do_nothing(&self) -> Result<()> {
        self.send_request(&[Parameter::Byte(opcodes::NOP)]).await?;
        Ok(())
    }

    /// Battery current in amperes
    pub async fn battery_current(&self) -> Result<f32> {
        let values = self
            .send_request(&[
                opcodes::UI_READ.into(),
                opcodes::ui_read::GET_IBATT.into(),
                Pointer::global_float().into(),
            ])
            .await?;
        float_at(&values, 0)
    }

    /// Battery voltage in volts
    pub async fn battery_voltage(&self) -> Result<f32> {
        let values = self
            .send_request(&[
                opcodes::UI_READ.into(),
                opcodes::ui_read::GET_VBATT.into(),
                Pointer::global_float().into(),
            ])
            .await?;
        float_at(&values, 0)
    }

    /// Battery level in percent
    pub async fn battery_percent(&self) -> Result<i32> {
        let values = self
            .send_request(&[
                opcodes::UI_READ.into(),
                opcodes::ui_read::GET_LBATT.into(),
                Pointer::global_int(1).into(),
            ])
            .await?;
        int_at(&values, 0)
    }

    /// Name shown on the brick's screen
    pub async fn brick_name(&self) -> Result<String> {
        self.read_string(opcodes::COM_GET, opcodes::com_get::GET_BRICKNAME)
            .await
    }

    /// Firmware version, e.g. "V1.09H"
    pub async fn firmware_version(&self) -> Result<String> {
        self.read_string(opcodes::UI_READ, opcodes::ui_read::GET_FW_VERS)
            .await
    }

    /// Hardware revision
    pub async fn hardware_version(&self) -> Result<String> {
        self.read_string(opcodes::UI_READ, opcodes::ui_read::GET_HW_VERS)
            .await
    }

    /// Linux kernel version string
    pub async fn os_version(&self) -> Result<String> {
        self.read_string(opcodes::UI_READ, opcodes::ui_read::GET_OS_VERS)
            .await
    }

    /// Total size of a file or folder in kB
    pub async fn file_size(&self, path: &str) -> Result<i32> {
        let values = self
            .send_request(&[
                opcodes::FILENAME.into(),
                opcodes::filename::TOTALSIZE.into(),
                path.into(),
                // file count, then size
                Pointer::global_int(4).into(),
                Pointer::global_int(4).into(),
            ])
            .await?;
        int_at(&values, 1)
    }

    /// Whether `path` exists on the brick
    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        let values = self
            .send_request(&[
                opcodes::FILENAME.into(),
                opcodes::filename::EXIST.into(),
                path.into(),
                Pointer::global_int(1).into(),
            ])
            .await?;
        Ok(int_at(&values, 0)? == 1)
    }

    /// Number of subfolders directly under `path`
    pub async fn subfolder_count(&self, path: &str) -> Result<i32> {
        let values = self
            .send_request(&[
                opcodes::FILE.into(),
                opcodes::file::GET_FOLDERS.into(),
                path.into(),
                Pointer::global_int(1).into(),
            ])
            .await?;
        int_at(&values, 0)
    }

    /// Name of the `index`-th subfolder, counting from 1
    pub async fn subfolder_name(&self, path: &str, index: u8) -> Result<String> {
        let values = self
            .send_request(&[
                opcodes::FILE.into(),
                opcodes::file::GET_SUBFOLDER_NAME.into(),
                path.into(),
                Parameter::number(1, index as i64),
                Parameter::number(1, FOLDER_NAME_LENGTH as i64),
                Pointer::global_string(FOLDER_NAME_LENGTH).into(),
            ])
            .await?;
        string_at(values, 0)
    }

    /// Names of all subfolders of `path`
    pub async fn subfolders(&self, path: &str) -> Result<Vec<String>> {
        let count = self.subfolder_count(path).await?;
        let mut names = Vec::with_capacity(count.max(0) as usize);
        for i in 1..=count {
            let index = u8::try_from(i).map_err(|_| {
                Ev3Error::protocol(format!("folder reports {} subfolders", count))
            })?;
            names.push(self.subfolder_name(path, index).await?);
        }
        Ok(names)
    }

    /// Set the button backlight
    pub async fn set_button_light(&self, color: LedColor, pattern: LedPattern) -> Result<()> {
        self.send_request(&[
            opcodes::UI_WRITE.into(),
            opcodes::ui_write::LED.into(),
            Parameter::number(1, color.code(pattern) as i64),
        ])
        .await?;
        Ok(())
    }

    /// Set the sound volume, 0-100 %
    pub async fn set_volume(&self, percent: u8) -> Result<()> {
        if percent > 100 {
            return Err(Ev3Error::Validation(format!(
                "volume {} out of range 0..=100",
                percent
            )));
        }
        self.send_request(&[
            opcodes::INFO.into(),
            opcodes::info::SET_VOLUME.into(),
            Parameter::number(1, percent as i64),
        ])
        .await?;
        Ok(())
    }

    async fn read_string(&self, opcode: u8, subcode: u8) -> Result<String> {
        let values = self
            .send_request(&[
                opcode.into(),
                subcode.into(),
                Parameter::short(NAME_LENGTH as i64),
                Pointer::global_string(NAME_LENGTH).into(),
            ])
            .await?;
        string_at(values, 0)
    }
}

impl<W> Drop for Brick<W> {
    fn drop(&mut self) {
        // The read loop owns the read half and would keep the port open.
        if let Some(task) = self
            .reader_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Disconnect `brick` when the process receives Ctrl-C
///
/// Applications opt into this; the library never installs signal handlers
/// on its own.
pub fn shutdown_on_ctrl_c<W>(brick: Arc<Brick<W>>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, closing brick connection");
            if let Err(e) = brick.disconnect().await {
                warn!("error while disconnecting: {}", e);
            }
        }
    })
}

fn value_at(values: &[DecodedValue], n: usize) -> Result<&Value> {
    values
        .get(n)
        .map(|v| &v.value)
        .ok_or_else(|| Ev3Error::protocol(format!("reply carries no value #{}", n)))
}

fn int_at(values: &[DecodedValue], n: usize) -> Result<i32> {
    value_at(values, n)?
        .as_int()
        .ok_or_else(|| Ev3Error::protocol(format!("value #{} is not an integer", n)))
}

fn float_at(values: &[DecodedValue], n: usize) -> Result<f32> {
    value_at(values, n)?
        .as_float()
        .ok_or_else(|| Ev3Error::protocol(format!("value #{} is not a float", n)))
}

fn string_at(mut values: Vec<DecodedValue>, n: usize) -> Result<String> {
    if n >= values.len() {
        return Err(Ev3Error::protocol(format!("reply carries no value #{}", n)));
    }
    match values.swap_remove(n).value {
        Value::Str(s) => Ok(s),
        _ => Err(Ev3Error::protocol(format!("value #{} is not a string", n))),
    }
}
