//! Serial transport for a BMS reached through an RS485 adapter, built on
//! Tokio and the `tokio-serial` crate.
//!
//! The port is opened with 9600 8N1. Serial lines carry no notification
//! boundaries, so inbound bytes are cut into frames at idle gaps: once the
//! line stays quiet for [`DEFAULT_IDLE_GAP`], whatever arrived so far is
//! delivered as one [`LinkEvent::Frame`].
//!
//! # Example
//!
//! ```no_run
//! use zetarabms_lib::tokio_serial_async::SerialTransport;
//! use zetarabms_lib::{BmsManager, ManagerConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), zetarabms_lib::Error> {
//!     let link = SerialTransport::open("/dev/ttyUSB0", Duration::from_secs(5))?;
//!     let bms = BmsManager::new(link, ManagerConfig::default());
//!
//!     let reading = bms.get_bms_reading().await?;
//!     println!("SOC: {} %", reading.soc);
//!
//!     let module_id = bms.get_module_id().await?;
//!     println!("Module: {}", module_id.readable_id());
//!
//!     bms.disconnect().await
//! }
//! ```

use crate::transport::{event_channel, Link, LinkEvent, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Quiet time on the line that terminates an inbound frame.
pub const DEFAULT_IDLE_GAP: Duration = Duration::from_millis(50);

const READ_BUFFER_SIZE: usize = 256;

/// Write half of an open serial port. The read half lives on a background task.
pub struct SerialTransport {
    writer: Mutex<WriteHalf<SerialStream>>,
    reader: JoinHandle<()>,
    io_timeout: Duration,
}

impl SerialTransport {
    /// Opens `port` and starts delivering inbound frames.
    ///
    /// `io_timeout` bounds every single write.
    pub fn open(port: &str, io_timeout: Duration) -> Result<Link> {
        Self::open_with_idle_gap(port, io_timeout, DEFAULT_IDLE_GAP)
    }

    pub fn open_with_idle_gap(port: &str, io_timeout: Duration, idle_gap: Duration) -> Result<Link> {
        let serial = tokio_serial::new(port, 9600)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(std::io::Error::from)?;
        log::info!("Opened serial port {port}");

        let (reader, writer) = tokio::io::split(serial);
        let (events, rx) = event_channel();
        let reader = tokio::spawn(read_frames(reader, events, idle_gap));
        let transport = Arc::new(Self {
            writer: Mutex::new(writer),
            reader,
            io_timeout,
        });
        Ok(Link::new(transport, rx))
    }
}

async fn read_frames(
    mut reader: ReadHalf<SerialStream>,
    events: UnboundedSender<LinkEvent>,
    idle_gap: Duration,
) {
    let mut frame = Vec::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        let read = if frame.is_empty() {
            Ok(reader.read(&mut buffer).await)
        } else {
            tokio::time::timeout(idle_gap, reader.read(&mut buffer)).await
        };
        match read {
            Ok(Ok(0)) => {
                log::warn!("Serial port reached end of stream");
                break;
            }
            Ok(Ok(n)) => frame.extend_from_slice(&buffer[..n]),
            Ok(Err(err)) => {
                log::error!("Serial read failed: {err}");
                break;
            }
            Err(_) => {
                log::trace!("Line idle, frame of {} bytes complete", frame.len());
                if events.send(LinkEvent::Frame(std::mem::take(&mut frame))).is_err() {
                    return;
                }
            }
        }
    }
    let _ = events.send(LinkEvent::Disconnected);
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.io_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Error::WriteFailed(err.to_string())),
            Err(_) => Err(Error::WriteFailed(format!(
                "no progress within {:?}",
                self.io_timeout
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        log::debug!("Serial port closed");
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
