//! Bluetooth Low Energy transport built on `bluest`.
//!
//! The pack exposes one GATT service with a write characteristic for
//! requests and a notify characteristic for everything it sends back.
//! Each notification becomes one [`LinkEvent::Frame`]; the manager does the
//! multi-frame reassembly, so notifications are not merged here.

use crate::transport::{event_channel, Link, LinkEvent, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use bluest::{Adapter, AdapterEvent, AdvertisingDevice, Characteristic, Device, Service, Uuid};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Service announced by the BMS module.
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
/// Characteristic requests are written to.
pub const DEFAULT_WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);
/// Characteristic the BMS answers on.
pub const DEFAULT_NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// GATT layout and discovery timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleSettings {
    pub service: Uuid,
    pub write_characteristic: Uuid,
    pub notify_characteristic: Uuid,
    pub scan_timeout: Duration,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE_UUID,
            write_characteristic: DEFAULT_WRITE_CHARACTERISTIC_UUID,
            notify_characteristic: DEFAULT_NOTIFY_CHARACTERISTIC_UUID,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }
}

pub struct BleTransport {
    adapter: Adapter,
    device: Device,
    write: Characteristic,
    notifications: JoinHandle<()>,
    power: JoinHandle<()>,
}

fn io_error(err: bluest::Error) -> Error {
    Error::Io(std::io::Error::other(err))
}

impl BleTransport {
    /// Scans for a peripheral advertising `name`, connects and subscribes
    /// to its notifications.
    ///
    /// Fails with [`Error::NotRecognizedDevice`] when the peripheral lacks
    /// the configured service or characteristics.
    pub async fn connect(name: &str, settings: &BleSettings) -> Result<Link> {
        let adapter = Adapter::default()
            .await
            .ok_or(Error::ConnectionUnavailable)?;
        adapter.wait_available().await.map_err(io_error)?;

        let device = tokio::time::timeout(
            settings.scan_timeout,
            discover_device(&adapter, name, settings.service),
        )
        .await
        .map_err(|_| {
            log::warn!("No device named {name} within {:?}", settings.scan_timeout);
            Error::Timeout
        })??;
        adapter.connect_device(&device).await.map_err(io_error)?;
        log::info!("Connected to {name}");

        let service = device
            .discover_services_with_uuid(settings.service)
            .await
            .map_err(io_error)?
            .first()
            .cloned()
            .ok_or_else(|| {
                Error::NotRecognizedDevice(format!("{name} lacks service {}", settings.service))
            })?;
        let write = characteristic(&service, settings.write_characteristic, name).await?;
        let notify = characteristic(&service, settings.notify_characteristic, name).await?;

        let (events, rx) = event_channel();
        let (subscribed_tx, subscribed_rx) = oneshot::channel();
        let notifications = tokio::spawn(forward_notifications(notify, events.clone(), subscribed_tx));
        // Requests written before the subscription exists would lose their answer.
        match subscribed_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = adapter.disconnect_device(&device).await;
                return Err(err);
            }
            Err(_) => return Err(Error::ConnectionUnavailable),
        }
        let power = tokio::spawn(watch_adapter(adapter.clone(), events));

        let transport = Arc::new(Self {
            adapter,
            device,
            write,
            notifications,
            power,
        });
        Ok(Link::new(transport, rx))
    }
}

async fn discover_device(adapter: &Adapter, name: &str, service: Uuid) -> Result<Device> {
    let mut scan = adapter.scan(&[service]).await.map_err(io_error)?;
    while let Some(AdvertisingDevice { device, .. }) = scan.next().await {
        match device.name_async().await {
            Ok(found) if found == name => return Ok(device),
            Ok(found) => log::trace!("Ignoring {found}"),
            Err(err) => log::trace!("Ignoring unnamed device: {err}"),
        }
    }
    Err(Error::ConnectionUnavailable)
}

async fn characteristic(service: &Service, uuid: Uuid, name: &str) -> Result<Characteristic> {
    service
        .discover_characteristics_with_uuid(uuid)
        .await
        .map_err(io_error)?
        .first()
        .cloned()
        .ok_or_else(|| Error::NotRecognizedDevice(format!("{name} lacks characteristic {uuid}")))
}

async fn forward_notifications(
    notify: Characteristic,
    events: UnboundedSender<LinkEvent>,
    subscribed: oneshot::Sender<Result<()>>,
) {
    let mut stream = match notify.notify().await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = subscribed.send(Err(io_error(err)));
            return;
        }
    };
    let _ = subscribed.send(Ok(()));
    while let Some(notification) = stream.next().await {
        match notification {
            Ok(data) => {
                if events.send(LinkEvent::Frame(data)).is_err() {
                    return;
                }
            }
            Err(err) => {
                log::warn!("Notification error: {err}");
                break;
            }
        }
    }
    log::debug!("Notification stream ended");
    let _ = events.send(LinkEvent::Disconnected);
}

async fn watch_adapter(adapter: Adapter, events: UnboundedSender<LinkEvent>) {
    let mut adapter_events = match adapter.events().await {
        Ok(adapter_events) => adapter_events,
        Err(err) => {
            log::debug!("Adapter events unavailable: {err}");
            return;
        }
    };
    while let Some(event) = adapter_events.next().await {
        if let Ok(AdapterEvent::Unavailable) = event {
            log::warn!("Bluetooth adapter switched off");
            let _ = events.send(LinkEvent::PoweredOff);
            return;
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn write(&self, frame: &[u8]) -> Result<()> {
        self.write
            .write(frame)
            .await
            .map_err(|err| Error::WriteFailed(err.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.notifications.abort();
        self.power.abort();
        self.adapter
            .disconnect_device(&self.device)
            .await
            .map_err(io_error)
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.notifications.abort();
        self.power.abort();
    }
}
