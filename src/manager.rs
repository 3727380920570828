//! Facade tying a [`Link`] to the codecs, the request queue and the caches.
//!
//! A [`BmsManager`] owns one connection. Inbound events are handled on a
//! dispatcher task: control frames complete the pending control request,
//! telemetry frames feed the [`ReadingDecoder`]. Completed readings and
//! state changes are published on `tokio::sync::watch` channels.

use crate::config::ManagerConfig;
use crate::control::{
    ControlCommand, ModuleIdControlData, ProtocolBus, ProtocolSelection, ResponseData,
    MODULE_ID_RANGE,
};
use crate::frame::{crc16_verify, hex_encode};
use crate::protocol::{FrameKind, TELEMETRY_REQUEST};
use crate::queue::{RequestOptions, RequestQueue};
use crate::reading::BmsReading;
use crate::reassembly::ReadingDecoder;
use crate::transport::{Link, LinkEvent, Transport};
use crate::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Link state as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConnectionState {
    Connected,
    Disconnected,
    /// The radio was switched off; behaves like [`ConnectionState::Disconnected`].
    PoweredOff,
}

/// Last known settings of the pack. Empty after a reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ControlCache {
    pub module_id: Option<ModuleIdControlData>,
    pub rs485: Option<ProtocolSelection>,
    pub can: Option<ProtocolSelection>,
}

impl ControlCache {
    pub fn selection(&self, bus: ProtocolBus) -> Option<&ProtocolSelection> {
        match bus {
            ProtocolBus::Rs485 => self.rs485.as_ref(),
            ProtocolBus::Can => self.can.as_ref(),
        }
    }

    fn selection_mut(&mut self, bus: ProtocolBus) -> &mut Option<ProtocolSelection> {
        match bus {
            ProtocolBus::Rs485 => &mut self.rs485,
            ProtocolBus::Can => &mut self.can,
        }
    }
}

/// One connection to a BMS.
///
/// Must be created inside a tokio runtime. Dropping the manager stops its
/// tasks but does not close the transport; call [`BmsManager::disconnect`]
/// for that.
pub struct BmsManager {
    shared: Arc<Shared>,
    queue: RequestQueue,
    dispatcher: JoinHandle<()>,
}

struct Shared {
    config: ManagerConfig,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    decoder: Mutex<ReadingDecoder>,
    pending_control: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    pending_readings: Mutex<Vec<oneshot::Sender<BmsReading>>>,
    readings: watch::Sender<Option<BmsReading>>,
    connection: watch::Sender<ConnectionState>,
    control: watch::Sender<ControlCache>,
    poller: Mutex<Option<JoinHandle<()>>>,
    polling_paused: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn transport(&self) -> Result<Arc<dyn Transport>> {
        lock(&self.transport)
            .clone()
            .ok_or(Error::ConnectionUnavailable)
    }

    fn is_connected(&self) -> bool {
        lock(&self.transport).is_some()
    }

    fn handle_frame(&self, frame: &[u8]) {
        log::trace!("RX {}", hex_encode(frame, false));
        if !self.is_connected() {
            log::debug!("Dropping frame received after disconnect");
            return;
        }
        if !crc16_verify(frame) {
            log::debug!("Dropping frame with bad CRC: {}", hex_encode(frame, false));
            return;
        }
        match FrameKind::classify(frame) {
            FrameKind::Control => match lock(&self.pending_control).take() {
                Some(responder) => {
                    if responder.send(frame.to_vec()).is_err() {
                        log::debug!("Control response arrived after its request gave up");
                    }
                }
                None => log::warn!("Unsolicited control frame: {}", hex_encode(frame, false)),
            },
            FrameKind::Telemetry | FrameKind::Continuation => {
                let reading = lock(&self.decoder).push(frame);
                if let Some(reading) = reading {
                    self.publish(reading);
                }
            }
            FrameKind::Unknown => {
                log::warn!("Dropping frame of unknown kind: {}", hex_encode(frame, false))
            }
        }
    }

    fn publish(&self, reading: BmsReading) {
        log::debug!(
            "Reading: {:.2} V, {:.1} A, SOC {} %, {} cells",
            reading.voltage,
            reading.current,
            reading.soc,
            reading.cell_count
        );
        for waiter in lock(&self.pending_readings).drain(..) {
            let _ = waiter.send(reading.clone());
        }
        self.readings.send_replace(Some(reading));
    }

    // Everything tied to the connection goes; nothing stale may leak into the next one.
    fn reset(&self, state: ConnectionState) {
        let was_connected = lock(&self.transport).take().is_some();
        lock(&self.decoder).reset();
        lock(&self.pending_control).take();
        lock(&self.pending_readings).clear();
        self.stop_polling();
        self.readings.send_replace(None);
        self.control.send_replace(ControlCache::default());
        self.connection.send_replace(state);
        if was_connected {
            log::info!("BMS link closed ({state:?})");
        }
    }

    // Checked under the cache lock: `reset` drops the transport before it
    // clears the cache, so an answer from a closed link is never stored.
    fn update_control(&self, update: impl FnOnce(&mut ControlCache)) -> bool {
        self.control.send_if_modified(|cache| {
            if !self.is_connected() {
                return false;
            }
            update(cache);
            true
        })
    }

    fn stop_polling(&self) {
        if let Some(poller) = lock(&self.poller).take() {
            poller.abort();
            log::debug!("Telemetry polling stopped");
        }
    }

    async fn request_reading(&self) -> Result<BmsReading> {
        let transport = self.transport()?;
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = lock(&self.pending_readings);
            waiters.retain(|waiter| !waiter.is_closed());
            waiters.push(tx);
        }
        log::trace!("TX {}", hex_encode(&TELEMETRY_REQUEST, false));
        transport.write(&TELEMETRY_REQUEST).await?;
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reading)) => Ok(reading),
            Ok(Err(_)) => Err(Error::ConnectionUnavailable),
            Err(_) => Err(Error::Timeout),
        }
    }

    // One write, then the next control frame. Deadline and retries are the queue's job.
    async fn round_trip(&self, command: ControlCommand, value: u8) -> Result<Vec<u8>> {
        let transport = self.transport()?;
        let request = command.request(value);
        let (tx, rx) = oneshot::channel();
        if lock(&self.pending_control).replace(tx).is_some() {
            log::debug!("Discarding stale control responder");
        }
        log::debug!("TX {command}: {}", hex_encode(&request, false));
        if let Err(err) = transport.write(&request).await {
            lock(&self.pending_control).take();
            return Err(err);
        }
        rx.await.map_err(|_| Error::ConnectionUnavailable)
    }
}

async fn dispatch(shared: Arc<Shared>, mut events: UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Frame(frame) => shared.handle_frame(&frame),
            LinkEvent::Disconnected => shared.reset(ConnectionState::Disconnected),
            LinkEvent::PoweredOff => shared.reset(ConnectionState::PoweredOff),
        }
    }
    log::debug!("Link event stream ended");
    if shared.is_connected() {
        shared.reset(ConnectionState::Disconnected);
    }
}

async fn poll(weak: Weak<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = weak.upgrade() else {
            break;
        };
        if shared.polling_paused.load(Ordering::Relaxed) {
            continue;
        }
        match shared.request_reading().await {
            Ok(_) => {}
            Err(Error::ConnectionUnavailable) => break,
            Err(err) => log::debug!("Telemetry poll failed: {err}"),
        }
    }
}

impl BmsManager {
    pub fn new(link: Link, config: ManagerConfig) -> Self {
        let Link { transport, events } = link;
        let queue = RequestQueue::new(config.request_spacing);
        let shared = Arc::new(Shared {
            config,
            transport: Mutex::new(Some(transport)),
            decoder: Mutex::new(ReadingDecoder::new()),
            pending_control: Mutex::new(None),
            pending_readings: Mutex::new(Vec::new()),
            readings: watch::Sender::new(None),
            connection: watch::Sender::new(ConnectionState::Connected),
            control: watch::Sender::new(ControlCache::default()),
            poller: Mutex::new(None),
            polling_paused: AtomicBool::new(false),
        });
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared), events));
        log::info!("BMS link opened");
        Self {
            shared,
            queue,
            dispatcher,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Requests one telemetry snapshot and waits until it is fully reassembled.
    ///
    /// Bypasses the request queue. Fails with [`Error::Timeout`] when no
    /// complete reading arrives within the request timeout.
    pub async fn get_bms_reading(&self) -> Result<BmsReading> {
        self.shared.request_reading().await
    }

    /// Most recent complete reading of this connection.
    pub fn last_reading(&self) -> Option<BmsReading> {
        self.shared.readings.borrow().clone()
    }

    pub async fn get_module_id(&self) -> Result<ModuleIdControlData> {
        if !self.is_connected() {
            return Err(Error::ConnectionUnavailable);
        }
        let cached = self.shared.control.borrow().module_id;
        if let Some(module_id) = cached {
            return Ok(module_id);
        }
        let module_id = self
            .queue_control(ControlCommand::GetModuleId, 0, ModuleIdControlData::decode)
            .await?;
        if !self
            .shared
            .update_control(|cache| cache.module_id = Some(module_id))
        {
            return Err(Error::ConnectionUnavailable);
        }
        Ok(module_id)
    }

    pub async fn get_rs485(&self) -> Result<ProtocolSelection> {
        self.get_protocol(ProtocolBus::Rs485).await
    }

    pub async fn get_can(&self) -> Result<ProtocolSelection> {
        self.get_protocol(ProtocolBus::Can).await
    }

    async fn get_protocol(&self, bus: ProtocolBus) -> Result<ProtocolSelection> {
        if !self.is_connected() {
            return Err(Error::ConnectionUnavailable);
        }
        let cached = self.shared.control.borrow().selection(bus).cloned();
        if let Some(selection) = cached {
            return Ok(selection);
        }
        let selection = self
            .queue_control(bus.get_command(), 0, move |frame: &[u8]| {
                ProtocolSelection::decode(bus, frame)
            })
            .await?;
        if !self.shared.update_control(|cache| {
            *cache.selection_mut(bus) = Some(selection.clone());
        }) {
            return Err(Error::ConnectionUnavailable);
        }
        Ok(selection)
    }

    /// Writes a new module ID. `Ok(false)` means the pack refused it.
    pub async fn set_module_id(&self, module_id: u8) -> Result<bool> {
        if !MODULE_ID_RANGE.contains(&module_id) {
            return Err(Error::RangeError);
        }
        let ack = self
            .queue_control(ControlCommand::SetModuleId, module_id, |frame: &[u8]| {
                ResponseData::decode(ControlCommand::SetModuleId, frame)
            })
            .await?;
        if ack.is_success() {
            self.shared
                .update_control(|cache| cache.module_id = Some(ModuleIdControlData { module_id }));
        } else {
            log::warn!("BMS rejected module ID {module_id} (code {})", ack.code);
        }
        Ok(ack.is_success())
    }

    /// Selects entry `index` of the RS485 protocol table.
    pub async fn set_rs485(&self, index: u8) -> Result<bool> {
        self.set_protocol(ProtocolBus::Rs485, index).await
    }

    /// Selects entry `index` of the CAN protocol table.
    pub async fn set_can(&self, index: u8) -> Result<bool> {
        self.set_protocol(ProtocolBus::Can, index).await
    }

    async fn set_protocol(&self, bus: ProtocolBus, index: u8) -> Result<bool> {
        let known = self
            .shared
            .control
            .borrow()
            .selection(bus)
            .map(|selection| selection.protocols.len());
        if known.is_some_and(|count| usize::from(index) >= count) {
            return Err(Error::RangeError);
        }
        let command = bus.set_command();
        let ack = self
            .queue_control(command, index, move |frame: &[u8]| {
                ResponseData::decode(command, frame)
            })
            .await?;
        if ack.is_success() {
            self.shared.update_control(|cache| {
                if let Some(selection) = cache.selection_mut(bus) {
                    selection.selected_index = index;
                }
            });
        } else {
            log::warn!("BMS rejected {bus} protocol {index} (code {})", ack.code);
        }
        Ok(ack.is_success())
    }

    fn queue_control<T, D>(
        &self,
        command: ControlCommand,
        value: u8,
        decode: D,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        D: Fn(&[u8]) -> Result<T> + Copy + Send + Sync + 'static,
    {
        let options = if command.is_set() {
            RequestOptions::set(&self.shared.config)
        } else {
            RequestOptions::get(&self.shared.config)
        };
        let shared = Arc::clone(&self.shared);
        self.queue
            .enqueue(&command.to_string(), options, move || {
                let shared = Arc::clone(&shared);
                async move {
                    let frame = shared.round_trip(command, value).await?;
                    decode(&frame)
                }
            })
    }

    /// Snapshot of the cached settings.
    pub fn control_data(&self) -> ControlCache {
        self.shared.control.borrow().clone()
    }

    /// Forgets the cached settings so the next getters hit the wire.
    pub fn refresh_control_data(&self) {
        log::debug!("Control data cache cleared");
        self.shared.control.send_replace(ControlCache::default());
    }

    /// Requests a reading every `interval`, replacing any running poller.
    pub fn start_polling(&self, interval: Duration) {
        self.shared.stop_polling();
        if !self.is_connected() {
            log::debug!("Not polling, BMS link is closed");
            return;
        }
        self.shared.polling_paused.store(false, Ordering::Relaxed);
        let poller = tokio::spawn(poll(Arc::downgrade(&self.shared), interval));
        *lock(&self.shared.poller) = Some(poller);
        log::debug!("Telemetry polling every {interval:?}");
    }

    /// Keeps the poller alive but skips its ticks.
    pub fn pause_polling(&self) {
        self.shared.polling_paused.store(true, Ordering::Relaxed);
    }

    pub fn resume_polling(&self) {
        self.shared.polling_paused.store(false, Ordering::Relaxed);
    }

    pub fn stop_polling(&self) {
        self.shared.stop_polling();
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.shared.poller).is_some() && !self.shared.polling_paused.load(Ordering::Relaxed)
    }

    pub fn subscribe_readings(&self) -> watch::Receiver<Option<BmsReading>> {
        self.shared.readings.subscribe()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.subscribe()
    }

    pub fn subscribe_control(&self) -> watch::Receiver<ControlCache> {
        self.shared.control.subscribe()
    }

    /// Resets all connection state, then closes the transport.
    pub async fn disconnect(&self) -> Result<()> {
        let transport = lock(&self.shared.transport).clone();
        self.shared.reset(ConnectionState::Disconnected);
        match transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for BmsManager {
    fn drop(&mut self) {
        self.shared.stop_polling();
        self.dispatcher.abort();
    }
}
