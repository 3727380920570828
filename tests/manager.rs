use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use zetarabms_lib::frame::{crc16, hex_decode};
use zetarabms_lib::protocol::{CELLS_PER_FRAME, FUNCTION_CONTINUATION, TELEMETRY_REQUEST};
use zetarabms_lib::transport::event_channel;
use zetarabms_lib::{
    BmsManager, ConnectionState, ControlCache, Error, Link, LinkEvent, ManagerConfig, Result,
    Transport,
};

const TELEMETRY_FRAME: &str = "01034e053200000cfe0cff0cff0d01000000000000000000000000000000000000000000000000000f00000010005d00640064005e00000000000000000003000015752a00101000000000000403e8000075da";

type Responder = dyn Fn(usize, &[u8]) -> Vec<Vec<u8>> + Send + Sync;

/// In-memory link: records every write and answers through `responder`.
struct ScriptedTransport {
    writes: Mutex<Vec<(Instant, Vec<u8>)>>,
    events: UnboundedSender<LinkEvent>,
    responder: Box<Responder>,
    /// Drop the link right after answering the write with this index.
    hang_up_after: Option<usize>,
}

impl ScriptedTransport {
    fn writes(&self) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    fn telemetry_requests(&self) -> usize {
        self.writes()
            .iter()
            .filter(|frame| frame.as_slice() == TELEMETRY_REQUEST.as_slice())
            .count()
    }

    fn push(&self, event: LinkEvent) {
        self.events.send(event).unwrap();
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn write(&self, frame: &[u8]) -> Result<()> {
        let index = {
            let mut writes = self.writes.lock().unwrap();
            writes.push((Instant::now(), frame.to_vec()));
            writes.len() - 1
        };
        for response in (self.responder)(index, frame) {
            let _ = self.events.send(LinkEvent::Frame(response));
        }
        if self.hang_up_after == Some(index) {
            let _ = self.events.send(LinkEvent::Disconnected);
        }
        Ok(())
    }
}

fn connect<R>(responder: R) -> (BmsManager, Arc<ScriptedTransport>)
where
    R: Fn(usize, &[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
{
    connect_scripted(responder, None)
}

fn connect_scripted<R>(
    responder: R,
    hang_up_after: Option<usize>,
) -> (BmsManager, Arc<ScriptedTransport>)
where
    R: Fn(usize, &[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
{
    let (events, rx) = event_channel();
    let transport = Arc::new(ScriptedTransport {
        writes: Mutex::new(Vec::new()),
        events,
        responder: Box::new(responder),
        hang_up_after,
    });
    let manager = BmsManager::new(Link::new(transport.clone(), rx), ManagerConfig::default());
    (manager, transport)
}

fn protocol_frame(command: u8, selected: u8, names: &[&str]) -> Vec<u8> {
    let mut frame = vec![0x10, command, 0x00, selected, names.len() as u8];
    for name in names {
        let mut slot = [0u8; 10];
        slot[..name.len()].copy_from_slice(name.as_bytes());
        frame.extend_from_slice(&slot);
    }
    crc16(&frame)
}

fn ack(command: u8, code: u8) -> Vec<u8> {
    crc16(&[0x10, command, 0x00, code])
}

/// A healthy pack in slot 1 with four cells.
fn device(_index: usize, request: &[u8]) -> Vec<Vec<u8>> {
    if request == TELEMETRY_REQUEST.as_slice() {
        return vec![hex_decode(TELEMETRY_FRAME)];
    }
    match request {
        [0x10, 0x02, ..] => vec![crc16(&[0x10, 0x02, 0x00, 0x01])],
        [0x10, 0x03, ..] => vec![protocol_frame(0x03, 1, &["P02-LUX", "P01-LUX", "P06-LUX"])],
        [0x10, 0x04, ..] => vec![protocol_frame(0x04, 0, &["P01-GRW", "P02-VIC"])],
        [0x10, command @ (0x05 | 0x06 | 0x07), ..] => vec![ack(*command, 0x00)],
        _ => vec![],
    }
}

fn cell_millivolts(cell: usize) -> u16 {
    3001 + cell as u16
}

fn primary_frame(cell_count: u16) -> Vec<u8> {
    let mut frame = hex_decode(TELEMETRY_FRAME);
    frame.truncate(frame.len() - 2);
    for i in 0..CELLS_PER_FRAME {
        let offset = 3 + 4 + 2 * i;
        frame[offset..offset + 2].copy_from_slice(&cell_millivolts(i).to_be_bytes());
    }
    frame[3 + 72..3 + 74].copy_from_slice(&cell_count.to_be_bytes());
    crc16(&frame)
}

fn continuation_frame(frame_no: u8, cells: usize) -> Vec<u8> {
    let mut frame = vec![0x01, FUNCTION_CONTINUATION, (1 + 2 * cells) as u8, frame_no];
    let first = usize::from(frame_no) * CELLS_PER_FRAME;
    for i in first..first + cells {
        frame.extend_from_slice(&cell_millivolts(i).to_be_bytes());
    }
    frame.extend_from_slice(&[0x00, 0x00, 0x00]);
    crc16(&frame)
}

#[tokio::test(start_paused = true)]
async fn reads_telemetry() {
    let (bms, transport) = connect(device);
    let mut readings = bms.subscribe_readings();

    let reading = bms.get_bms_reading().await.unwrap();
    assert_eq!(reading.voltage, 13.3);
    assert_eq!(reading.current, 0.0);
    assert_eq!(reading.cell_count, 4);
    assert_eq!(reading.cell_voltages, vec![3.326, 3.327, 3.327, 3.329]);
    assert_eq!(reading.soc, 94);
    assert_eq!(transport.writes(), vec![TELEMETRY_REQUEST.to_vec()]);

    readings.changed().await.unwrap();
    assert_eq!(readings.borrow().as_ref(), Some(&reading));
    assert_eq!(bms.last_reading(), Some(reading));
}

#[tokio::test(start_paused = true)]
async fn reassembles_reading_across_frames() {
    let (bms, _transport) = connect(|_, request: &[u8]| {
        if request == TELEMETRY_REQUEST.as_slice() {
            vec![primary_frame(40), continuation_frame(1, 16), continuation_frame(2, 8)]
        } else {
            vec![]
        }
    });
    let reading = bms.get_bms_reading().await.unwrap();
    assert_eq!(reading.cell_count, 40);
    assert_eq!(reading.cell_voltages.len(), 40);
    assert_eq!(reading.cell_voltages[0], 3.001);
    assert_eq!(reading.cell_voltages[20], 3.021);
    assert_eq!(reading.cell_voltages[39], 3.040);
}

#[tokio::test(start_paused = true)]
async fn drops_frames_with_bad_crc() {
    let (bms, _transport) = connect(|_, request: &[u8]| {
        if request != TELEMETRY_REQUEST.as_slice() {
            return vec![];
        }
        let good = hex_decode(TELEMETRY_FRAME);
        let mut corrupted = good.clone();
        corrupted[3] ^= 0xff;
        vec![corrupted, good]
    });
    let reading = bms.get_bms_reading().await.unwrap();
    assert_eq!(reading.voltage, 13.3);
}

#[tokio::test(start_paused = true)]
async fn telemetry_without_answer_times_out() {
    let (bms, _transport) = connect(|_, _: &[u8]| vec![]);
    let started = Instant::now();
    assert!(matches!(bms.get_bms_reading().await, Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn module_id_is_cached() {
    let (bms, transport) = connect(device);
    let first = bms.get_module_id().await.unwrap();
    let second = bms.get_module_id().await.unwrap();
    assert_eq!(first.module_id, 1);
    assert_eq!(first, second);
    assert_eq!(transport.write_count(), 1);

    bms.refresh_control_data();
    bms.get_module_id().await.unwrap();
    assert_eq!(transport.write_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn get_is_retried_once_after_timeout() {
    let (bms, transport) = connect(|index, request: &[u8]| {
        if index == 0 {
            vec![]
        } else {
            device(index, request)
        }
    });
    let started = Instant::now();
    let module = bms.get_module_id().await.unwrap();
    assert_eq!(module.module_id, 1);
    assert_eq!(transport.write_count(), 2);
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn set_is_never_retried() {
    let (bms, transport) = connect(|_, _: &[u8]| vec![]);
    assert!(matches!(bms.set_module_id(3).await, Err(Error::Timeout)));
    assert_eq!(transport.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn set_module_id_validates_range() {
    let (bms, transport) = connect(device);
    assert!(matches!(bms.set_module_id(0).await, Err(Error::RangeError)));
    assert!(matches!(bms.set_module_id(17).await, Err(Error::RangeError)));
    assert_eq!(transport.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn accepted_set_updates_cache() {
    let (bms, transport) = connect(device);
    assert_eq!(bms.get_module_id().await.unwrap().module_id, 1);
    assert!(bms.set_module_id(5).await.unwrap());
    assert_eq!(
        transport.writes()[1],
        crc16(&[0x10, 0x07, 0x01, 0x05])
    );
    assert_eq!(bms.get_module_id().await.unwrap().module_id, 5);
    assert_eq!(transport.write_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn rejected_set_keeps_cache() {
    let (bms, _transport) = connect(|index, request: &[u8]| match request {
        [0x10, 0x07, ..] => vec![ack(0x07, 0x01)],
        _ => device(index, request),
    });
    bms.get_module_id().await.unwrap();
    assert!(!bms.set_module_id(9).await.unwrap());
    assert_eq!(bms.get_module_id().await.unwrap().module_id, 1);
}

#[tokio::test(start_paused = true)]
async fn set_answered_by_another_command_is_refused() {
    // A late getRS485 answer selecting entry 0 must not count as a setCAN ack.
    let (bms, transport) = connect(|index, request: &[u8]| match request {
        [0x10, 0x06, ..] => vec![protocol_frame(0x03, 0, &["P02-LUX", "P01-LUX"])],
        _ => device(index, request),
    });
    let can = bms.get_can().await.unwrap();
    assert!(matches!(bms.set_can(1).await, Err(Error::ProtocolMismatch(_))));
    assert_eq!(bms.get_can().await.unwrap(), can);
    assert_eq!(transport.write_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn protocol_selection_round_trip() {
    let (bms, transport) = connect(device);
    let rs485 = bms.get_rs485().await.unwrap();
    assert_eq!(rs485.readable_protocol(), "P01-LUX");
    assert_eq!(rs485.readable_protocols().len(), 3);

    assert!(bms.set_rs485(2).await.unwrap());
    assert_eq!(transport.writes()[1], crc16(&[0x10, 0x05, 0x01, 0x02]));
    let rs485 = bms.get_rs485().await.unwrap();
    assert_eq!(rs485.readable_protocol(), "P06-LUX");

    // index 3 is beyond the cached table
    assert!(matches!(bms.set_rs485(3).await, Err(Error::RangeError)));

    let can = bms.get_can().await.unwrap();
    assert_eq!(can.readable_protocol(), "P01-GRW");
    assert_eq!(transport.write_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn queued_requests_are_serialized_and_spaced() {
    let (bms, transport) = connect(device);
    let (module, can, rs485) = tokio::join!(bms.get_module_id(), bms.get_can(), bms.get_rs485());
    assert_eq!(module.unwrap().module_id, 1);
    assert_eq!(can.unwrap().protocols.len(), 2);
    assert_eq!(rs485.unwrap().protocols.len(), 3);

    let writes = transport.writes.lock().unwrap();
    let commands: Vec<u8> = writes.iter().map(|(_, frame)| frame[1]).collect();
    assert_eq!(commands, [0x02, 0x04, 0x03]);
    for pair in writes.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(500));
    }
}

#[tokio::test(start_paused = true)]
async fn link_loss_resets_state() {
    let (bms, transport) = connect(device);
    let mut connection = bms.subscribe_connection();
    bms.get_module_id().await.unwrap();
    bms.get_bms_reading().await.unwrap();
    assert!(bms.control_data().module_id.is_some());

    transport.push(LinkEvent::Disconnected);
    connection
        .wait_for(|state| *state == ConnectionState::Disconnected)
        .await
        .unwrap();

    assert!(!bms.is_connected());
    assert_eq!(bms.control_data(), ControlCache::default());
    assert_eq!(bms.last_reading(), None);
    let writes = transport.write_count();
    assert!(matches!(
        bms.get_module_id().await,
        Err(Error::ConnectionUnavailable)
    ));
    assert!(matches!(
        bms.get_bms_reading().await,
        Err(Error::ConnectionUnavailable)
    ));
    assert_eq!(transport.write_count(), writes);
}

#[tokio::test(start_paused = true)]
async fn link_loss_fails_outstanding_request() {
    let (bms, transport) = connect(|_, _: &[u8]| vec![]);
    let started = Instant::now();
    let (result, _) = tokio::join!(bms.get_module_id(), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        transport.push(LinkEvent::PoweredOff);
    });
    assert!(matches!(result, Err(Error::ConnectionUnavailable)));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(*bms.subscribe_connection().borrow(), ConnectionState::PoweredOff);
}

#[tokio::test(start_paused = true)]
async fn answer_followed_by_link_loss_is_not_cached() {
    let (bms, transport) = connect_scripted(
        |_, request: &[u8]| match request {
            [0x10, 0x02, ..] => vec![crc16(&[0x10, 0x02, 0x00, 0x07])],
            _ => vec![],
        },
        Some(0),
    );
    assert!(matches!(
        bms.get_module_id().await,
        Err(Error::ConnectionUnavailable)
    ));
    assert_eq!(*bms.subscribe_connection().borrow(), ConnectionState::Disconnected);
    assert_eq!(bms.control_data(), ControlCache::default());
    assert!(matches!(
        bms.get_module_id().await,
        Err(Error::ConnectionUnavailable)
    ));
    assert_eq!(transport.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn frames_after_disconnect_are_ignored() {
    let (bms, transport) = connect(device);
    bms.disconnect().await.unwrap();
    transport.push(LinkEvent::Frame(hex_decode(TELEMETRY_FRAME)));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(bms.last_reading(), None);
    assert_eq!(*bms.subscribe_connection().borrow(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn polling_can_be_paused_and_resumed() {
    let (bms, transport) = connect(device);
    let mut readings = bms.subscribe_readings();
    bms.start_polling(Duration::from_secs(1));
    assert!(bms.is_polling());
    readings.changed().await.unwrap();
    assert!(readings.borrow().is_some());

    bms.pause_polling();
    assert!(!bms.is_polling());
    let before = transport.telemetry_requests();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.telemetry_requests(), before);

    bms.resume_polling();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(transport.telemetry_requests() > before);

    bms.stop_polling();
    let stopped = transport.telemetry_requests();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.telemetry_requests(), stopped);
}
