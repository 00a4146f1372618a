//! In-memory CAN bus with a simulated ECU
//!
//! Frames sent on the configured request id are reassembled with the same
//! ISO-TP codec the tester uses, answered by a small stateful UDS server and
//! put back on the bus on the response id. Without an ECU attached the bus
//! only records what was sent.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::{CanFrame, CanTransport, TransportError};
use crate::config::MockConfig;
use crate::isotp::codec::{self, FlowStatus, Pci, Reassembler, RxProgress, Segmenter};
use crate::uds::{service_id, standard_did, Nrc};

const PADDING: u8 = 0xCC;

/// Simulated ECU state
#[derive(Debug)]
struct EcuState {
    rx: Reassembler,
    /// Consecutive frames waiting for the tester's flow control
    outbound: VecDeque<Vec<u8>>,
    session: u8,
    /// Level a seed was issued for and not yet answered
    seed_level: Option<u8>,
    unlocked: Option<u8>,
    dtcs: Vec<[u8; 4]>,
    dids: HashMap<u16, Vec<u8>>,
}

impl EcuState {
    fn new(config: &MockConfig) -> Self {
        let mut dids = HashMap::new();
        dids.insert(standard_did::VIN, config.vin.as_bytes().to_vec());
        dids.insert(standard_did::ECU_SOFTWARE_VERSION, b"SW-1.0.0".to_vec());
        dids.insert(standard_did::ECU_SERIAL_NUMBER, b"SN-000042".to_vec());
        Self {
            rx: Reassembler::new(0),
            outbound: VecDeque::new(),
            session: 0x01,
            seed_level: None,
            unlocked: None,
            dtcs: default_dtcs(),
            dids,
        }
    }

    fn reset_security(&mut self) {
        self.seed_level = None;
        self.unlocked = None;
    }
}

fn default_dtcs() -> Vec<[u8; 4]> {
    vec![
        // P0103, confirmed
        [0x01, 0x03, 0x01, 0x08],
    ]
}

/// Mock CAN bus for tests and the CLI's offline mode
pub struct MockCanBus {
    config: MockConfig,
    connected: AtomicBool,
    silent: AtomicBool,
    removed: AtomicBool,
    incoming_tx: broadcast::Sender<CanFrame>,
    sent: Mutex<Vec<CanFrame>>,
    ecu: Mutex<EcuState>,
    /// Predefined responses (request prefix -> response), checked first
    responses: RwLock<Vec<(Vec<u8>, Vec<u8>)>>,
    /// Response-pending NRCs to send before the answer, per service id
    pending: Mutex<HashMap<u8, u32>>,
}

impl MockCanBus {
    pub fn new(config: &MockConfig) -> Self {
        let (incoming_tx, _) = broadcast::channel(256);
        Self {
            config: config.clone(),
            connected: AtomicBool::new(true),
            silent: AtomicBool::new(!config.ecu),
            removed: AtomicBool::new(false),
            incoming_tx,
            sent: Mutex::new(Vec::new()),
            ecu: Mutex::new(EcuState::new(config)),
            responses: RwLock::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Every frame written so far
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Set connection state
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            self.removed.store(false, Ordering::SeqCst);
        }
    }

    /// Stop (or resume) answering requests
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Simulate the interface disappearing: the next write fails with
    /// `DeviceRemoved` and the bus reports itself disconnected
    pub fn remove_device(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    /// Add a mock response for requests starting with `request`; an empty
    /// response means no answer
    pub fn add_response(&self, request: Vec<u8>, response: Vec<u8>) {
        self.responses.write().push((request, response));
    }

    /// Answer the next request for `sid` with `count` response-pending NRCs first
    pub fn set_response_pending(&self, sid: u8, count: u32) {
        self.pending.lock().insert(sid, count);
    }

    /// Put an arbitrary frame on the bus
    pub fn inject(&self, frame: CanFrame) {
        let _ = self.incoming_tx.send(frame);
    }

    /// Current session of the simulated ECU
    pub fn ecu_session(&self) -> u8 {
        self.ecu.lock().session
    }

    fn emit(&self, data: Vec<u8>, extended: bool) {
        trace!(
            can_id = format!("0x{:03X}", self.config.response_id),
            data = %hex::encode(&data),
            "Mock ECU frame"
        );
        self.inject(CanFrame::new(self.config.response_id, data, extended));
    }

    /// Feed one tester frame to the ECU and collect the frames it answers with
    fn on_request_frame(&self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut ecu = self.ecu.lock();
        let mut out = Vec::new();

        match codec::decode(data) {
            Ok(Pci::FlowControl {
                status: FlowStatus::ContinueToSend,
                ..
            }) => out.extend(ecu.outbound.drain(..)),
            Ok(Pci::FlowControl { .. }) => {}
            Ok(_) => match ecu.rx.on_frame(data) {
                Ok(RxProgress::FlowControlRequired) | Ok(RxProgress::BlockComplete) => {
                    out.push(codec::flow_control(
                        FlowStatus::ContinueToSend,
                        0,
                        Duration::ZERO,
                        Some(PADDING),
                    ));
                }
                Ok(RxProgress::InProgress) => {}
                Ok(RxProgress::Complete(request)) => {
                    for response in self.respond(&mut ecu, &request) {
                        let mut segmenter = match Segmenter::new(&response, Some(PADDING)) {
                            Ok(segmenter) => segmenter,
                            Err(e) => {
                                debug!(error = %e, "Mock ECU response not sendable");
                                continue;
                            }
                        };
                        out.push(segmenter.start());
                        while let Some(cf) = segmenter.next_consecutive() {
                            ecu.outbound.push_back(cf);
                        }
                    }
                }
                Err(e) => debug!(error = %e, "Mock ECU dropped frame"),
            },
            Err(e) => debug!(error = %e, "Mock ECU ignored frame"),
        }
        out
    }

    fn respond(&self, ecu: &mut EcuState, request: &[u8]) -> Vec<Vec<u8>> {
        let Some(&sid) = request.first() else {
            return Vec::new();
        };
        debug!(request = %hex::encode(request), "Mock ECU request");

        let mut out = Vec::new();
        let pending = self.pending.lock().remove(&sid).unwrap_or(0);
        for _ in 0..pending {
            out.push(vec![
                service_id::NEGATIVE_RESPONSE,
                sid,
                Nrc::RESPONSE_PENDING.code(),
            ]);
        }

        let predefined = self
            .responses
            .read()
            .iter()
            .find(|(req, _)| request.starts_with(req))
            .map(|(_, resp)| resp.clone());
        let response = match predefined {
            Some(resp) if resp.is_empty() => None,
            Some(resp) => Some(resp),
            None => self.handle(ecu, request),
        };
        out.extend(response);
        out
    }

    fn handle(&self, ecu: &mut EcuState, request: &[u8]) -> Option<Vec<u8>> {
        let sid = request[0];
        let negative = |nrc: Nrc| Some(vec![service_id::NEGATIVE_RESPONSE, sid, nrc.code()]);
        let positive = sid.wrapping_add(service_id::POSITIVE_OFFSET);

        match sid {
            service_id::DIAGNOSTIC_SESSION_CONTROL => {
                let Some(&sf) = request.get(1) else {
                    return negative(Nrc::INCORRECT_MESSAGE_LENGTH);
                };
                ecu.session = sf & 0x7F;
                ecu.reset_security();
                suppressible(sf, vec![positive, sf & 0x7F, 0x00, 0x32, 0x01, 0xF4])
            }
            service_id::ECU_RESET => {
                let Some(&sf) = request.get(1) else {
                    return negative(Nrc::INCORRECT_MESSAGE_LENGTH);
                };
                ecu.session = 0x01;
                ecu.reset_security();
                suppressible(sf, vec![positive, sf & 0x7F])
            }
            service_id::SECURITY_ACCESS => {
                let Some(&level) = request.get(1) else {
                    return negative(Nrc::INCORRECT_MESSAGE_LENGTH);
                };
                if level % 2 == 1 {
                    if ecu.unlocked == Some(level) {
                        return Some(vec![positive, level, 0x00, 0x00, 0x00, 0x00]);
                    }
                    ecu.seed_level = Some(level);
                    let mut response = vec![positive, level];
                    response.extend_from_slice(&self.config.seed);
                    return Some(response);
                }
                let Some(seed_level) = ecu.seed_level.take().filter(|l| l + 1 == level) else {
                    return negative(Nrc::REQUEST_SEQUENCE_ERROR);
                };
                let expected = self
                    .config
                    .key
                    .provider()
                    .calculate(&self.config.seed, seed_level);
                match expected {
                    Ok(key) if key == request[2..] => {
                        ecu.unlocked = Some(seed_level);
                        Some(vec![positive, level])
                    }
                    _ => negative(Nrc::INVALID_KEY),
                }
            }
            service_id::READ_DATA_BY_IDENTIFIER => {
                if request.len() != 3 {
                    return negative(Nrc::INCORRECT_MESSAGE_LENGTH);
                }
                let did = u16::from_be_bytes([request[1], request[2]]);
                let data = if did == standard_did::ACTIVE_DIAGNOSTIC_SESSION {
                    vec![ecu.session]
                } else {
                    match ecu.dids.get(&did) {
                        Some(data) => data.clone(),
                        None => return negative(Nrc::REQUEST_OUT_OF_RANGE),
                    }
                };
                let mut response = vec![positive, request[1], request[2]];
                response.extend_from_slice(&data);
                Some(response)
            }
            service_id::WRITE_DATA_BY_IDENTIFIER => {
                if request.len() < 4 {
                    return negative(Nrc::INCORRECT_MESSAGE_LENGTH);
                }
                let did = u16::from_be_bytes([request[1], request[2]]);
                ecu.dids.insert(did, request[3..].to_vec());
                Some(vec![positive, request[1], request[2]])
            }
            service_id::READ_DTC_INFORMATION => {
                let Some(&sf) = request.get(1) else {
                    return negative(Nrc::INCORRECT_MESSAGE_LENGTH);
                };
                let mask = request.get(2).copied().unwrap_or(0xFF);
                let matching: Vec<&[u8; 4]> =
                    ecu.dtcs.iter().filter(|d| d[3] & mask != 0).collect();
                match sf {
                    0x01 => {
                        let [hi, lo] = (matching.len() as u16).to_be_bytes();
                        Some(vec![positive, sf, 0xFF, 0x01, hi, lo])
                    }
                    0x02 | 0x0A..=0x0F | 0x13 | 0x15 => {
                        let mut response = vec![positive, sf, 0xFF];
                        for dtc in matching {
                            response.extend_from_slice(dtc);
                        }
                        Some(response)
                    }
                    _ => negative(Nrc::SUB_FUNCTION_NOT_SUPPORTED),
                }
            }
            service_id::CLEAR_DIAGNOSTIC_INFORMATION => {
                if request.len() != 4 {
                    return negative(Nrc::INCORRECT_MESSAGE_LENGTH);
                }
                ecu.dtcs.clear();
                Some(vec![positive])
            }
            service_id::TESTER_PRESENT => {
                let sf = request.get(1).copied().unwrap_or(0x00);
                suppressible(sf, vec![positive, sf & 0x7F])
            }
            _ => negative(Nrc::SERVICE_NOT_SUPPORTED),
        }
    }
}

/// Drop a positive response when the suppress bit is set
fn suppressible(sub_function: u8, response: Vec<u8>) -> Option<Vec<u8>> {
    if sub_function & 0x80 != 0 {
        None
    } else {
        Some(response)
    }
}

#[async_trait]
impl CanTransport for MockCanBus {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.removed.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if self.removed.load(Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::DeviceRemoved("mock".to_string()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        // Simulate latency
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        self.sent.lock().push(frame.clone());
        trace!(
            can_id = format!("0x{:03X}", frame.id),
            data = %hex::encode(&frame.data),
            "Mock transport: sent frame"
        );

        if frame.id == self.config.request_id && !self.silent.load(Ordering::SeqCst) {
            for data in self.on_request_frame(&frame.data) {
                self.emit(data, frame.extended);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }
}
