//! Service calls and the security access sequencer
//!
//! Every call validates its arguments, queues one request and returns its id.
//! Results arrive as [`DiagEvent`]s; state updates run in the request's
//! success callback on the worker.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::connection::Shared;
use super::events::DiagEvent;
use super::queue::{priority, Request, RequestId};
use super::Orchestrator;
use crate::error::DiagError;
use crate::security::KeyProvider;
use crate::session::{SecuritySnapshot, SessionType};
use crate::uds::dtc::{dtc_group, sub_function};
use crate::uds::{normalize, service_id, tester_present};

/// Highest odd requestSeed sub-function (0x7F is reserved)
const MAX_SEED_LEVEL: u8 = 0x7D;

fn request(sid: u8, payload: Vec<u8>) -> Request {
    Request::new(service_id::name(sid), payload)
}

impl Orchestrator {
    fn reject(&self, err: DiagError) -> Result<RequestId, DiagError> {
        self.shared.report(&err);
        Err(err)
    }

    // =========================================================================
    // Session control
    // =========================================================================

    /// DiagnosticSessionControl (0x10)
    ///
    /// On success the session snapshot and timeout profile follow the new
    /// session and security access is reset.
    pub fn change_session(&self, session_type: SessionType) -> Result<RequestId, DiagError> {
        let shared = self.shared.clone();
        let code = session_type.code();
        let request = request(
            service_id::DIAGNOSTIC_SESSION_CONTROL,
            vec![service_id::DIAGNOSTIC_SESSION_CONTROL, code],
        )
        .priority(priority::SESSION)
        .on_success(move |response| {
            let decoded = normalize::session_control(&response, code)?;
            debug!(
                session_id = format!("0x{:02X}", decoded.session_type),
                p2_server = ?decoded.p2,
                p2_star_server = ?decoded.p2_star,
                "Session control accepted"
            );
            shared.apply_session(SessionType::from(decoded.session_type));
            Ok(())
        });
        self.enqueue(request)
    }

    /// TesterPresent (0x3E)
    ///
    /// Failures are logged only. With `suppress` no response is awaited.
    pub fn keep_alive(&self, suppress: bool) -> Result<RequestId, DiagError> {
        let sub_function = if suppress {
            tester_present::SUPPRESS_RESPONSE
        } else {
            tester_present::ZERO_SUB_FUNCTION
        };
        let mut request = request(
            service_id::TESTER_PRESENT,
            vec![service_id::TESTER_PRESENT, sub_function],
        )
        .priority(priority::KEEPALIVE)
        .keepalive();
        if suppress {
            request = request.no_response();
        }
        self.enqueue(request)
    }

    /// ECUReset (0x11); a positive response returns the ECU to the default session
    pub fn ecu_reset(&self, reset_type: u8) -> Result<RequestId, DiagError> {
        let shared = self.shared.clone();
        let request = request(
            service_id::ECU_RESET,
            vec![service_id::ECU_RESET, reset_type],
        )
        .on_success(move |response| {
            let reset = normalize::ecu_reset(&response, reset_type)?;
            info!(
                reset_type = format!("0x{:02X}", reset.reset_type),
                power_down_time = ?reset.power_down_time,
                "ECU reset accepted"
            );
            shared.apply_session(SessionType::Default);
            Ok(())
        });
        self.enqueue(request)
    }

    // =========================================================================
    // Data identifiers
    // =========================================================================

    /// ReadDataByIdentifier (0x22), result published as [`DiagEvent::DataRead`]
    pub fn read_data_by_identifier(&self, did: u16) -> Result<RequestId, DiagError> {
        let shared = self.shared.clone();
        let [hi, lo] = did.to_be_bytes();
        let request = request(
            service_id::READ_DATA_BY_IDENTIFIER,
            vec![service_id::READ_DATA_BY_IDENTIFIER, hi, lo],
        )
        .on_success(move |response| {
            let data = normalize::read_data_by_identifier(&response, did)?;
            debug!(did = format!("0x{:04X}", did), len = data.len(), "Data identifier read");
            shared.emit(DiagEvent::DataRead { did, data });
            Ok(())
        });
        self.enqueue(request)
    }

    /// WriteDataByIdentifier (0x2E)
    pub fn write_data_by_identifier(&self, did: u16, data: &[u8]) -> Result<RequestId, DiagError> {
        if data.is_empty() {
            return self.reject(DiagError::InvalidArgument(format!(
                "No data to write to DID 0x{:04X}",
                did
            )));
        }
        let [hi, lo] = did.to_be_bytes();
        let mut payload = vec![service_id::WRITE_DATA_BY_IDENTIFIER, hi, lo];
        payload.extend_from_slice(data);

        let request = request(service_id::WRITE_DATA_BY_IDENTIFIER, payload).on_success(
            move |response| {
                normalize::write_data_by_identifier(&response, did)?;
                info!(did = format!("0x{:04X}", did), "Data identifier written");
                Ok(())
            },
        );
        self.enqueue(request)
    }

    // =========================================================================
    // DTCs
    // =========================================================================

    /// ReadDTCInformation (0x19) for a record-reporting sub-function
    ///
    /// `status_mask` is sent only for the by-status-mask sub-functions.
    pub fn read_dtcs(&self, sf: u8, status_mask: u8) -> Result<RequestId, DiagError> {
        if !sub_function::returns_records(sf) {
            return self.reject(DiagError::InvalidArgument(format!(
                "DTC sub-function 0x{:02X} does not report DTC records",
                sf
            )));
        }
        let mut payload = vec![service_id::READ_DTC_INFORMATION, sf];
        if sub_function::takes_status_mask(sf) {
            payload.push(status_mask);
        }

        let shared = self.shared.clone();
        let request = request(service_id::READ_DTC_INFORMATION, payload).on_success(
            move |response| {
                let report = normalize::dtc_records(&response)?;
                info!(
                    sub_function = format!("0x{:02X}", report.sub_function),
                    count = report.dtcs.len(),
                    "DTCs read"
                );
                shared.emit(DiagEvent::DtcsReceived {
                    sub_function: report.sub_function,
                    status_availability_mask: report.status_availability_mask,
                    dtcs: report.dtcs,
                });
                Ok(())
            },
        );
        self.enqueue(request)
    }

    /// reportNumberOfDTCByStatusMask (0x19 0x01)
    pub fn read_dtc_count(&self, status_mask: u8) -> Result<RequestId, DiagError> {
        let shared = self.shared.clone();
        let request = request(
            service_id::READ_DTC_INFORMATION,
            vec![
                service_id::READ_DTC_INFORMATION,
                sub_function::REPORT_NUMBER_OF_DTC_BY_STATUS_MASK,
                status_mask,
            ],
        )
        .on_success(move |response| {
            let count = normalize::dtc_count(&response)?;
            shared.emit(DiagEvent::DtcCountReceived {
                status_availability_mask: count.status_availability_mask,
                count: count.count,
            });
            Ok(())
        });
        self.enqueue(request)
    }

    /// ClearDiagnosticInformation (0x14) for a 24-bit group
    pub fn clear_dtcs(&self, group: u32) -> Result<RequestId, DiagError> {
        if group > dtc_group::ALL {
            return self.reject(DiagError::InvalidArgument(format!(
                "DTC group 0x{:X} exceeds 24 bits",
                group
            )));
        }
        let [_, g2, g1, g0] = group.to_be_bytes();
        let request = request(
            service_id::CLEAR_DIAGNOSTIC_INFORMATION,
            vec![service_id::CLEAR_DIAGNOSTIC_INFORMATION, g2, g1, g0],
        )
        .on_success(move |response| {
            normalize::clear_dtcs(&response)?;
            info!(group = format!("0x{:06X}", group), "DTCs cleared");
            Ok(())
        });
        self.enqueue(request)
    }

    /// Arbitrary request; the raw response is carried by `ResponseReceived`
    pub fn send_raw(&self, payload: Vec<u8>) -> Result<RequestId, DiagError> {
        let Some(&sid) = payload.first() else {
            return self.reject(DiagError::InvalidArgument("Empty request".to_string()));
        };
        self.enqueue(request(sid, payload))
    }

    // =========================================================================
    // Security access
    // =========================================================================

    /// SecurityAccess requestSeed (0x27, odd level)
    pub fn request_seed(&self, level: u8) -> Result<RequestId, DiagError> {
        if let Err(e) = check_seed_level(level) {
            return self.reject(e);
        }
        let shared = self.shared.clone();
        let request = seed_request(level).on_success(move |response| {
            let seed = normalize::security_seed(&response, level)?;
            record_seed(&shared, level, seed);
            Ok(())
        });
        self.enqueue(request)
    }

    /// SecurityAccess sendKey (0x27, even level)
    ///
    /// Requires a seed for `level - 1` on record; otherwise fails with
    /// [`DiagError::SequenceError`] without queueing anything.
    pub fn send_key(&self, level: u8, key: Vec<u8>) -> Result<RequestId, DiagError> {
        let security = self.shared.security();
        if !security.accepts_key_for(level) {
            return self.reject(DiagError::SequenceError(format!(
                "No seed on record for key level 0x{:02X}",
                level
            )));
        }
        if key.is_empty() {
            return self.reject(DiagError::InvalidArgument("Empty key".to_string()));
        }
        self.enqueue(key_request(&self.shared, level, key))
    }

    /// Request a seed, derive the key with `provider` and send it
    ///
    /// The key is computed on the worker when the seed arrives. An all-zero
    /// seed ends the sequence without sending a key.
    pub fn unlock(&self, level: u8, provider: Arc<dyn KeyProvider>) -> Result<RequestId, DiagError> {
        if let Err(e) = check_seed_level(level) {
            return self.reject(e);
        }
        let shared = self.shared.clone();
        let request = seed_request(level).on_success(move |response| {
            let seed = normalize::security_seed(&response, level)?;
            if !record_seed(&shared, level, seed.clone()) {
                return Ok(());
            }
            let key = provider.calculate(&seed, level)?;
            debug!(level, provider = provider.name(), "Key calculated");
            let request = key_request(&shared, level + 1, key);
            shared.submit(request)?;
            Ok(())
        });
        self.enqueue(request)
    }
}

fn check_seed_level(level: u8) -> Result<(), DiagError> {
    if level % 2 == 1 && level <= MAX_SEED_LEVEL {
        Ok(())
    } else {
        Err(DiagError::InvalidArgument(format!(
            "Seed level must be odd and in 0x01..=0x{:02X}, got 0x{:02X}",
            MAX_SEED_LEVEL, level
        )))
    }
}

fn seed_request(level: u8) -> Request {
    request(
        service_id::SECURITY_ACCESS,
        vec![service_id::SECURITY_ACCESS, level],
    )
    .priority(priority::SESSION)
}

/// Store a received seed; false when the ECU reports the level as unlocked
fn record_seed(shared: &Shared, level: u8, seed: Vec<u8>) -> bool {
    if seed.iter().all(|&b| b == 0) {
        // Unlock is only confirmed by an accepted key
        info!(level, "Zero seed, security level reported as already unlocked");
        shared.set_security(shared.security().with_zero_seed(level));
        return false;
    }
    debug!(level, seed = %hex::encode(&seed), "Seed received");
    shared.set_security(SecuritySnapshot::with_seed(level, seed.clone()));
    shared.emit(DiagEvent::SecurityStatusChanged {
        level,
        unlocked: false,
        seed,
    });
    true
}

fn key_request(shared: &Arc<Shared>, level: u8, key: Vec<u8>) -> Request {
    let mut payload = vec![service_id::SECURITY_ACCESS, level];
    payload.extend_from_slice(&key);

    let accepted = shared.clone();
    let rejected = shared.clone();
    let sent = key.clone();
    request(service_id::SECURITY_ACCESS, payload)
        .priority(priority::SESSION)
        .on_success(move |response| {
            normalize::security_key(&response, level)?;
            let next = accepted.security().key_answered(sent, true);
            info!(level = next.level, "Security access granted");
            let event = DiagEvent::SecurityStatusChanged {
                level: next.level,
                unlocked: true,
                seed: next.seed.clone(),
            };
            accepted.set_security(next);
            accepted.emit(event);
            Ok(())
        })
        .on_failure(move |err| {
            // The ECU drops the seed after a rejected key
            let next = rejected.security().key_answered(key, false);
            warn!(level, error = %err, "Security access denied");
            let event = DiagEvent::SecurityStatusChanged {
                level: 0,
                unlocked: false,
                seed: next.seed.clone(),
            };
            rejected.set_security(next);
            rejected.emit(event);
            rejected.report(err);
        })
}
