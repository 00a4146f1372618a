//! UDS client adapter

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{service_id, Nrc, UdsError};
use crate::bridge::FrameBridge;
use crate::isotp::{Addressing, IsoTpEndpoint, IsoTpParams};
use crate::session::TimeoutProfile;

/// Request/response client the orchestrator drives
///
/// Implementations must treat `apply_timeouts` as authoritative for the next
/// request: the orchestrator calls it before every dispatch.
#[async_trait]
pub trait UdsClient: Send + Sync {
    /// Replace the client's timeout profile, including any frame-level timeouts
    fn apply_timeouts(&self, profile: &TimeoutProfile);

    /// Timeout profile currently in force
    fn timeouts(&self) -> TimeoutProfile;

    /// Send a request and wait for its final (non-pending) response
    ///
    /// Positive responses are returned raw, SID included. Negative responses
    /// surface as [`UdsError::NegativeResponse`].
    async fn request(&self, request: &[u8]) -> Result<Vec<u8>, UdsError>;

    /// Send a request without waiting for any response
    async fn send_only(&self, request: &[u8]) -> Result<(), UdsError>;

    /// Release the underlying endpoint
    fn close(&self);
}

/// Builds the client stack for one connection
pub trait ClientFactory: Send + Sync {
    fn create(
        &self,
        bridge: Arc<FrameBridge>,
        addressing: Addressing,
    ) -> Result<Arc<dyn UdsClient>, UdsError>;
}

/// Factory for [`IsoTpUdsClient`] with fixed frame parameters
#[derive(Debug, Clone, Default)]
pub struct IsoTpClientFactory {
    params: IsoTpParams,
}

impl IsoTpClientFactory {
    pub fn new(params: IsoTpParams) -> Self {
        Self { params }
    }
}

impl ClientFactory for IsoTpClientFactory {
    fn create(
        &self,
        bridge: Arc<FrameBridge>,
        addressing: Addressing,
    ) -> Result<Arc<dyn UdsClient>, UdsError> {
        let endpoint = IsoTpEndpoint::new(bridge, addressing, self.params);
        Ok(Arc::new(IsoTpUdsClient::new(endpoint)))
    }
}

/// UDS client over an ISO-TP endpoint
pub struct IsoTpUdsClient {
    endpoint: IsoTpEndpoint,
    profile: RwLock<TimeoutProfile>,
}

impl IsoTpUdsClient {
    pub fn new(endpoint: IsoTpEndpoint) -> Self {
        let profile = TimeoutProfile::default();
        endpoint.set_frame_timeouts(profile.p2, profile.p2);
        Self {
            endpoint,
            profile: RwLock::new(profile),
        }
    }

    /// Frame-level (N_Bs, N_Cr) timeouts of the endpoint
    pub fn frame_timeouts(&self) -> (Duration, Duration) {
        let params = self.endpoint.params();
        (params.n_bs, params.n_cr)
    }
}

#[async_trait]
impl UdsClient for IsoTpUdsClient {
    fn apply_timeouts(&self, profile: &TimeoutProfile) {
        *self.profile.write() = *profile;
        self.endpoint.set_frame_timeouts(profile.p2, profile.p2);
    }

    fn timeouts(&self) -> TimeoutProfile {
        *self.profile.read()
    }

    async fn request(&self, request: &[u8]) -> Result<Vec<u8>, UdsError> {
        let sid = *request
            .first()
            .ok_or_else(|| UdsError::InvalidResponse("Empty request".to_string()))?;
        let profile = self.timeouts();

        self.endpoint.reset();
        self.endpoint.send(request).await?;

        let mut wait = profile.p2;
        loop {
            let response = self.endpoint.recv(wait).await?;
            match classify(sid, response)? {
                Reply::Final(response) => return Ok(response),
                Reply::Pending => wait = profile.p2_star,
                Reply::Unrelated => {}
            }
        }
    }

    async fn send_only(&self, request: &[u8]) -> Result<(), UdsError> {
        self.endpoint.send(request).await?;
        Ok(())
    }

    fn close(&self) {
        self.endpoint.close();
    }
}

/// How a received payload relates to the outstanding request
pub(crate) enum Reply {
    /// Positive response to the request, SID included
    Final(Vec<u8>),
    /// Response pending (NRC 0x78); keep waiting for P2*
    Pending,
    /// Belongs to another service or is not a response at all
    Unrelated,
}

/// Match a received payload against the request's service id
pub(crate) fn classify(sid: u8, response: Vec<u8>) -> Result<Reply, UdsError> {
    match response.first() {
        Some(&service_id::NEGATIVE_RESPONSE) => {
            if response.len() < 3 {
                return Err(UdsError::InvalidResponse(
                    "Negative response too short".to_string(),
                ));
            }
            if response[1] != sid {
                debug!(
                    service = format!("0x{:02X}", response[1]),
                    "Ignoring negative response for another service"
                );
                return Ok(Reply::Unrelated);
            }
            let nrc = Nrc::from(response[2]);
            if nrc.is_response_pending() {
                trace!(service = format!("0x{:02X}", sid), "Response pending");
                return Ok(Reply::Pending);
            }
            Err(UdsError::NegativeResponse {
                service_id: sid,
                nrc,
            })
        }
        Some(&first) if first == sid.wrapping_add(service_id::POSITIVE_OFFSET) => {
            Ok(Reply::Final(response))
        }
        _ => {
            debug!(data = %hex::encode(&response), "Ignoring unrelated response");
            Ok(Reply::Unrelated)
        }
    }
}
