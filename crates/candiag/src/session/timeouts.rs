//! Per-session timeout policy

use std::collections::HashMap;
use std::time::Duration;

use super::SessionType;

/// Timeouts applied to the UDS client for every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutProfile {
    /// Overall bound of one request, response-pending extensions included
    pub request_timeout: Duration,
    /// Wait for the first response (P2 client)
    pub p2: Duration,
    /// Wait after a response-pending NRC (P2* client)
    pub p2_star: Duration,
}

impl TimeoutProfile {
    pub const fn from_millis(request_timeout: u64, p2: u64, p2_star: u64) -> Self {
        Self {
            request_timeout: Duration::from_millis(request_timeout),
            p2: Duration::from_millis(p2),
            p2_star: Duration::from_millis(p2_star),
        }
    }
}

impl Default for TimeoutProfile {
    fn default() -> Self {
        DEFAULT_SESSION
    }
}

const DEFAULT_SESSION: TimeoutProfile = TimeoutProfile::from_millis(10_000, 1_000, 5_000);
const PROGRAMMING_SESSION: TimeoutProfile = TimeoutProfile::from_millis(5_000, 250, 5_000);
const EXTENDED_SESSION: TimeoutProfile = TimeoutProfile::from_millis(5_000, 250, 5_000);

/// Lookup table from session type to timeout profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimeouts {
    profiles: HashMap<u8, TimeoutProfile>,
    fallback: TimeoutProfile,
}

impl SessionTimeouts {
    /// Table with no entries; every session gets `fallback`
    pub fn empty(fallback: TimeoutProfile) -> Self {
        Self {
            profiles: HashMap::new(),
            fallback,
        }
    }

    pub fn insert(&mut self, session: SessionType, profile: TimeoutProfile) {
        self.profiles.insert(session.code(), profile);
    }

    pub fn with(mut self, session: SessionType, profile: TimeoutProfile) -> Self {
        self.insert(session, profile);
        self
    }

    pub fn profile_for(&self, session: SessionType) -> TimeoutProfile {
        self.profiles
            .get(&session.code())
            .copied()
            .unwrap_or(self.fallback)
    }

    /// Profile used when no specific entry exists
    pub fn fallback(&self) -> TimeoutProfile {
        self.fallback
    }

    pub fn set_fallback(&mut self, profile: TimeoutProfile) {
        self.fallback = profile;
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self::empty(DEFAULT_SESSION)
            .with(SessionType::Default, DEFAULT_SESSION)
            .with(SessionType::Programming, PROGRAMMING_SESSION)
            .with(SessionType::Extended, EXTENDED_SESSION)
            .with(SessionType::EndOfLine, EXTENDED_SESSION)
    }
}
