use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default deadline for one control-data round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default pause between two queued requests.
pub const DEFAULT_REQUEST_SPACING: Duration = Duration::from_millis(500);
/// Default telemetry polling period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Timing of the request queue and the telemetry poller.
///
/// Built once and handed to [`crate::BmsManager::new`]; nothing mutates it
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ManagerConfig {
    /// Deadline for each attempt of a queued request.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub request_timeout: Duration,
    /// Minimum gap between the end of one queued request and the start of the next.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub request_spacing: Duration,
    /// Extra attempts for control-data reads. Writes are never repeated.
    pub get_retries: u8,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub poll_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            request_spacing: DEFAULT_REQUEST_SPACING,
            get_retries: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ManagerConfig {
    pub fn with_request_timeout(self, request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            ..self
        }
    }

    pub fn with_request_spacing(self, request_spacing: Duration) -> Self {
        Self {
            request_spacing,
            ..self
        }
    }

    pub fn with_get_retries(self, get_retries: u8) -> Self {
        Self {
            get_retries,
            ..self
        }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }
}
