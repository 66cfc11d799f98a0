//! Error taxonomies at the engine boundaries.
//!
//! Three layers, matching who observes the failure:
//!
//! - [`AtError`] — what a handler gets back from the AT channel.
//! - [`RilError`] — what the host gets back from a request.
//! - [`PdpFailCause`] — the LAST_DATA_CALL_FAIL_CAUSE taxonomy.

use std::fmt;

/// Failure of a single AT command exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtError {
    /// The final result code indicated an error (`ERROR`, `+CME ERROR: n`,
    /// `NO CARRIER`, ...). Carries the CME/CMS code when one was present.
    Generic { cme: Option<i32>, cms: Option<i32> },
    /// A command was already pending on this channel.
    CommandPending,
    /// The channel closed (reader saw EOF or a fatal error) before the
    /// final result code arrived.
    ChannelClosed,
    /// The per-channel deadline elapsed; the command is abandoned.
    Timeout,
    /// The final code was a success but the expected intermediate line was
    /// missing or malformed.
    InvalidResponse,
    /// Command issued from the reader thread or an unsolicited handler.
    InvalidThread,
}

impl AtError {
    pub fn cme_error(&self) -> Option<i32> {
        match self {
            AtError::Generic { cme, .. } => *cme,
            _ => None,
        }
    }

    pub fn cms_error(&self) -> Option<i32> {
        match self {
            AtError::Generic { cms, .. } => *cms,
            _ => None,
        }
    }
}

impl fmt::Display for AtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtError::Generic { cme: Some(n), .. } => write!(f, "command failed (CME error {n})"),
            AtError::Generic { cms: Some(n), .. } => write!(f, "command failed (CMS error {n})"),
            AtError::Generic { .. } => write!(f, "command failed"),
            AtError::CommandPending => write!(f, "a command is already pending"),
            AtError::ChannelClosed => write!(f, "AT channel closed"),
            AtError::Timeout => write!(f, "AT command timed out"),
            AtError::InvalidResponse => write!(f, "missing or malformed intermediate response"),
            AtError::InvalidThread => write!(f, "AT command issued from the reader thread"),
        }
    }
}

impl std::error::Error for AtError {}

/// Request outcome reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RilError {
    GenericFailure,
    RadioNotAvailable,
    SmsSendFailRetry,
    IllegalSimOrMe,
    PasswordIncorrect,
}

impl fmt::Display for RilError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RilError::GenericFailure => "generic failure",
            RilError::RadioNotAvailable => "radio not available",
            RilError::SmsSendFailRetry => "SMS send failed, retry",
            RilError::IllegalSimOrMe => "illegal SIM or ME",
            RilError::PasswordIncorrect => "password incorrect",
        };
        f.write_str(s)
    }
}

impl std::error::Error for RilError {}

impl From<AtError> for RilError {
    fn from(_: AtError) -> Self {
        // The host taxonomy has no channel-level detail; handlers that care
        // (SMS retry classification, SIM status) inspect the AtError first.
        RilError::GenericFailure
    }
}

/// CME error codes the engine interprets (27.007 §9.2).
pub const CME_SIM_NOT_INSERTED: i32 = 10;
pub const CME_SIM_FAILURE: i32 = 13;

/// CMS error codes classified as retryable on SMS send (27.005 §3.2.5).
pub const CMS_NO_NETWORK_SERVICE: i32 = 331;
pub const CMS_NETWORK_TIMEOUT: i32 = 332;

/// Failure cause for the most recent data-call setup, in the host's
/// taxonomy. Session-management protocol causes 95..=111 map to
/// `ProtocolErrors`; everything else is `Unspecified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdpFailCause {
    Unspecified,
    ProtocolErrors,
}

/// First and last of the 24.008 session-management protocol cause range.
const SM_CAUSE_SEMANTICALLY_INCORRECT: i32 = 95;
const SM_CAUSE_PROTO_ERROR_UNSPECIFIED: i32 = 111;

impl PdpFailCause {
    /// Classify a connection-state-machine disconnect cause.
    pub fn from_cause(cause: i32) -> Self {
        if (SM_CAUSE_SEMANTICALLY_INCORRECT..=SM_CAUSE_PROTO_ERROR_UNSPECIFIED).contains(&cause) {
            PdpFailCause::ProtocolErrors
        } else {
            PdpFailCause::Unspecified
        }
    }
}
