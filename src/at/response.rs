//! Completed AT command exchanges.

use crate::error::AtError;

/// Shape of intermediate response a command expects. Decides how the
/// reader classifies non-final lines while the command is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// No intermediate expected; every non-final line is unsolicited.
    NoResult,
    /// Exactly one intermediate whose first non-space character is a digit.
    Numeric,
    /// Exactly one intermediate beginning with the given prefix.
    SingleLine,
    /// Zero or more intermediates beginning with the given prefix.
    MultiLine,
}

/// A completed command exchange: the final result code, success flag, and
/// the intermediate lines collected in arrival order. Owned by the handler
/// that issued the command; dropped when done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtResponse {
    pub success: bool,
    pub final_response: String,
    pub intermediates: Vec<String>,
}

/// Final result codes, per 27.007 plus the `CONNECT` data-mode entry.
/// Anchored comparison; `CONNECT` must be the bare word so that
/// `CONNECT 9600` style lines fall through to the caller.
const FINAL_OK: [&str; 2] = ["OK", "CONNECT"];
const FINAL_ERROR: [&str; 8] = [
    "ERROR",
    "+CMS ERROR:",
    "+CME ERROR:",
    "+EXT ERROR:",
    "NO CARRIER",
    "NO ANSWER",
    "NO DIALTONE",
    "BUSY",
];

/// Is this line a final result code indicating success?
pub fn is_final_success(line: &str) -> bool {
    FINAL_OK.contains(&line)
}

/// Is this line a final result code indicating failure?
///
/// The call-progress words (`BUSY`, `NO CARRIER`, ...) only complete a
/// command when one is pending; otherwise they reach the unsolicited
/// router as call-state lines.
pub fn is_final_error(line: &str) -> bool {
    FINAL_ERROR
        .iter()
        .any(|f| line == *f || (f.ends_with(':') && line.starts_with(f)))
}

fn parse_error_code(line: &str, prefix: &str) -> Option<i32> {
    line.strip_prefix(prefix)?.trim().parse().ok()
}

impl AtResponse {
    pub(crate) fn new() -> Self {
        AtResponse {
            success: false,
            final_response: String::new(),
            intermediates: Vec::new(),
        }
    }

    /// Numeric code from a `+CME ERROR: n` final, if any.
    pub fn cme_error(&self) -> Option<i32> {
        parse_error_code(&self.final_response, "+CME ERROR:")
    }

    /// Numeric code from a `+CMS ERROR: n` final, if any.
    pub fn cms_error(&self) -> Option<i32> {
        parse_error_code(&self.final_response, "+CMS ERROR:")
    }

    /// First intermediate line, for single-line and numeric commands.
    pub fn first_line(&self) -> Option<&str> {
        self.intermediates.first().map(String::as_str)
    }

    /// Fail with [`AtError::Generic`] unless the final code was a success.
    /// Lets handlers write `chan.send(...)?.require_success()?`.
    pub fn require_success(self) -> Result<AtResponse, AtError> {
        if self.success {
            Ok(self)
        } else {
            Err(AtError::Generic {
                cme: self.cme_error(),
                cms: self.cms_error(),
            })
        }
    }
}
