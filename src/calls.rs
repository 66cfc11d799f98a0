//! Current-call list (`AT+CLCC`) parsing.

use tracing::warn;

use crate::at::Tokenizer;
use crate::engine::Ctx;
use crate::error::RilError;
use crate::requests::{CallInfo, CallState, RilResponse};

fn clcc_state(state: i32) -> Option<CallState> {
    match state {
        0 => Some(CallState::Active),
        1 => Some(CallState::Holding),
        2 => Some(CallState::Dialing),
        3 => Some(CallState::Alerting),
        4 => Some(CallState::Incoming),
        5 => Some(CallState::Waiting),
        _ => None,
    }
}

/// Map the CLCC cause-of-no-CLI onto the host's presentation code.
/// CLCC omits the cause entirely when presentation is allowed, hence the
/// `None` → 0 (allowed) mapping.
fn presentation_from_cause(cause: Option<i32>) -> i32 {
    match cause {
        None => 0,
        Some(0) => 2,             // unknown
        Some(1) => 1,             // restricted
        Some(2) => 2,             // other service
        Some(3) => 3,             // payphone
        Some(_) => 2,
    }
}

/// Parse one `+CLCC:` line:
///
/// ```text
/// +CLCC: <index>,<isMT>,<state>,<mode>,<isMpty>
///        [,<number>,<type>[,<alpha>[,<priority>[,<cause_of_no_cli>]]]]
/// ```
pub fn parse_clcc_line(line: &str) -> Option<CallInfo> {
    let mut tok = Tokenizer::new(line)?;
    let mut call = CallInfo {
        index: tok.next_int()?,
        is_mt: tok.next_bool()?,
        state: clcc_state(tok.next_int()?)?,
        is_voice: false,
        ..CallInfo::default()
    };
    call.is_voice = tok.next_int()? == 0;
    call.is_multiparty = tok.next_bool()?;

    let mut cause_no_cli = None;
    if tok.has_more() {
        call.number = tok.next_str().map(str::to_string);
        call.toa = tok.next_int();
        if call.toa.is_none() && call.number.as_deref().is_some_and(|n| !n.is_empty()) {
            return None;
        }
        if tok.has_more() {
            call.name = tok.next_str().map(str::to_string);
            if tok.has_more() {
                let _priority = tok.next_int();
                if tok.has_more() {
                    cause_no_cli = Some(tok.next_int()?);
                }
            }
        }
    }

    call.number_presentation = presentation_from_cause(cause_no_cli);

    // Without a number we cannot trust an "allowed" presentation; the
    // modem may simply not support the cause field.
    if call.number.as_deref().unwrap_or("").is_empty() && call.number_presentation == 0 {
        call.number_presentation = 2;
    }
    call.name_presentation = if call.name.as_deref().unwrap_or("").is_empty()
        && call.number_presentation == 0
    {
        2
    } else {
        call.number_presentation
    };

    Some(call)
}

/// GET_CURRENT_CALLS: list and parse; undecodable entries are skipped, not
/// fatal.
pub fn get_current_calls(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let response = ctx.chan.send_multiline("AT+CLCC", "+CLCC:")?;

    let calls = response
        .intermediates
        .iter()
        .filter_map(|line| {
            let call = parse_clcc_line(line);
            if call.is_none() {
                warn!("invalid CLCC line: {line}");
            }
            call
        })
        .collect();

    Ok(RilResponse::Calls(calls))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_call() {
        let call = parse_clcc_line("+CLCC: 1,0,2,0,0").unwrap();
        assert_eq!(call.index, 1);
        assert!(!call.is_mt);
        assert_eq!(call.state, CallState::Dialing);
        assert!(call.is_voice);
        assert!(!call.is_multiparty);
        assert!(call.number.is_none());
        // No number: presentation degrades to unknown.
        assert_eq!(call.number_presentation, 2);
    }

    #[test]
    fn test_full_call_with_name_and_cause() {
        let call =
            parse_clcc_line("+CLCC: 1,0,2,0,0,\"+15161218005\",145,\"Hansen\",0,1").unwrap();
        assert_eq!(call.number.as_deref(), Some("+15161218005"));
        assert_eq!(call.toa, Some(145));
        assert_eq!(call.name.as_deref(), Some("Hansen"));
        assert_eq!(call.number_presentation, 1);
        assert_eq!(call.name_presentation, 1);
    }

    #[test]
    fn test_number_without_cause_is_allowed() {
        let call = parse_clcc_line("+CLCC: 2,1,4,0,0,\"0701234567\",129").unwrap();
        assert_eq!(call.state, CallState::Incoming);
        assert!(call.is_mt);
        assert_eq!(call.number_presentation, 0);
    }

    #[test]
    fn test_data_call_is_not_voice() {
        let call = parse_clcc_line("+CLCC: 1,0,0,1,0").unwrap();
        assert!(!call.is_voice);
        assert_eq!(call.state, CallState::Active);
    }

    #[test]
    fn test_invalid_state_rejected() {
        assert!(parse_clcc_line("+CLCC: 1,0,9,0,0").is_none());
    }

    #[test]
    fn test_waiting_call() {
        let call = parse_clcc_line("+CLCC: 3,1,5,0,0").unwrap();
        assert_eq!(call.state, CallState::Waiting);
    }
}
