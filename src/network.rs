//! Network registration, signal strength, operator, and NITZ handling.

use std::time::Duration;

use tracing::{debug, warn};

use crate::at::Tokenizer;
use crate::engine::Ctx;
use crate::error::RilError;
use crate::queue::QueueId;
use crate::requests::{RegDeniedReason, RegistrationInfo, RilResponse, Task, Token, Unsolicited};

/// Registration states per 27.007 (`<stat>`).
pub const REG_HOME: i32 = 1;
pub const REG_DENIED: i32 = 3;
pub const REG_ROAMING: i32 = 5;

/// Operator-selection poll: every 2 s, give up after 30 rounds (60 s).
const OPERATOR_POLL_DELAY: Duration = Duration::from_secs(2);
const OPERATOR_POLL_ROUNDS: u32 = 30;

/// Raw fields of a `+CREG`/`+CGREG` response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegParse {
    pub status: i32,
    pub lac: Option<u32>,
    pub cid: Option<u32>,
    pub act: Option<i32>,
}

/// Parse any of the five registration response shapes:
///
/// ```text
/// <stat>
/// <n>,<stat>
/// <stat>,<lac>,<cid>
/// <n>,<stat>,<lac>,<cid>   or   <stat>,<lac>,<cid>,<AcT>
/// <n>,<stat>,<lac>,<cid>,<AcT>
/// ```
///
/// The solicited form carries the leading `<n>`; the unsolicited form can
/// sneak in without it, and LAC/CID only appear when registered.
pub fn parse_registration(line: &str) -> Option<RegParse> {
    let mut tok = Tokenizer::new(line)?;

    match tok.remaining_commas() {
        0 => Some(RegParse {
            status: tok.next_int()?,
            lac: None,
            cid: None,
            act: None,
        }),
        1 => {
            let _n = tok.next_int()?;
            Some(RegParse {
                status: tok.next_int()?,
                lac: None,
                cid: None,
                act: None,
            })
        }
        2 => Some(RegParse {
            status: tok.next_int()?,
            lac: tok.next_hex(),
            cid: tok.next_hex(),
            act: None,
        }),
        3 => {
            let first = tok.next_int()?;
            if tok.peek().starts_with('"') {
                // <stat>,<lac>,<cid>,<AcT>
                Some(RegParse {
                    status: first,
                    lac: tok.next_hex(),
                    cid: tok.next_hex(),
                    act: tok.next_int(),
                })
            } else {
                // <n>,<stat>,<lac>,<cid>
                Some(RegParse {
                    status: tok.next_int()?,
                    lac: tok.next_hex(),
                    cid: tok.next_hex(),
                    act: None,
                })
            }
        }
        4 => {
            let _n = tok.next_int()?;
            Some(RegParse {
                status: tok.next_int()?,
                lac: tok.next_hex(),
                cid: tok.next_hex(),
                act: tok.next_int(),
            })
        }
        _ => None,
    }
}

/// Map a `+CGREG` `<AcT>` value onto the host's network-type code
/// (1 GPRS, 2 EDGE, 3 UMTS, 9 HSDPA, 10 HSUPA, 11 HSPA).
pub fn act_to_network_type(act: i32) -> i32 {
    match act {
        0 => 1,
        2 => 3,
        3 => 2,
        4 => 9,
        5 => 10,
        6 => 11,
        _ => 0,
    }
}

/// Render parsed registration for the host: LAC as four lowercase hex
/// digits, CID as eight.
pub fn render_registration(parse: RegParse) -> RegistrationInfo {
    RegistrationInfo {
        status: parse.status,
        lac: parse.lac.map(|v| format!("{v:04x}")),
        cid: parse.cid.map(|v| format!("{v:08x}")),
        network_type: parse.act.map(act_to_network_type),
        denied_reason: None,
    }
}

/// Map the `AT*E2REG?` detailed cause onto a denial reason. Unknown
/// causes read as the general rejection.
pub fn denied_reason_from_cause(cause: i32) -> RegDeniedReason {
    match cause {
        3 => RegDeniedReason::NetworkFailure,
        8 => RegDeniedReason::PlmnNotAllowed,
        9 => RegDeniedReason::LocationAreaNotAllowed,
        10 => RegDeniedReason::RoamingNotAllowed,
        12 => RegDeniedReason::NoSuitableCellInLocationArea,
        13 => RegDeniedReason::AuthenticationFailure,
        16 => RegDeniedReason::ImsiUnknownInHlr,
        17 => RegDeniedReason::IllegalMs,
        18 => RegDeniedReason::IllegalMe,
        _ => RegDeniedReason::General,
    }
}

/// Denial reasons that no amount of re-polling will fix: the network has
/// rejected this subscriber or this equipment outright.
pub fn selection_hopeless(reason: Option<RegDeniedReason>) -> bool {
    matches!(
        reason,
        Some(RegDeniedReason::ImsiUnknownInHlr | RegDeniedReason::IllegalMe)
    )
}

/// Refine the reported network type with `*ERINFO?` radio info
/// (`*ERINFO: <n>,<gsm>,<umts>`; umts 1 = UMTS, 2+ = HSDPA-capable).
pub fn refine_network_type(umts_rinfo: i32, parsed: Option<i32>) -> Option<i32> {
    match umts_rinfo {
        u if u >= 2 => Some(9),
        1 => Some(3),
        _ => parsed,
    }
}

fn registration_query(ctx: &Ctx, verb: &str, prefix: &str) -> Result<RegParse, RilError> {
    // With the screen off the unsolicited registration reports are turned
    // off too; briefly re-enable so the solicited query has fresh data.
    let screen_on = ctx.engine.screen_on();
    if !screen_on {
        let _ = ctx.chan.send(&format!("AT{verb}=2"));
    }

    let result = ctx
        .chan
        .send_singleline(&format!("AT{verb}?"), prefix)
        .map(|r| r.first_line().unwrap_or_default().to_string());

    if !screen_on {
        let _ = ctx.chan.send(&format!("AT{verb}=0"));
    }

    let line = result.map_err(|_| RilError::GenericFailure)?;
    parse_registration(&line).ok_or(RilError::GenericFailure)
}

/// REGISTRATION_STATE via `AT+CREG?`. A denied registration additionally
/// reads the detailed cause from `AT*E2REG?`; the stored reason lets the
/// operator-selection poll fail fast on hopeless subscribers.
pub fn registration_state(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let parse = registration_query(ctx, "+CREG", "+CREG:")?;
    let mut info = render_registration(parse);

    if parse.status == REG_DENIED {
        let response = ctx
            .chan
            .send_singleline("AT*E2REG?", "*E2REG:")
            .map_err(|_| RilError::GenericFailure)?;
        let cause = response
            .first_line()
            .and_then(|l| {
                let mut tok = Tokenizer::new(l)?;
                let _n = tok.next_int()?;
                tok.next_int()
            })
            .ok_or(RilError::GenericFailure)?;

        let reason = denied_reason_from_cause(cause);
        warn!("registration denied: {reason:?} (cause {cause})");
        info.denied_reason = Some(reason);
        ctx.engine.set_reg_denied_reason(Some(reason));
    } else {
        ctx.engine.set_reg_denied_reason(None);
    }

    Ok(RilResponse::Registration(info))
}

/// GPRS_REGISTRATION_STATE via `AT+CGREG?`, refined with `*ERINFO?` when
/// registered.
pub fn gprs_registration_state(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let parse = registration_query(ctx, "+CGREG", "+CGREG:")?;
    let mut info = render_registration(parse);

    if parse.status == REG_HOME || parse.status == REG_ROAMING {
        if let Ok(response) = ctx.chan.send_singleline("AT*ERINFO?", "*ERINFO:") {
            let umts = response
                .first_line()
                .and_then(|l| {
                    let mut tok = Tokenizer::new(l)?;
                    let _n = tok.next_int()?;
                    let _gsm = tok.next_int()?;
                    tok.next_int()
                })
                .unwrap_or(0);
            info.network_type = refine_network_type(umts, info.network_type);
        }
    }

    Ok(RilResponse::Registration(info))
}

/// Parse `+CSQ: <rssi>,<ber>`.
pub fn parse_csq(line: &str) -> Option<(i32, i32)> {
    let mut tok = Tokenizer::new(line)?;
    Some((tok.next_int()?, tok.next_int()?))
}

/// SIGNAL_STRENGTH via `AT+CSQ`.
pub fn signal_strength(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let response = ctx.chan.send_singleline("AT+CSQ", "+CSQ:")?;
    let (rssi, ber) = response
        .first_line()
        .and_then(parse_csq)
        .ok_or(RilError::GenericFailure)?;
    Ok(RilResponse::SignalStrength { rssi, ber })
}

/// Scheduled CSQ poll feeding the unsolicited signal-strength report. On
/// query failure the `+CIEV`-derived bars value stands in, with an unknown
/// bit error rate.
pub fn poll_signal_strength(ctx: &Ctx, fallback_bars: i32) {
    let (rssi, ber) = ctx
        .chan
        .send_singleline("AT+CSQ", "+CSQ:")
        .ok()
        .and_then(|r| r.first_line().and_then(parse_csq))
        .unwrap_or((fallback_bars, 99));

    ctx.engine
        .host_unsolicited(Unsolicited::SignalStrength { rssi, ber });
}

/// Convert a `+CIEV: 2,<bars>` indication (0..=5 bars) to an RSSI-scale
/// fallback value for the poll above.
pub fn ciev_bars_to_rssi(line: &str) -> i32 {
    let bars = Tokenizer::new(line)
        .and_then(|mut tok| {
            let _ind = tok.next_int()?;
            tok.next_int()
        })
        .unwrap_or(0);
    if bars > 0 {
        bars * 4 - 1
    } else {
        0
    }
}

/// Reformat a `*ETZV` NITZ report for the host: the modem sends
/// `*ETZV: <tz>,"<yyyy/mm/dd,hh:mm:ss>"`; the host wants
/// `yy/mm/dd,hh:mm:ss<tz>`.
pub fn parse_nitz(line: &str) -> Option<String> {
    let mut tok = Tokenizer::new(line)?;
    let tz = tok.next_str()?;
    let time = tok.next_str()?;
    if time.len() < 2 {
        return None;
    }
    Some(format!("{}{}", &time[2..], tz))
}

/// OPERATOR: one compound command reads all three name formats.
pub fn operator(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let response = ctx.chan.send_multiline(
        "AT+COPS=3,0;+COPS?;+COPS=3,1;+COPS?;+COPS=3,2;+COPS?",
        "+COPS:",
    )?;

    if response.intermediates.len() != 3 {
        return Err(RilError::GenericFailure);
    }

    let mut names: [Option<String>; 3] = Default::default();
    for (i, line) in response.intermediates.iter().enumerate() {
        let mut tok = Tokenizer::new(line).ok_or(RilError::GenericFailure)?;
        let _mode = tok.next_int().ok_or(RilError::GenericFailure)?;
        // Only `<mode>` present means not registered; leave the name empty.
        if tok.has_more() {
            let _format = tok.next_int();
            names[i] = tok.next_str().map(str::to_string);
        }
    }

    let [long_name, short_name, numeric] = names;
    Ok(RilResponse::Operator {
        long_name,
        short_name,
        numeric,
    })
}

/// QUERY_NETWORK_SELECTION_MODE via `AT+COPS?` (0 automatic, 1 manual).
pub fn query_network_selection_mode(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let response = ctx.chan.send_singleline("AT+COPS?", "+COPS:")?;
    let mode = response
        .first_line()
        .and_then(|l| Tokenizer::new(l)?.next_int())
        .ok_or(RilError::GenericFailure)?;
    Ok(RilResponse::NetworkSelectionMode(mode))
}

/// SET_NETWORK_SELECTION_AUTOMATIC: kick the modem into automatic mode,
/// then poll until an operator is actually selected. Completion is
/// deferred to the poll event.
pub fn set_network_selection_automatic(ctx: &Ctx, token: Token) -> Result<(), RilError> {
    ctx.chan.send("AT+COPS=0")?;
    ctx.engine.enqueue_event(
        QueueId::Priority,
        OPERATOR_POLL_DELAY,
        Task::PollOperatorSelected { token, loops: 0 },
    );
    Ok(())
}

/// The deferred completion of SET_NETWORK_SELECTION_AUTOMATIC: registered
/// once `+COPS?` reports more than the bare mode.
pub fn poll_operator_selected(ctx: &Ctx, token: Token, loops: u32) {
    if loops >= OPERATOR_POLL_ROUNDS {
        warn!("operator selection never settled");
        ctx.engine
            .complete_request(token, Err(RilError::GenericFailure));
        return;
    }

    let selected = ctx
        .chan
        .send_singleline("AT+COPS?", "+COPS:")
        .ok()
        .and_then(|r| {
            let line = r.first_line()?.to_string();
            let mut tok = Tokenizer::new(&line)?;
            let _mode = tok.next_int()?;
            Some(tok.has_more())
        });

    match selected {
        Some(true) => ctx.engine.complete_request(token, Ok(RilResponse::None)),
        Some(false) => {
            // A subscriber or equipment the network has rejected outright
            // will never select; don't spin out the full minute on it.
            if selection_hopeless(ctx.engine.reg_denied_reason()) {
                ctx.engine
                    .complete_request(token, Err(RilError::IllegalSimOrMe));
                return;
            }
            debug!("no operator yet, repolling (round {})", loops + 1);
            ctx.engine.enqueue_event(
                QueueId::Priority,
                OPERATOR_POLL_DELAY,
                Task::PollOperatorSelected {
                    token,
                    loops: loops + 1,
                },
            );
        }
        None => ctx
            .engine
            .complete_request(token, Err(RilError::GenericFailure)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_stat_only() {
        let p = parse_registration("+CGREG: 1").unwrap();
        assert_eq!(p.status, 1);
        assert_eq!(p.lac, None);
        assert_eq!(p.cid, None);
        assert_eq!(p.act, None);
    }

    #[test]
    fn test_shape_n_stat() {
        let p = parse_registration("+CGREG: 2,1").unwrap();
        assert_eq!(p.status, 1);
        assert_eq!(p.lac, None);
    }

    #[test]
    fn test_shape_stat_lac_cid() {
        let p = parse_registration("+CGREG: 1,\"1A2B\",\"00001234\"").unwrap();
        assert_eq!(p.status, 1);
        assert_eq!(p.lac, Some(0x1a2b));
        assert_eq!(p.cid, Some(0x1234));
        assert_eq!(p.act, None);
    }

    #[test]
    fn test_shape_n_stat_lac_cid() {
        let p = parse_registration("+CGREG: 2,1,\"1A2B\",\"00001234\"").unwrap();
        assert_eq!(p.status, 1);
        assert_eq!(p.lac, Some(0x1a2b));
        assert_eq!(p.cid, Some(0x1234));
        assert_eq!(p.act, None);
    }

    #[test]
    fn test_shape_stat_lac_cid_act() {
        let p = parse_registration("+CGREG: 1,\"1A2B\",\"00001234\",2").unwrap();
        assert_eq!(p.status, 1);
        assert_eq!(p.lac, Some(0x1a2b));
        assert_eq!(p.cid, Some(0x1234));
        assert_eq!(p.act, Some(2));
    }

    #[test]
    fn test_shape_n_stat_lac_cid_act() {
        let p = parse_registration("+CGREG: 2,5,\"1A2B\",\"00001234\",4").unwrap();
        assert_eq!(p.status, 5);
        assert_eq!(p.act, Some(4));
    }

    #[test]
    fn test_render_lowercase_hex_widths() {
        let info = render_registration(RegParse {
            status: 1,
            lac: Some(0x1a2b),
            cid: Some(0x1234),
            act: Some(2),
        });
        assert_eq!(info.lac.as_deref(), Some("1a2b"));
        assert_eq!(info.cid.as_deref(), Some("00001234"));
        assert_eq!(info.network_type, Some(3));
    }

    #[test]
    fn test_act_mapping() {
        assert_eq!(act_to_network_type(0), 1); // GSM -> GPRS
        assert_eq!(act_to_network_type(2), 3); // UTRAN -> UMTS
        assert_eq!(act_to_network_type(3), 2); // EGPRS -> EDGE
        assert_eq!(act_to_network_type(4), 9); // HSDPA
        assert_eq!(act_to_network_type(5), 10); // HSUPA
        assert_eq!(act_to_network_type(6), 11); // HSPA
        assert_eq!(act_to_network_type(1), 0); // GSM compact unsupported
    }

    #[test]
    fn test_denied_reason_mapping() {
        assert_eq!(denied_reason_from_cause(3), RegDeniedReason::NetworkFailure);
        assert_eq!(denied_reason_from_cause(8), RegDeniedReason::PlmnNotAllowed);
        assert_eq!(
            denied_reason_from_cause(9),
            RegDeniedReason::LocationAreaNotAllowed
        );
        assert_eq!(
            denied_reason_from_cause(10),
            RegDeniedReason::RoamingNotAllowed
        );
        assert_eq!(
            denied_reason_from_cause(12),
            RegDeniedReason::NoSuitableCellInLocationArea
        );
        assert_eq!(
            denied_reason_from_cause(13),
            RegDeniedReason::AuthenticationFailure
        );
        assert_eq!(denied_reason_from_cause(16), RegDeniedReason::ImsiUnknownInHlr);
        assert_eq!(denied_reason_from_cause(17), RegDeniedReason::IllegalMs);
        assert_eq!(denied_reason_from_cause(18), RegDeniedReason::IllegalMe);
        assert_eq!(denied_reason_from_cause(99), RegDeniedReason::General);
    }

    #[test]
    fn test_selection_hopeless_only_for_subscriber_rejections() {
        assert!(selection_hopeless(Some(RegDeniedReason::ImsiUnknownInHlr)));
        assert!(selection_hopeless(Some(RegDeniedReason::IllegalMe)));
        // Transient network conditions keep polling.
        assert!(!selection_hopeless(Some(RegDeniedReason::NetworkFailure)));
        assert!(!selection_hopeless(Some(RegDeniedReason::RoamingNotAllowed)));
        assert!(!selection_hopeless(Some(RegDeniedReason::IllegalMs)));
        assert!(!selection_hopeless(None));
    }

    #[test]
    fn test_erinfo_refinement() {
        assert_eq!(refine_network_type(0, Some(1)), Some(1));
        assert_eq!(refine_network_type(1, Some(1)), Some(3));
        assert_eq!(refine_network_type(2, Some(3)), Some(9));
        assert_eq!(refine_network_type(0, None), None);
    }

    #[test]
    fn test_parse_csq() {
        assert_eq!(parse_csq("+CSQ: 15,99"), Some((15, 99)));
        assert_eq!(parse_csq("+CSQ: 31,0"), Some((31, 0)));
        assert_eq!(parse_csq("garbage"), None);
    }

    #[test]
    fn test_ciev_bars() {
        assert_eq!(ciev_bars_to_rssi("+CIEV: 2,5"), 19);
        assert_eq!(ciev_bars_to_rssi("+CIEV: 2,1"), 3);
        assert_eq!(ciev_bars_to_rssi("+CIEV: 2,0"), 0);
        assert_eq!(ciev_bars_to_rssi("+CIEV: 2"), 0);
    }

    #[test]
    fn test_nitz_reformat() {
        let nitz = parse_nitz("*ETZV: \"+04\",\"2010/05/28,12:34:56\"").unwrap();
        assert_eq!(nitz, "10/05/28,12:34:56+04");
    }

    #[test]
    fn test_nitz_malformed() {
        assert!(parse_nitz("*ETZV: \"+04\"").is_none());
        assert!(parse_nitz("nonsense").is_none());
    }
}
