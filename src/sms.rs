//! SMS: the acknowledge gate and the messaging request handlers.
//!
//! The host must acknowledge every delivered SMS and status report before
//! the next may be surfaced. The gate keeps one `outstanding` flag and a
//! FIFO of held PDUs; arrival order is preserved within and across the two
//! kinds.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::at::Tokenizer;
use crate::engine::Ctx;
use crate::error::{RilError, CMS_NETWORK_TIMEOUT, CMS_NO_NETWORK_SERVICE};
use crate::host::HostEnv;
use crate::requests::{BroadcastRange, RilResponse, Unsolicited};

/// SMSC placeholder prepended when the host supplies none; the modem then
/// uses its configured service centre.
const DEFAULT_SMSC: &str = "00";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeldKind {
    NewSms,
    StatusReport,
}

struct GateInner {
    outstanding: bool,
    held: VecDeque<(HeldKind, String)>,
}

/// At-most-one outstanding new-message indication toward the host.
pub struct SmsGate {
    inner: Mutex<GateInner>,
}

impl Default for SmsGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SmsGate {
    pub fn new() -> Self {
        SmsGate {
            inner: Mutex::new(GateInner {
                outstanding: false,
                held: VecDeque::new(),
            }),
        }
    }

    /// `+CMT:` delivered a new SMS PDU.
    pub fn on_new_sms(&self, pdu: &str, host: &dyn HostEnv) {
        self.deliver(HeldKind::NewSms, pdu.to_string(), host);
    }

    /// `+CDS:` delivered a status report. The baseband does not prepend
    /// the SMSC length octet there, but the host expects one.
    pub fn on_status_report(&self, pdu: &str, host: &dyn HostEnv) {
        self.deliver(HeldKind::StatusReport, format!("00{pdu}"), host);
    }

    fn deliver(&self, kind: HeldKind, pdu: String, host: &dyn HostEnv) {
        let mut inner = self.inner.lock().unwrap();
        if inner.outstanding {
            info!("previous SMS not yet acknowledged, holding PDU");
            inner.held.push_back((kind, pdu));
        } else {
            inner.outstanding = true;
            host.unsolicited(indication(kind, pdu));
        }
    }

    /// Host acknowledged the outstanding indication: surface the next held
    /// PDU, or clear the gate.
    pub fn acknowledge(&self, host: &dyn HostEnv) {
        let mut inner = self.inner.lock().unwrap();
        match inner.held.pop_front() {
            Some((kind, pdu)) => {
                host.unsolicited(indication(kind, pdu));
            }
            None => inner.outstanding = false,
        }
    }

    #[cfg(test)]
    fn outstanding(&self) -> bool {
        self.inner.lock().unwrap().outstanding
    }
}

fn indication(kind: HeldKind, pdu: String) -> Unsolicited {
    match kind {
        HeldKind::NewSms => Unsolicited::NewSms(pdu),
        HeldKind::StatusReport => Unsolicited::NewSmsStatusReport(pdu),
    }
}

/// Decode a `+CBM:` broadcast PDU: exactly 88 octets of hex.
pub fn decode_broadcast_pdu(pdu: &str) -> Option<Vec<u8>> {
    if pdu.len() != 2 * 88 {
        warn!("broadcast message length {} != 176, discarding", pdu.len());
        return None;
    }
    (0..88)
        .map(|i| u8::from_str_radix(&pdu[2 * i..2 * i + 2], 16).ok())
        .collect()
}

/// Parse a `+CMTI: "SM",<index>` new-SMS-on-SIM indication.
pub fn parse_cmti(line: &str) -> Option<i32> {
    let mut tok = Tokenizer::new(line)?;
    let mem = tok.next_str()?;
    if !mem.starts_with("SM") {
        return None;
    }
    tok.next_int()
}

// ── Request handlers ────────────────────────────────────────────────────

/// SEND_SMS: two-stage `AT+CMGS` send. CMS 331/332 (no network service /
/// network timeout) report as retryable to the host.
pub fn send_sms(ctx: &Ctx, smsc: Option<&str>, pdu: &str) -> Result<RilResponse, RilError> {
    let tp_layer_length = pdu.len() / 2;
    let smsc = smsc.unwrap_or(DEFAULT_SMSC);

    let command = format!("AT+CMGS={tp_layer_length}");
    let payload = format!("{smsc}{pdu}");

    let response = ctx
        .chan
        .send_sms(&command, &payload, "+CMGS:")
        .map_err(|e| match e.cms_error() {
            Some(CMS_NO_NETWORK_SERVICE | CMS_NETWORK_TIMEOUT) => RilError::SmsSendFailRetry,
            _ => RilError::GenericFailure,
        })?;

    let line = response.first_line().ok_or(RilError::GenericFailure)?;
    let message_ref = Tokenizer::new(line)
        .and_then(|mut t| t.next_int())
        .ok_or(RilError::GenericFailure)?;

    Ok(RilResponse::SmsSent { message_ref })
}

/// GET_SMSC_ADDRESS via `AT+CSCA?`.
pub fn get_smsc_address(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let response = ctx.chan.send_singleline("AT+CSCA?", "+CSCA:")?;
    let line = response.first_line().ok_or(RilError::GenericFailure)?;
    let smsc = Tokenizer::new(line)
        .and_then(|mut t| t.next_str().map(str::to_string))
        .ok_or(RilError::GenericFailure)?;
    Ok(RilResponse::SmscAddress(smsc))
}

/// SET_SMSC_ADDRESS via `AT+CSCA=`.
pub fn set_smsc_address(ctx: &Ctx, smsc: &str) -> Result<RilResponse, RilError> {
    ctx.chan.send(&format!("AT+CSCA=\"{smsc}\""))?;
    Ok(RilResponse::None)
}

/// Service-id list accepted from the modem, e.g. `4352,4354-4356`.
fn parse_mids(mids: &str) -> Vec<BroadcastRange> {
    let mut ranges = Vec::new();
    for part in mids.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (from, to) = match part.split_once('-') {
            Some((a, b)) => (a.trim().parse().ok(), b.trim().parse().ok()),
            None => {
                let v = part.parse().ok();
                (v, v)
            }
        };
        if let (Some(from_service_id), Some(to_service_id)) = (from, to) {
            ranges.push(BroadcastRange {
                from_service_id,
                to_service_id,
            });
        }
    }
    ranges
}

/// GET_BROADCAST_SMS_CONFIG via `AT+CSCB?`.
pub fn get_broadcast_config(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let response = ctx.chan.send_singleline("AT+CSCB?", "+CSCB:")?;
    let line = response.first_line().ok_or(RilError::GenericFailure)?;

    let mut tok = Tokenizer::new(line).ok_or(RilError::GenericFailure)?;
    let _mode = tok.next_int().ok_or(RilError::GenericFailure)?;
    let mids = tok.next_str().ok_or(RilError::GenericFailure)?;

    Ok(RilResponse::BroadcastConfig(parse_mids(mids)))
}

/// SET_BROADCAST_SMS_CONFIG via `AT+CSCB=0,"..."`.
pub fn set_broadcast_config(ctx: &Ctx, ranges: &[BroadcastRange]) -> Result<RilResponse, RilError> {
    if ranges.is_empty() {
        return Err(RilError::GenericFailure);
    }
    let mids = ranges
        .iter()
        .map(|r| format!("{}-{}", r.from_service_id, r.to_service_id))
        .collect::<Vec<_>>()
        .join(",");

    ctx.chan.send(&format!("AT+CSCB=0,\"{mids}\""))?;
    Ok(RilResponse::None)
}

/// SMS_BROADCAST_ACTIVATION: read `AT+CNMI?` and rewrite only the `<bm>`
/// parameter.
pub fn broadcast_activation(ctx: &Ctx, activate: bool) -> Result<RilResponse, RilError> {
    let response = ctx.chan.send_singleline("AT+CNMI?", "+CNMI:")?;
    let line = response.first_line().ok_or(RilError::GenericFailure)?;

    let mut tok = Tokenizer::new(line).ok_or(RilError::GenericFailure)?;
    let mode = tok.next_int().ok_or(RilError::GenericFailure)?;
    let mt = tok.next_int().ok_or(RilError::GenericFailure)?;
    let _bm = tok.next_int().ok_or(RilError::GenericFailure)?;
    let ds = tok.next_int().ok_or(RilError::GenericFailure)?;
    let bfr = tok.next_int().ok_or(RilError::GenericFailure)?;

    let bm = if activate { 2 } else { 0 };
    ctx.chan
        .send(&format!("AT+CNMI={mode},{mt},{bm},{ds},{bfr}"))?;
    Ok(RilResponse::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::RecordingHost;

    #[test]
    fn test_receive_and_ack() {
        let (host, _crx, urx) = RecordingHost::new();
        let gate = SmsGate::new();

        gate.on_new_sms("0791AA", &host);
        assert_eq!(
            urx.try_recv().unwrap(),
            Unsolicited::NewSms("0791AA".into())
        );
        assert!(gate.outstanding());

        gate.acknowledge(&host);
        assert!(!gate.outstanding());
        assert!(urx.try_recv().is_err());

        // A later SMS surfaces immediately.
        gate.on_new_sms("0791BB", &host);
        assert_eq!(
            urx.try_recv().unwrap(),
            Unsolicited::NewSms("0791BB".into())
        );
    }

    #[test]
    fn test_back_pressure_holds_and_replays_in_order() {
        let (host, _crx, urx) = RecordingHost::new();
        let gate = SmsGate::new();

        gate.on_new_sms("01", &host);
        gate.on_new_sms("02", &host);
        gate.on_new_sms("03", &host);

        // Only the first is visible.
        assert_eq!(urx.try_recv().unwrap(), Unsolicited::NewSms("01".into()));
        assert!(urx.try_recv().is_err());

        gate.acknowledge(&host);
        assert_eq!(urx.try_recv().unwrap(), Unsolicited::NewSms("02".into()));

        gate.acknowledge(&host);
        assert_eq!(urx.try_recv().unwrap(), Unsolicited::NewSms("03".into()));

        gate.acknowledge(&host);
        assert!(!gate.outstanding());
    }

    #[test]
    fn test_cross_type_order_preserved() {
        let (host, _crx, urx) = RecordingHost::new();
        let gate = SmsGate::new();

        gate.on_new_sms("01", &host);
        gate.on_status_report("AA", &host);
        gate.on_new_sms("02", &host);

        assert_eq!(urx.try_recv().unwrap(), Unsolicited::NewSms("01".into()));
        gate.acknowledge(&host);
        assert_eq!(
            urx.try_recv().unwrap(),
            Unsolicited::NewSmsStatusReport("00AA".into())
        );
        gate.acknowledge(&host);
        assert_eq!(urx.try_recv().unwrap(), Unsolicited::NewSms("02".into()));
    }

    #[test]
    fn test_status_report_gets_smsc_prepend() {
        let (host, _crx, urx) = RecordingHost::new();
        let gate = SmsGate::new();
        gate.on_status_report("07916407", &host);
        assert_eq!(
            urx.try_recv().unwrap(),
            Unsolicited::NewSmsStatusReport("0007916407".into())
        );
    }

    #[test]
    fn test_broadcast_pdu_decode() {
        let pdu = "AB".repeat(88);
        let decoded = decode_broadcast_pdu(&pdu).unwrap();
        assert_eq!(decoded.len(), 88);
        assert!(decoded.iter().all(|&b| b == 0xab));

        assert!(decode_broadcast_pdu("ABCD").is_none());
        let bad = "XY".repeat(88);
        assert!(decode_broadcast_pdu(&bad).is_none());
    }

    #[test]
    fn test_parse_cmti() {
        assert_eq!(parse_cmti("+CMTI: \"SM\",3"), Some(3));
        assert_eq!(parse_cmti("+CMTI: \"ME\",3"), None);
        assert_eq!(parse_cmti("+CMTI: \"SM\""), None);
    }

    #[test]
    fn test_parse_mids() {
        let ranges = parse_mids("4352,4354-4356");
        assert_eq!(
            ranges,
            vec![
                BroadcastRange {
                    from_service_id: 4352,
                    to_service_id: 4352
                },
                BroadcastRange {
                    from_service_id: 4354,
                    to_service_id: 4356
                },
            ]
        );
        assert!(parse_mids("").is_empty());
    }
}
