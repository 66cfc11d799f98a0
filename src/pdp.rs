//! PDP context management — the data-call setup path and its helpers.
//!
//! Setup programs the context and authentication, starts the network
//! attach, waits on the connection state machine driven by `*E2NAP:`
//! indications, reads back the IP configuration, and configures the
//! kernel interface. Any failure records a last-fail cause, detaches
//! best-effort, and reports a generic failure.

use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::at::{AtChannel, Tokenizer};
use crate::engine::Ctx;
use crate::error::{AtError, PdpFailCause, RilError};
use crate::netif;
use crate::requests::{AuthType, DataCallInfo, RilResponse, Unsolicited};
use crate::state::{Connection, ConnectionState};

/// Attach wait: 85 rounds of 200 ms ≈ 17 s.
const ATTACH_WAIT_ROUNDS: u32 = 85;
const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Detach wait: up to 85 s of 1 s `AT*ENAP?` polls.
const DETACH_WAIT_ROUNDS: u32 = 85;
const DETACH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// `AT*ENAP?` connection states.
const ENAP_NOT_CONNECTED: i32 = 0;
const ENAP_CONNECTED: i32 = 1;
const ENAP_CONNECTING: i32 = 2;

/// The one PDP context this modem family exposes.
const CONTEXT_ID: i32 = 1;

// ── UCS-2 hex strings ───────────────────────────────────────────────────

/// Encode a string as the 4-hex-digits-per-code-unit form the modem
/// accepts for non-ASCII credentials while the TE character set is UCS-2.
pub fn ucs2_encode(s: &str) -> String {
    s.encode_utf16().map(|u| format!("{u:04x}")).collect()
}

/// Inverse of [`ucs2_encode`].
pub fn ucs2_decode(hex: &str) -> Option<String> {
    if hex.len() % 4 != 0 {
        return None;
    }
    let units: Option<Vec<u16>> = (0..hex.len() / 4)
        .map(|i| u16::from_str_radix(&hex[4 * i..4 * i + 4], 16).ok())
        .collect();
    String::from_utf16(&units?).ok()
}

/// `AT*EIAAUW` authentication bitmask for the host's auth selection:
/// `<PAP may><CHAP may>` bits inside the modem's five-bit field.
pub fn auth_bitmask(auth: AuthType) -> &'static str {
    match auth {
        AuthType::None => "00001",
        AuthType::Pap => "00011",
        AuthType::Chap => "00101",
        AuthType::PapOrChap => "00111",
    }
}

// ── Character set dance ─────────────────────────────────────────────────

/// Character sets from which we must switch to UCS-2 before programming
/// credentials. Anything else is assumed to already be UCS-2.
fn needs_charset_switch(charset: &str) -> bool {
    charset == "GSM" || charset == "IRA" || charset.starts_with("8859") || charset == "UTF-8"
}

/// Scoped switch of the TE character set to UCS-2. Restores the previous
/// set on drop, so every exit path of the credential programming puts the
/// modem back.
struct CharsetGuard<'a> {
    chan: &'a AtChannel,
    original: String,
}

impl<'a> CharsetGuard<'a> {
    fn enter_ucs2(chan: &'a AtChannel) -> Result<Self, AtError> {
        let response = chan.send_singleline("AT+CSCS?", "+CSCS:")?;
        let current = response
            .first_line()
            .and_then(|l| Tokenizer::new(l)?.next_str().map(str::to_string))
            .ok_or(AtError::InvalidResponse)?;

        let original = if needs_charset_switch(&current) {
            chan.send("AT+CSCS=\"UCS2\"")?;
            current
        } else {
            "UCS2".to_string()
        };
        Ok(CharsetGuard { chan, original })
    }
}

impl Drop for CharsetGuard<'_> {
    fn drop(&mut self) {
        // The modem is in UCS-2 now, so the charset name itself must be
        // UCS-2 encoded.
        let name = ucs2_encode(&self.original);
        if self.chan.send(&format!("AT+CSCS=\"{name}\"")).is_err() {
            warn!("failed to restore character set {}", self.original);
        }
    }
}

// ── IP configuration parsing ────────────────────────────────────────────

/// Addresses read back from `AT*E2IPCFG?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpConfig {
    pub address: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns1: Option<Ipv4Addr>,
    pub dns2: Option<Ipv4Addr>,
}

/// Parse the `(stat,"address")` tuple sequence:
///
/// ```text
/// *E2IPCFG: (1,"10.155.68.129")(2,"10.155.68.131")(3,"80.251.192.244")(3,"80.251.192.245")
/// ```
///
/// stat 1 is the local address, 2 the gateway, 3 a DNS server (the first
/// two DNS entries are kept).
pub fn parse_e2ipcfg(line: &str) -> IpConfig {
    let mut config = IpConfig::default();
    let mut rest = line;

    while let Some(open) = rest.find('(') {
        let Some(close) = rest[open..].find(')') else {
            break;
        };
        let tuple = &rest[open + 1..open + close];
        rest = &rest[open + close + 1..];

        let mut tok = Tokenizer::bare(tuple);
        let Some(stat) = tok.next_int() else { continue };
        let Some(addr) = tok.next_str().and_then(|s| s.parse::<Ipv4Addr>().ok()) else {
            continue;
        };

        match stat {
            1 => config.address = Some(addr),
            2 => config.gateway = Some(addr),
            3 => {
                if config.dns1.is_none() {
                    config.dns1 = Some(addr);
                } else if config.dns2.is_none() {
                    config.dns2 = Some(addr);
                }
            }
            _ => {}
        }
    }
    config
}

// ── Handlers ────────────────────────────────────────────────────────────

fn record_fail_cause(ctx: &Ctx) {
    let Connection { state, cause } = ctx.engine.connection();
    let fail = match (state, cause) {
        (ConnectionState::Connected, _) | (_, None) => PdpFailCause::Unspecified,
        (_, Some(cause)) => PdpFailCause::from_cause(cause),
    };
    ctx.engine.set_last_pdp_fail(fail);
}

fn wait_for_attach(ctx: &Ctx) -> ConnectionState {
    for _ in 0..ATTACH_WAIT_ROUNDS {
        let state = ctx.engine.connection().state;
        if state == ConnectionState::Connected || state == ConnectionState::Disconnected {
            return state;
        }
        std::thread::sleep(ATTACH_POLL_INTERVAL);
    }
    ctx.engine.connection().state
}

/// SETUP_DATA_CALL.
pub fn setup_data_call(
    ctx: &Ctx,
    apn: &str,
    user: &str,
    password: &str,
    auth: AuthType,
) -> Result<RilResponse, RilError> {
    info!("requesting data connection to APN '{apn}'");
    ctx.engine.set_connection(Connection::unknown());
    ctx.engine.set_last_pdp_fail(PdpFailCause::Unspecified);

    match setup_data_call_inner(ctx, apn, user, password, auth) {
        Ok(response) => {
            ctx.engine.host_unsolicited(Unsolicited::NetworkStateChanged);
            Ok(response)
        }
        Err(e) => {
            warn!("data call setup failed: {e:?}");
            record_fail_cause(ctx);
            // Best-effort detach so the next attempt starts clean.
            let _ = ctx.chan.send("AT*ENAP=0");
            Err(RilError::GenericFailure)
        }
    }
}

#[derive(Debug)]
enum SetupError {
    At(AtError),
    Interface(std::io::Error),
    Attach(ConnectionState),
    BadIpConfig,
}

impl From<AtError> for SetupError {
    fn from(e: AtError) -> Self {
        SetupError::At(e)
    }
}

fn setup_data_call_inner(
    ctx: &Ctx,
    apn: &str,
    user: &str,
    password: &str,
    auth: AuthType,
) -> Result<RilResponse, SetupError> {
    let iface = ctx.engine.iface();

    // Start from a known-down interface.
    netif::interface_down(iface).map_err(SetupError::Interface)?;

    ctx.chan
        .send(&format!("AT+CGDCONT={CONTEXT_ID},\"IP\",\"{apn}\""))?;

    // The module only takes non-ASCII credentials in UCS-2, so the
    // programming happens inside a scoped charset switch.
    {
        let _guard = CharsetGuard::enter_ucs2(ctx.chan)?;
        let at_user = ucs2_encode(user);
        let at_pass = ucs2_encode(password);
        ctx.chan.send(&format!(
            "AT*EIAAUW={CONTEXT_ID},1,\"{at_user}\",\"{at_pass}\",{}",
            auth_bitmask(auth)
        ))?;
    }

    ctx.chan.send("AT*ENAP=1,1")?;

    let state = wait_for_attach(ctx);
    if state != ConnectionState::Connected {
        return Err(SetupError::Attach(state));
    }

    let response = ctx.chan.send_singleline("AT*E2IPCFG?", "*E2IPCFG:")?;
    let config = parse_e2ipcfg(response.first_line().unwrap_or_default());
    let (Some(address), Some(gateway)) = (config.address, config.gateway) else {
        return Err(SetupError::BadIpConfig);
    };

    // A disconnect can race the configuration read.
    if ctx.engine.connection().state == ConnectionState::Disconnected {
        return Err(SetupError::Attach(ConnectionState::Disconnected));
    }

    netif::configure(
        iface,
        address,
        gateway,
        config.dns1,
        config.dns2,
        ctx.engine.properties(),
    )
    .map_err(SetupError::Interface)?;

    if ctx.engine.connection().state == ConnectionState::Disconnected {
        return Err(SetupError::Attach(ConnectionState::Disconnected));
    }

    debug!("data call up on {iface}: {address} via {gateway}");
    Ok(RilResponse::DataCall(DataCallInfo {
        cid: CONTEXT_ID,
        active: true,
        pdp_type: "IP".to_string(),
        apn: apn.to_string(),
        address: address.to_string(),
        iface: Some(iface.to_string()),
    }))
}

fn query_enap(chan: &AtChannel) -> Result<i32, AtError> {
    let response = chan.send_singleline("AT*ENAP?", "*ENAP:")?;
    response
        .first_line()
        .and_then(|l| Tokenizer::new(l)?.next_int())
        .ok_or(AtError::InvalidResponse)
}

/// DEACTIVATE_DATA_CALL: stop the attach and poll until the modem reports
/// disconnected, then drop the interface.
pub fn deactivate_data_call(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let mut enap = query_enap(ctx.chan).map_err(|_| RilError::GenericFailure)?;

    if enap == ENAP_CONNECTING {
        warn!("deactivating while connection setup still in progress");
    }

    if enap == ENAP_CONNECTED {
        ctx.chan.send("AT*ENAP=0")?;
        for _ in 0..DETACH_WAIT_ROUNDS {
            enap = query_enap(ctx.chan).map_err(|_| RilError::GenericFailure)?;
            if enap == ENAP_NOT_CONNECTED {
                break;
            }
            std::thread::sleep(DETACH_POLL_INTERVAL);
        }
        if enap != ENAP_NOT_CONNECTED {
            return Err(RilError::GenericFailure);
        }
        netif::interface_down(ctx.engine.iface()).map_err(|_| RilError::GenericFailure)?;
    }

    Ok(RilResponse::None)
}

/// Current context, shared by DATA_CALL_LIST and the unsolicited
/// data-call-list-changed report.
pub fn query_data_call_list(ctx: &Ctx) -> Result<Option<DataCallInfo>, RilError> {
    let response = ctx
        .chan
        .send_multiline("AT+CGDCONT?", "+CGDCONT:")
        .map_err(|_| RilError::GenericFailure)?;

    let Some(line) = response.first_line() else {
        return Ok(None);
    };
    let mut tok = Tokenizer::new(line).ok_or(RilError::GenericFailure)?;
    let cid = tok.next_int().ok_or(RilError::GenericFailure)?;
    let pdp_type = tok.next_str().ok_or(RilError::GenericFailure)?.to_string();
    let apn = tok.next_str().ok_or(RilError::GenericFailure)?.to_string();
    let address = tok.next_str().ok_or(RilError::GenericFailure)?.to_string();

    Ok(Some(DataCallInfo {
        cid,
        active: ctx.engine.connection().state == ConnectionState::Connected,
        pdp_type,
        apn,
        address,
        iface: None,
    }))
}

/// DATA_CALL_LIST.
pub fn data_call_list(ctx: &Ctx) -> Result<RilResponse, RilError> {
    Ok(RilResponse::DataCallList(query_data_call_list(ctx)?))
}

/// Scheduled data-call-list-changed event: re-query and notify the host.
pub fn on_data_call_list_changed(ctx: &Ctx) {
    let list = query_data_call_list(ctx).ok().flatten();
    ctx.engine
        .host_unsolicited(Unsolicited::DataCallListChanged(list));
}

/// LAST_DATA_CALL_FAIL_CAUSE.
pub fn last_data_call_fail_cause(ctx: &Ctx) -> Result<RilResponse, RilError> {
    Ok(RilResponse::LastDataCallFailCause(
        ctx.engine.last_pdp_fail(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ucs2_ascii_roundtrip() {
        for s in ["", "user", "p4ss.word", "The quick brown fox!"] {
            assert_eq!(ucs2_decode(&ucs2_encode(s)).as_deref(), Some(s));
        }
    }

    #[test]
    fn test_ucs2_known_encoding() {
        assert_eq!(ucs2_encode("AB"), "00410042");
        assert_eq!(ucs2_encode("å"), "00e5");
    }

    #[test]
    fn test_ucs2_decode_rejects_odd_length() {
        assert!(ucs2_decode("041").is_none());
        assert!(ucs2_decode("zzzz").is_none());
    }

    #[test]
    fn test_auth_bitmask() {
        assert_eq!(auth_bitmask(AuthType::None), "00001");
        assert_eq!(auth_bitmask(AuthType::Pap), "00011");
        assert_eq!(auth_bitmask(AuthType::Chap), "00101");
        assert_eq!(auth_bitmask(AuthType::PapOrChap), "00111");
    }

    #[test]
    fn test_charset_switch_sets() {
        assert!(needs_charset_switch("GSM"));
        assert!(needs_charset_switch("IRA"));
        assert!(needs_charset_switch("8859-1"));
        assert!(needs_charset_switch("UTF-8"));
        assert!(!needs_charset_switch("UCS2"));
        assert!(!needs_charset_switch("HEX"));
    }

    #[test]
    fn test_e2ipcfg_full() {
        let config = parse_e2ipcfg(
            "*E2IPCFG: (1,\"10.155.68.129\")(2,\"10.155.68.131\")(3,\"80.251.192.244\")(3,\"80.251.192.245\")",
        );
        assert_eq!(config.address, Some(Ipv4Addr::new(10, 155, 68, 129)));
        assert_eq!(config.gateway, Some(Ipv4Addr::new(10, 155, 68, 131)));
        assert_eq!(config.dns1, Some(Ipv4Addr::new(80, 251, 192, 244)));
        assert_eq!(config.dns2, Some(Ipv4Addr::new(80, 251, 192, 245)));
    }

    #[test]
    fn test_e2ipcfg_dns_capped_at_two() {
        let config = parse_e2ipcfg("*E2IPCFG: (3,\"1.1.1.1\")(3,\"2.2.2.2\")(3,\"3.3.3.3\")");
        assert_eq!(config.dns1, Some(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(config.dns2, Some(Ipv4Addr::new(2, 2, 2, 2)));
    }

    #[test]
    fn test_e2ipcfg_minimal() {
        let config = parse_e2ipcfg("*E2IPCFG: (1,\"10.0.0.2\")(2,\"10.0.0.1\")(3,\"8.8.8.8\")");
        assert_eq!(config.address, Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(config.gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(config.dns1, Some(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(config.dns2, None);
    }

    #[test]
    fn test_e2ipcfg_malformed_tuples_skipped() {
        let config = parse_e2ipcfg("*E2IPCFG: (x,\"bad\")(1,\"not-an-ip\")(2,\"10.0.0.1\")");
        assert_eq!(config.address, None);
        assert_eq!(config.gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_e2ipcfg_empty() {
        assert_eq!(parse_e2ipcfg("*E2IPCFG: "), IpConfig::default());
    }
}
