//! Unsolicited-line router.
//!
//! Runs on a channel's reader thread. Handlers here classify by anchored
//! prefix and either notify the host, update a state cell, or schedule
//! work on the request queues — they receive [`EngineShared`] only, so
//! issuing an AT command from this path does not compile.

use std::time::Duration;

use tracing::{debug, warn};

use crate::at::Tokenizer;
use crate::engine::EngineShared;
use crate::error::PdpFailCause;
use crate::network;
use crate::queue::QueueId;
use crate::requests::{Task, Unsolicited};
use crate::sim;
use crate::sms;
use crate::state::{Connection, ConnectionState, RadioState};

/// Route one unsolicited line. `pdu` carries the payload line of the
/// SMS-style two-line indications.
pub fn route(engine: &EngineShared, line: &str, pdu: Option<&str>) {
    // Until the first channel initialization finishes the host will poll
    // initial state itself; stray early reports carry nothing useful.
    if engine.radio_state() == RadioState::Unavailable {
        return;
    }

    if line.starts_with("*ETZV:") {
        // With the screen off CREG reports are disabled; NITZ still
        // implies the network moved, so nudge the host either way.
        engine.host_unsolicited(Unsolicited::NetworkStateChanged);
        match network::parse_nitz(line) {
            Some(nitz) => engine.host_unsolicited(Unsolicited::NitzTimeReceived(nitz)),
            None => warn!("failed to parse NITZ line: {line}"),
        }
    } else if line.starts_with("*EPEV") {
        // PIN inserted and accepted; the SIM may be usable now.
        engine.enqueue_event(
            QueueId::Priority,
            Duration::ZERO,
            Task::PollSimState { force: false },
        );
    } else if line.starts_with("*ESIMSR") {
        on_sim_state_changed(engine, line);
    } else if line.starts_with("*E2NAP:") {
        on_connection_state_changed(engine, line);
    } else if line.starts_with("*EESIMSWAP:") {
        on_sim_hotswap(engine, line);
    } else if line.starts_with("+CRING:") || line.starts_with("RING") {
        engine.host_unsolicited(Unsolicited::CallRing);
    } else if line.starts_with("NO CARRIER") || line.starts_with("+CCWA") || line.starts_with("BUSY")
    {
        engine.host_unsolicited(Unsolicited::CallStateChanged);
    } else if line.starts_with("+CREG:") || line.starts_with("+CGREG:") {
        engine.host_unsolicited(Unsolicited::NetworkStateChanged);
    } else if line.starts_with("+CMT:") {
        match pdu {
            Some(pdu) => engine.gate().on_new_sms(pdu, engine.host()),
            None => warn!("+CMT: without PDU line"),
        }
    } else if line.starts_with("+CBM:") {
        if let Some(message) = pdu.and_then(sms::decode_broadcast_pdu) {
            engine.host_unsolicited(Unsolicited::NewBroadcastSms(message));
        }
    } else if line.starts_with("+CMTI:") {
        match sms::parse_cmti(line) {
            Some(index) => engine.host_unsolicited(Unsolicited::NewSmsOnSim(index)),
            None => warn!("failed to parse +CMTI line: {line}"),
        }
    } else if line.starts_with("+CDS:") {
        match pdu {
            Some(pdu) => engine.gate().on_status_report(pdu, engine.host()),
            None => warn!("+CDS: without PDU line"),
        }
    } else if line.starts_with("+CIEV: 2") {
        let fallback_bars = network::ciev_bars_to_rssi(line);
        engine.enqueue_event(
            QueueId::Priority,
            Duration::ZERO,
            Task::PollSignalStrength { fallback_bars },
        );
    } else if line.starts_with("+CSSI:") {
        on_supp_service(engine, line, false);
    } else if line.starts_with("+CSSU:") {
        on_supp_service(engine, line, true);
    } else if line.starts_with("+CUSD:") {
        on_ussd(engine, line);
    } else if line.starts_with("*STKEND") {
        engine.host_unsolicited(Unsolicited::StkSessionEnd);
    } else {
        debug!("unhandled unsolicited line: {line}");
    }
}

/// `*ESIMSR: <state>` — SIM state changed. State 7 is the powered-off
/// condition that the reset loop tries to recover.
fn on_sim_state_changed(engine: &EngineShared, line: &str) {
    engine.notify_sim_status_changed();

    // Re-check the SIM regardless of radio state; this can move the radio
    // to locked/absent.
    engine.enqueue_event(
        QueueId::Priority,
        Duration::ZERO,
        Task::PollSimState { force: true },
    );

    let Some(state) = Tokenizer::new(line).and_then(|mut t| t.next_int()) else {
        warn!("failed to parse SIM state line: {line}");
        return;
    };
    if sim::esimsr_needs_reset(state) {
        engine.enqueue_event(QueueId::Priority, Duration::ZERO, Task::SimResetProbe);
    }
}

/// `*E2NAP: <state>[,<cause>]` — connection state machine input. The
/// cause only accompanies disconnects.
fn on_connection_state_changed(engine: &EngineShared, line: &str) {
    let Some(mut tok) = Tokenizer::new(line) else {
        return;
    };
    let Some(state) = tok.next_int().and_then(ConnectionState::from_code) else {
        warn!("invalid connection state line: {line}");
        return;
    };
    let cause = tok.next_int().filter(|&c| c >= 0);

    engine.set_connection(Connection {
        state,
        cause,
    });
    debug!("connection state now {state:?} (cause {cause:?})");

    if state != ConnectionState::Connected {
        if let Some(cause) = cause {
            engine.set_last_pdp_fail(PdpFailCause::from_cause(cause));
        }
    }

    if state != ConnectionState::Connecting {
        engine.enqueue_event(QueueId::Priority, Duration::ZERO, Task::DataCallListChanged);
    }
}

/// `*EESIMSWAP: 0|1` — SIM removed / inserted at runtime.
fn on_sim_hotswap(engine: &EngineShared, line: &str) {
    match Tokenizer::new(line).and_then(|mut t| t.next_int()) {
        Some(0) => {
            warn!("SIM removed");
            engine.set_radio_state(RadioState::SimLockedOrAbsent);
        }
        Some(1) => {
            warn!("SIM inserted, re-attach pending");
            engine.set_pending_hotswap(true);
        }
        _ => warn!("unknown hot swap event: {line}"),
    }
}

/// `+CSSI: <code>[,<index>]` / `+CSSU: <code>[,<index>]`.
/// The index accompanies only specific codes (call-on-hold pictures and
/// forwarded-call notifications).
fn on_supp_service(engine: &EngineShared, line: &str, mt: bool) {
    let Some(mut tok) = Tokenizer::new(line) else {
        return;
    };
    let Some(code) = tok.next_int() else {
        warn!("failed to parse supplementary service line: {line}");
        return;
    };
    let index = if code == 16 || (!mt && code == 4) || (mt && code == 1) {
        tok.next_int()
    } else {
        None
    };
    engine.host_unsolicited(Unsolicited::SuppServiceNotification { mt, code, index });
}

/// `+CUSD: <m>[,<str>[,<dcs>]]`. Modes 0 and 1 carry a message; the
/// `<dcs>` parameter is ignored.
fn on_ussd(engine: &EngineShared, line: &str) {
    let Some(mut tok) = Tokenizer::new(line) else {
        return;
    };
    let Some(mode) = tok.next_int().filter(|m| (0..=5).contains(m)) else {
        warn!("invalid USSD line: {line}");
        return;
    };
    let message = if mode < 2 {
        tok.next_str().map(str::to_string)
    } else {
        None
    };
    engine.host_unsolicited(Unsolicited::UssdReceived { mode, message });
}
