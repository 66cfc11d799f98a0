//! SIM status polling, the stuck-SIM reset loop, and the SIM request
//! handlers.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::at::Tokenizer;
use crate::engine::Ctx;
use crate::error::{AtError, RilError, CME_SIM_FAILURE, CME_SIM_NOT_INSERTED};
use crate::queue::QueueId;
use crate::requests::{
    AppState, AppStatus, AppType, CardState, CardStatus, PinState, RilResponse, Task,
};
use crate::state::RadioState;

/// Delay before re-polling a SIM that answered "busy, not ready yet".
pub const SIM_POLL_DELAY: Duration = Duration::from_secs(1);

/// Cadence of the reset loop while the SIM reports powered-off.
pub const SIM_RESET_DELAY: Duration = Duration::from_secs(60);

/// `*ESIMSR` state meaning the SIM went to power-off.
const SIM_STATE_POWER_OFF: i32 = 7;

/// Outcome of a PIN-status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStatus {
    Absent,
    NotReady,
    Ready,
    Pin,
    Puk,
    NetworkPersonalization,
}

/// Classify the `AT+CPIN?` reply. Error classification: SIM-not-inserted
/// and SIM-failure both mean absent; anything else reads as still busy.
pub fn classify_cpin(result: &Result<String, AtError>) -> SimStatus {
    match result {
        Err(e) => match e.cme_error() {
            Some(CME_SIM_NOT_INSERTED) | Some(CME_SIM_FAILURE) => SimStatus::Absent,
            _ => SimStatus::NotReady,
        },
        Ok(line) => {
            let Some(value) = Tokenizer::new(line).and_then(|mut t| t.next_str().map(str::to_string))
            else {
                return SimStatus::NotReady;
            };
            match value.as_str() {
                "READY" => SimStatus::Ready,
                "SIM PIN" => SimStatus::Pin,
                "SIM PUK" => SimStatus::Puk,
                "PH-NET PIN" => SimStatus::NetworkPersonalization,
                // Unsupported lock types read as absent.
                _ => SimStatus::Absent,
            }
        }
    }
}

/// Query the SIM. Returns `NotReady` while the radio is off or gone, so
/// callers never mistake an unpowered SIM for a missing one.
pub fn get_sim_status(ctx: &Ctx) -> SimStatus {
    match ctx.engine.radio_state() {
        RadioState::Off | RadioState::Unavailable => return SimStatus::NotReady,
        _ => {}
    }

    let result = ctx
        .chan
        .send_singleline("AT+CPIN?", "+CPIN:")
        .map(|r| r.first_line().unwrap_or_default().to_string());
    classify_cpin(&result)
}

/// SIM poll: advance the radio state machine once the SIM settles, or
/// re-arm the poll while it is still coming up. `force` is set when a
/// `*ESIMSR` indication demands a re-check regardless of current state.
pub fn poll_sim_state(ctx: &Ctx, force: bool) {
    if !force
        && ctx.engine.radio_state() != RadioState::SimNotReady
        && ctx.engine.radio_state() != RadioState::SimLockedOrAbsent
    {
        // No longer meaningful to poll.
        return;
    }

    match get_sim_status(ctx) {
        SimStatus::NotReady => {
            ctx.engine.enqueue_event(
                QueueId::Priority,
                SIM_POLL_DELAY,
                Task::PollSimState { force: false },
            );
        }
        SimStatus::Ready => ctx.engine.set_radio_state(RadioState::SimReady),
        SimStatus::Absent
        | SimStatus::Pin
        | SimStatus::Puk
        | SimStatus::NetworkPersonalization => {
            ctx.engine.set_radio_state(RadioState::SimLockedOrAbsent);
        }
    }
}

/// Probe a SIM that reported power-off: pulse `AT*ESIMR` and keep probing
/// every minute until the state leaves 7, then fall back to a normal poll.
pub fn sim_reset_probe(ctx: &Ctx) {
    let state = ctx
        .chan
        .send_singleline("AT*ESIMSR?", "*ESIMSR:")
        .ok()
        .and_then(|r| {
            let line = r.first_line()?.to_string();
            let mut tok = Tokenizer::new(&line)?;
            let _cause = tok.next_int()?;
            tok.next_int()
        });

    match state {
        Some(SIM_STATE_POWER_OFF) => {
            info!("SIM still powered off, pulsing reset");
            let _ = ctx.chan.send("AT*ESIMR");
            ctx.engine
                .enqueue_event(QueueId::Priority, SIM_RESET_DELAY, Task::SimResetProbe);
        }
        Some(_) => {
            ctx.engine.notify_sim_status_changed();
            poll_sim_state(ctx, false);
        }
        None => debug!("*ESIMSR? query failed, dropping reset probe"),
    }
}

/// Does this `*ESIMSR` state code start the reset loop?
pub fn esimsr_needs_reset(state: i32) -> bool {
    state == SIM_STATE_POWER_OFF
}

// ── Card status ─────────────────────────────────────────────────────────

fn app_status(sim_status: SimStatus, app_type: AppType) -> AppStatus {
    let (app_state, pin_state) = match sim_status {
        SimStatus::Absent => (AppState::Unknown, PinState::Unknown),
        SimStatus::NotReady => (AppState::Detected, PinState::Unknown),
        SimStatus::Ready => (AppState::Ready, PinState::Unknown),
        SimStatus::Pin => (AppState::Pin, PinState::EnabledNotVerified),
        SimStatus::Puk => (AppState::Puk, PinState::EnabledBlocked),
        SimStatus::NetworkPersonalization => {
            (AppState::SubscriptionPerso, PinState::EnabledNotVerified)
        }
    };
    AppStatus {
        app_type,
        app_state,
        pin_state,
    }
}

/// Detect SIM vs USIM once and cache it. `AT+CUAD` answers OK on USIM
/// cards; legacy SIMs fail the command entirely.
fn uicc_type(ctx: &Ctx) -> AppType {
    if let Some(cached) = ctx.engine.cached_uicc_type() {
        return cached;
    }
    let detected = match ctx.chan.send_singleline("AT+CUAD", "+CUAD:") {
        Ok(_) => AppType::Usim,
        Err(AtError::Generic { .. }) => AppType::Sim,
        Err(_) => return AppType::Unknown, // retry at next request
    };
    info!("detected card type {detected:?}");
    ctx.engine.cache_uicc_type(detected);
    detected
}

/// GET_SIM_STATUS: current card state with the single GSM/WCDMA app.
pub fn get_card_status(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let sim_status = get_sim_status(ctx);

    let status = if sim_status == SimStatus::Absent {
        CardStatus {
            card_state: CardState::Absent,
            app: None,
        }
    } else {
        CardStatus {
            card_state: CardState::Present,
            app: Some(app_status(sim_status, uicc_type(ctx))),
        }
    };
    Ok(RilResponse::SimStatus(status))
}

// ── PIN handling ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinKind {
    Pin,
    Puk,
}

/// Retries left for the given function, from `AT*EPIN?`
/// (`*EPIN: <pin>,<puk>,<pin2>,<puk2>`). Best-effort; -1 when unknown.
fn pin_retries(ctx: &Ctx, kind: PinKind) -> i32 {
    let Ok(response) = ctx.chan.send_singleline("AT*EPIN?", "*EPIN:") else {
        return -1;
    };
    let Some(line) = response.first_line() else {
        return -1;
    };
    let Some(mut tok) = Tokenizer::new(line) else {
        return -1;
    };
    let pin = tok.next_int();
    let puk = tok.next_int();
    match kind {
        PinKind::Pin => pin.unwrap_or(-1),
        PinKind::Puk => puk.unwrap_or(-1),
    }
}

fn finish_unlock(ctx: &Ctx, kind: PinKind, result: Result<(), AtError>) -> Result<RilResponse, RilError> {
    match result {
        Ok(()) => {
            // The modem accepted the code; let the poll move the state on.
            ctx.engine.enqueue_event(
                QueueId::Priority,
                Duration::ZERO,
                Task::PollSimState { force: true },
            );
            Ok(RilResponse::PinRetries(pin_retries(ctx, kind)))
        }
        Err(AtError::Generic { .. }) => {
            warn!("SIM unlock rejected");
            Err(RilError::PasswordIncorrect)
        }
        Err(_) => Err(RilError::GenericFailure),
    }
}

/// ENTER_SIM_PIN via `AT+CPIN="<pin>"`.
pub fn enter_sim_pin(ctx: &Ctx, pin: &str) -> Result<RilResponse, RilError> {
    let result = ctx.chan.send(&format!("AT+CPIN=\"{pin}\"")).map(|_| ());
    finish_unlock(ctx, PinKind::Pin, result)
}

/// ENTER_SIM_PUK via `AT+CPIN="<puk>","<new pin>"`.
pub fn enter_sim_puk(ctx: &Ctx, puk: &str, new_pin: &str) -> Result<RilResponse, RilError> {
    let result = ctx
        .chan
        .send(&format!("AT+CPIN=\"{puk}\",\"{new_pin}\""))
        .map(|_| ());
    finish_unlock(ctx, PinKind::Puk, result)
}

/// ENTER_NETWORK_DEPERSONALIZATION via `AT+CPIN="<code>"`.
pub fn enter_network_depersonalization(ctx: &Ctx, code: &str) -> Result<RilResponse, RilError> {
    let result = ctx.chan.send(&format!("AT+CPIN=\"{code}\"")).map(|_| ());
    finish_unlock(ctx, PinKind::Pin, result)
}

/// CHANGE_SIM_PIN via `AT+CPWD="SC","<old>","<new>"`.
pub fn change_sim_pin(ctx: &Ctx, old_pin: &str, new_pin: &str) -> Result<RilResponse, RilError> {
    match ctx
        .chan
        .send(&format!("AT+CPWD=\"SC\",\"{old_pin}\",\"{new_pin}\""))
    {
        Ok(_) => Ok(RilResponse::PinRetries(pin_retries(ctx, PinKind::Pin))),
        Err(AtError::Generic { .. }) => Err(RilError::PasswordIncorrect),
        Err(_) => Err(RilError::GenericFailure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic(cme: Option<i32>) -> Result<String, AtError> {
        Err(AtError::Generic { cme, cms: None })
    }

    #[test]
    fn test_cpin_ready() {
        assert_eq!(classify_cpin(&Ok("+CPIN: READY".into())), SimStatus::Ready);
    }

    #[test]
    fn test_cpin_lock_states() {
        assert_eq!(classify_cpin(&Ok("+CPIN: SIM PIN".into())), SimStatus::Pin);
        assert_eq!(classify_cpin(&Ok("+CPIN: SIM PUK".into())), SimStatus::Puk);
        assert_eq!(
            classify_cpin(&Ok("+CPIN: PH-NET PIN".into())),
            SimStatus::NetworkPersonalization
        );
    }

    #[test]
    fn test_cpin_unsupported_lock_reads_absent() {
        assert_eq!(
            classify_cpin(&Ok("+CPIN: PH-CORP PIN".into())),
            SimStatus::Absent
        );
    }

    #[test]
    fn test_cme_10_and_13_both_map_to_absent() {
        assert_eq!(classify_cpin(&generic(Some(10))), SimStatus::Absent);
        assert_eq!(classify_cpin(&generic(Some(13))), SimStatus::Absent);
    }

    #[test]
    fn test_other_errors_read_not_ready() {
        assert_eq!(classify_cpin(&generic(Some(14))), SimStatus::NotReady);
        assert_eq!(classify_cpin(&generic(None)), SimStatus::NotReady);
        assert_eq!(classify_cpin(&Err(AtError::Timeout)), SimStatus::NotReady);
    }

    #[test]
    fn test_power_off_state_triggers_reset() {
        assert!(esimsr_needs_reset(7));
        assert!(!esimsr_needs_reset(0));
        assert!(!esimsr_needs_reset(2));
    }

    #[test]
    fn test_app_status_table() {
        let app = app_status(SimStatus::Pin, AppType::Usim);
        assert_eq!(app.app_state, AppState::Pin);
        assert_eq!(app.pin_state, PinState::EnabledNotVerified);

        let app = app_status(SimStatus::Puk, AppType::Sim);
        assert_eq!(app.app_state, AppState::Puk);
        assert_eq!(app.pin_state, PinState::EnabledBlocked);

        let app = app_status(SimStatus::Ready, AppType::Usim);
        assert_eq!(app.app_state, AppState::Ready);
    }
}
