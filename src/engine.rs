//! The engine object: owns the queues, the state cells, and the worker
//! threads that open the transports and serve requests.
//!
//! One worker per queue, each with its own transport and AT channel. A
//! worker's life: open transport (retrying with backoff) → watch for
//! `EMRDY` → handshake and channel init → open its queue → serve requests
//! and scheduled events until the queue closes → release the channel and
//! start over. Queue close is triggered by transport loss or command
//! timeout, and recovery is simply the next trip around that loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::at::{AtChannel, AtResponse, Tokenizer};
use crate::config::{Config, TransportSpec};
use crate::error::{AtError, PdpFailCause, RilError};
use crate::host::HostEnv;
use crate::netif::Properties;
use crate::queue::{QueueId, RequestQueue, Work};
use crate::requests::{
    AppType, RegDeniedReason, RequestCode, RilRequest, RilResponse, Task, Token, Unsolicited,
};
use crate::sim;
use crate::sms::SmsGate;
use crate::state::{
    check_admission, is_prio_request, Connection, RadioState, StateCell,
};
use crate::transport::{Transport, READY_BANNER_WINDOW, REOPEN_DELAY};
use crate::{calls, network, pdp, sms, unsol};

/// Reported by the host vtable's version query.
pub const VERSION_STRING: &str = concat!("rild ", env!("CARGO_PKG_VERSION"));

/// Command deadline on the priority channel.
const PRIO_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Handler context: the worker's channel plus the engine state. Scheduled
/// events and unsolicited handlers that must never send commands get
/// [`EngineShared`] alone.
pub struct Ctx<'a> {
    pub chan: &'a AtChannel,
    pub engine: &'a EngineShared,
}

/// State shared by workers, readers, and the host-facing API.
pub struct EngineShared {
    host: Arc<dyn HostEnv>,
    radio: StateCell<RadioState>,
    screen: StateCell<bool>,
    connection: Mutex<Connection>,
    last_pdp_fail: StateCell<PdpFailCause>,
    pending_hotswap: AtomicBool,
    reg_denied: StateCell<Option<RegDeniedReason>>,
    gate: SmsGate,
    properties: Properties,
    uicc_type: Mutex<Option<AppType>>,
    normal: RequestQueue,
    prio: RequestQueue,
    iface: String,
    running: AtomicBool,
}

impl EngineShared {
    fn new(host: Arc<dyn HostEnv>, iface: String, has_prio: bool) -> Self {
        EngineShared {
            host,
            radio: StateCell::new(RadioState::Unavailable),
            screen: StateCell::new(true),
            connection: Mutex::new(Connection::unknown()),
            last_pdp_fail: StateCell::new(PdpFailCause::Unspecified),
            pending_hotswap: AtomicBool::new(false),
            reg_denied: StateCell::new(None),
            gate: SmsGate::new(),
            properties: Properties::new(),
            uicc_type: Mutex::new(None),
            normal: RequestQueue::new("normal", true),
            prio: RequestQueue::new("prio", has_prio),
            iface,
            running: AtomicBool::new(true),
        }
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio.get()
    }

    /// Change the radio state and run the attached side effects: the host
    /// notification and the follow-up work each state brings with it.
    pub fn set_radio_state(&self, new: RadioState) {
        let old = self.radio.set(new);
        if old == new && new != RadioState::SimLockedOrAbsent {
            return;
        }
        if old != new && !old.can_transition_to(new) {
            // Keep going: the modem is the source of truth, but leave a
            // trace for the log reader.
            warn!("irregular radio state transition {old:?} -> {new:?}");
        }

        self.host.unsolicited(Unsolicited::RadioStateChanged(new));

        match new {
            RadioState::SimReady => {
                self.enqueue_event(QueueId::Priority, Duration::ZERO, Task::SimReadyInit);
            }
            RadioState::SimNotReady => {
                self.enqueue_event(QueueId::Normal, Duration::ZERO, Task::RadioPowerOn);
            }
            _ => {}
        }
    }

    pub fn screen_on(&self) -> bool {
        self.screen.get()
    }

    pub fn connection(&self) -> Connection {
        *self.connection.lock().unwrap()
    }

    pub fn set_connection(&self, connection: Connection) {
        *self.connection.lock().unwrap() = connection;
    }

    pub fn last_pdp_fail(&self) -> PdpFailCause {
        self.last_pdp_fail.get()
    }

    pub fn set_last_pdp_fail(&self, cause: PdpFailCause) {
        self.last_pdp_fail.set(cause);
    }

    pub fn pending_hotswap(&self) -> bool {
        self.pending_hotswap.load(Ordering::SeqCst)
    }

    pub fn set_pending_hotswap(&self, pending: bool) {
        self.pending_hotswap.store(pending, Ordering::SeqCst);
    }

    /// Why the last registration query was denied, if it was.
    pub fn reg_denied_reason(&self) -> Option<RegDeniedReason> {
        self.reg_denied.get()
    }

    pub fn set_reg_denied_reason(&self, reason: Option<RegDeniedReason>) {
        self.reg_denied.set(reason);
    }

    pub fn gate(&self) -> &SmsGate {
        &self.gate
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn cached_uicc_type(&self) -> Option<AppType> {
        *self.uicc_type.lock().unwrap()
    }

    pub fn cache_uicc_type(&self, detected: AppType) {
        *self.uicc_type.lock().unwrap() = Some(detected);
    }

    pub fn host(&self) -> &dyn HostEnv {
        self.host.as_ref()
    }

    pub fn host_unsolicited(&self, indication: Unsolicited) {
        self.host.unsolicited(indication);
    }

    pub fn notify_sim_status_changed(&self) {
        self.host.unsolicited(Unsolicited::SimStatusChanged);
    }

    pub fn complete_request(&self, token: Token, result: Result<RilResponse, RilError>) {
        self.host.request_complete(token, result);
    }

    /// Enqueue a host request on the queue its code belongs to. Runs on
    /// the caller's thread and never blocks on modem traffic.
    pub fn submit(&self, request: RilRequest, token: Token) {
        let queue = if self.prio.is_enabled() && is_prio_request(request.code()) {
            &self.prio
        } else {
            &self.normal
        };
        queue.enqueue_request(request, token);
    }

    /// Schedule a task. Priority targets fall through to the normal queue
    /// when no priority channel exists; `Both` lands independent copies.
    pub fn enqueue_event(&self, target: QueueId, delay: Duration, task: Task) {
        match target {
            QueueId::Normal => self.normal.enqueue_event(delay, task),
            QueueId::Priority => {
                if self.prio.is_enabled() {
                    self.prio.enqueue_event(delay, task);
                } else {
                    self.normal.enqueue_event(delay, task);
                }
            }
            QueueId::Both => {
                self.normal.enqueue_event(delay, task.clone());
                if self.prio.is_enabled() {
                    self.prio.enqueue_event(delay, task);
                }
            }
        }
    }

    fn close_queues(&self) {
        self.normal.close();
        if self.prio.is_enabled() {
            self.prio.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(host: Arc<dyn HostEnv>) -> Arc<EngineShared> {
        let shared = Arc::new(EngineShared::new(host, "usb0".to_string(), true));
        shared.radio.set(RadioState::SimReady);
        shared.normal.open();
        shared.prio.open();
        shared
    }

    #[cfg(test)]
    pub(crate) fn take_prio_work(&self) -> (Option<Task>, Option<crate::queue::QueuedRequest>) {
        match self.prio.next_work() {
            Work::Items { event, request } => (event, request),
            Work::Closed => (None, None),
        }
    }
}

/// Which queue a worker serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Normal,
    Priority,
}

/// The RIL engine. Owns the worker threads; the host talks to it through
/// the vtable-shaped methods below.
pub struct Engine {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Validate the configuration, spawn the workers, and return. The
    /// radio comes up asynchronously; the host polls `current_state`.
    pub fn start(config: &Config, host: Arc<dyn HostEnv>) -> Result<Engine, String> {
        let primary = config.primary_transport()?;
        let priority = config.priority_transport();
        let has_prio = priority.is_some();

        let shared = Arc::new(EngineShared::new(host, config.iface.clone(), has_prio));
        let mut workers = Vec::new();

        let normal_shared = shared.clone();
        workers.push(
            thread::Builder::new()
                .name("ril-worker".into())
                .spawn(move || queue_runner(&normal_shared, &primary, Role::Normal, has_prio))
                .map_err(|e| format!("spawn worker: {e}"))?,
        );

        if let Some(priority) = priority {
            let prio_shared = shared.clone();
            workers.push(
                thread::Builder::new()
                    .name("ril-worker-prio".into())
                    .spawn(move || queue_runner(&prio_shared, &priority, Role::Priority, true))
                    .map_err(|e| format!("spawn prio worker: {e}"))?,
            );
        }

        info!("{VERSION_STRING} started (iface {})", config.iface);
        Ok(Engine {
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    // ── Host vtable surface ─────────────────────────────────────────────

    pub fn on_request(&self, request: RilRequest, token: Token) {
        self.shared.submit(request, token);
    }

    pub fn current_state(&self) -> RadioState {
        self.shared.radio_state()
    }

    pub fn supports(&self, _code: RequestCode) -> bool {
        true
    }

    /// Best-effort: a request already being processed completes normally.
    pub fn cancel(&self, token: Token) {
        info!("cancel requested for {token:?} (best-effort, ignored)");
    }

    pub fn version(&self) -> &'static str {
        VERSION_STRING
    }

    /// Run `callback` on the normal queue after `delay`.
    pub fn request_timed_callback(
        &self,
        callback: Arc<dyn Fn() + Send + Sync>,
        delay: Duration,
    ) {
        self.shared
            .enqueue_event(QueueId::Normal, delay, Task::Callback(callback));
    }

    /// Stop the workers and wait for them.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.close_queues();
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }

    /// Block until the workers exit (they normally never do).
    pub fn join(&self) {
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

fn open_transport(spec: &TransportSpec) -> Result<Transport, String> {
    match spec {
        TransportSpec::Tty { device } => Transport::open_tty(device),
        TransportSpec::Tcp { host, port } => Transport::open_tcp(host.as_deref(), *port),
    }
}

/// A worker's whole life. One per queue.
fn queue_runner(shared: &Arc<EngineShared>, spec: &TransportSpec, role: Role, has_prio: bool) {
    info!("queue runner starting ({role:?})");

    while shared.running.load(Ordering::SeqCst) {
        let transport = match open_transport(spec) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                error!("failed to open AT channel ({e}), retrying in {REOPEN_DELAY:?}");
                thread::sleep(REOPEN_DELAY);
                continue;
            }
        };

        transport.wait_for_ready(READY_BANNER_WINDOW);

        let unsol_shared = shared.clone();
        let chan = AtChannel::open(
            transport,
            Box::new(move |line, pdu| unsol::route(&unsol_shared, line, pdu)),
        );

        let closed_shared = shared.clone();
        chan.set_on_closed(move || {
            if !closed_shared.pending_hotswap() {
                closed_shared.set_radio_state(RadioState::Unavailable);
            }
            closed_shared.close_queues();
        });

        let timeout_shared = shared.clone();
        chan.set_on_timeout(move |c| {
            warn!("AT channel timeout; recovering");
            c.send_escape();
            timeout_shared.set_radio_state(RadioState::Unavailable);
            timeout_shared.close_queues();
        });

        if chan.handshake().is_err() {
            error!("handshake failed");
            chan.close();
            continue;
        }

        if initialize_common(shared, &chan).is_err() {
            error!("failed to initialize channel");
            chan.close();
            continue;
        }

        let queue = match role {
            Role::Normal => &shared.normal,
            Role::Priority => &shared.prio,
        };

        match role {
            Role::Normal => {
                queue.open();
                if initialize_main_channel(shared, &chan).is_err() {
                    error!("failed to initialize main channel");
                    queue.close();
                    chan.close();
                    continue;
                }
            }
            Role::Priority => {
                queue.open();
                chan.set_timeout(PRIO_COMMAND_TIMEOUT);
            }
        }

        // With a single channel the normal worker also carries the
        // priority-channel subscriptions.
        if !has_prio || role == Role::Priority {
            let _ = initialize_prio_channel(&chan);
        }

        info!("queue runner ({role:?}): serving");
        loop {
            match queue.next_work() {
                Work::Closed => {
                    warn!("queue runner ({role:?}): queue closed, recovering");
                    break;
                }
                Work::Items { event, request } => {
                    let ctx = Ctx {
                        chan: &chan,
                        engine: shared,
                    };
                    if let Some(task) = event {
                        run_task(&ctx, task);
                    }
                    if let Some(item) = request {
                        dispatch(&ctx, item.request, item.token);
                    }
                }
            }
        }

        chan.close();
    }

    info!("queue runner ({role:?}): stopped");
}

/// Tolerate an `ERROR` final (some firmware rejects individual init
/// verbs) but propagate channel-level failures.
fn best_effort(result: Result<AtResponse, AtError>) -> Result<(), AtError> {
    match result {
        Ok(_) | Err(AtError::Generic { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Channel init common to both queues: echo/result formats, error
/// reporting, connection and hot-swap event subscriptions, call setup
/// defaults.
fn initialize_common(shared: &EngineShared, chan: &AtChannel) -> Result<(), AtError> {
    shared.set_pending_hotswap(false);
    shared.set_connection(Connection::unknown());

    // E0: no echo, Q0: result codes on, V1: verbose result codes.
    best_effort(chan.send("ATE0Q0V1"))?;
    best_effort(chan.send("AT+CSCS=\"UTF-8\""))?;
    // No automatic answer.
    best_effort(chan.send("ATS0=0"))?;
    // Numeric +CME ERROR results.
    best_effort(chan.send("AT+CMEE=1"))?;
    // Connection state reports.
    best_effort(chan.send("AT*E2NAP=1"))?;
    // Hot-swap reports are optional on some firmware.
    let _ = chan.send("AT*EESIMSWAP=1");
    best_effort(chan.send("AT+COLP=0"))?;
    best_effort(chan.send("AT+CR=0"))?;
    // DCD follows the connection; ignore DTR.
    best_effort(chan.send("AT&C=1"))?;
    best_effort(chan.send("AT&D=0"))?;
    best_effort(chan.send("AT+CRC=0"))?;
    // 9600 bps V.32 non-transparent bearer, single-slot HSCSD.
    best_effort(chan.send("AT+CBST=7,0,1;+CHSN=1,1,0,4"))?;
    best_effort(chan.send("ATX3"))?;
    Ok(())
}

/// Is the radio currently powered? (`+CFUN:` 1, 5, and 6 all transmit.)
fn is_radio_on(chan: &AtChannel) -> bool {
    let Ok(response) = chan.send_singleline("AT+CFUN?", "+CFUN:") else {
        // Assume off on error.
        return false;
    };
    let fun = response
        .first_line()
        .and_then(|l| Tokenizer::new(l)?.next_int());
    matches!(fun, Some(1 | 5 | 6))
}

/// Main-channel init, while still in minimum functionality.
fn initialize_main_channel(shared: &EngineShared, chan: &AtChannel) -> Result<(), AtError> {
    shared.set_radio_state(RadioState::Off);

    best_effort(chan.send("AT+CGREG=2"))?;
    // Minimum functionality until the host asks for power.
    best_effort(chan.send("AT+CFUN=4"))?;

    if is_radio_on(chan) {
        shared.set_radio_state(RadioState::SimNotReady);
    }
    Ok(())
}

/// Priority-channel init: PIN insertion reports.
fn initialize_prio_channel(chan: &AtChannel) -> Result<(), AtError> {
    best_effort(chan.send("AT*EPEE=1"))
}

/// Post-SIM-ready initialization, all best-effort, exactly this order.
fn on_sim_ready(ctx: &Ctx) {
    let chan = ctx.chan;
    // GSM message service, phase 2.
    let _ = chan.send("AT+CSMS=0");
    // Deliver SMS and status reports straight to us; cell broadcast too.
    let _ = chan.send("AT+CNMI=2,2,2,1,0");
    let _ = chan.send("AT+CPMS=\"SM\",\"SM\",\"SM\"");
    // Registration reports with location; some tethered modems only
    // accept the plain variant.
    if chan.send("AT+CREG=2").is_err() {
        let _ = chan.send("AT+CREG=1");
    }
    let _ = chan.send("AT*EREG=0");
    let _ = chan.send("AT+CCWA=1");
    let _ = chan.send("AT+CMUT=0");
    let _ = chan.send("AT+CSSN=1,1");
    let _ = chan.send("AT+CUSD=1");
    let _ = chan.send("AT+CGEREP=1,0");
    // PDU mode.
    let _ = chan.send("AT+CMGF=0");
    let _ = chan.send("AT*ETZR=2");
    let _ = chan.send("AT*ECAM=1");
    let _ = chan.send("AT*STKC=1,\"000000000000000000\"");
    let _ = chan.send("AT+CMER=3,0,0,1");
}

/// Run one scheduled event.
fn run_task(ctx: &Ctx, task: Task) {
    match task {
        Task::PollSimState { force } => sim::poll_sim_state(ctx, force),
        Task::SimResetProbe => sim::sim_reset_probe(ctx),
        Task::PollSignalStrength { fallback_bars } => {
            network::poll_signal_strength(ctx, fallback_bars);
        }
        Task::PollOperatorSelected { token, loops } => {
            network::poll_operator_selected(ctx, token, loops);
        }
        Task::DataCallListChanged => pdp::on_data_call_list_changed(ctx),
        Task::SimReadyInit => on_sim_ready(ctx),
        Task::RadioPowerOn => {
            ctx.engine.enqueue_event(
                QueueId::Priority,
                Duration::ZERO,
                Task::PollSimState { force: false },
            );
        }
        Task::Callback(callback) => callback(),
    }
}

// ── Request handlers living with the engine ─────────────────────────────

fn get_imsi(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let response = ctx.chan.send_numeric("AT+CIMI")?;
    let imsi = response.first_line().ok_or(RilError::GenericFailure)?;
    Ok(RilResponse::Imsi(imsi.to_string()))
}

fn get_imei(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let response = ctx.chan.send_numeric("AT+CGSN")?;
    let imei = response.first_line().ok_or(RilError::GenericFailure)?;
    Ok(RilResponse::Imei(imei.to_string()))
}

fn baseband_version(ctx: &Ctx) -> Result<RilResponse, RilError> {
    let response = ctx.chan.send_singleline("AT+CGMR", "")?;
    let version = response.first_line().ok_or(RilError::GenericFailure)?;
    Ok(RilResponse::BasebandVersion(version.to_string()))
}

/// RADIO_POWER: `AT+CFUN=1` into the attach path, `AT+CFUN=4` back to
/// minimum functionality.
fn radio_power(ctx: &Ctx, on: bool) -> Result<RilResponse, RilError> {
    let state = ctx.engine.radio_state();

    if !on && state != RadioState::Off {
        ctx.chan.send("AT+CFUN=4")?;
        ctx.engine.set_radio_state(RadioState::Off);
    } else if on && state == RadioState::Off {
        ctx.chan.send("AT+CFUN=1")?;
        ctx.engine.set_radio_state(RadioState::SimNotReady);
    } else {
        warn!("radio power request is a no-op in state {state:?}");
        return Err(RilError::GenericFailure);
    }
    Ok(RilResponse::None)
}

/// SCREEN_STATE: with the screen off the host does not need unsolicited
/// network reports, so turn them off to save wakeups.
fn screen_state(ctx: &Ctx, on: bool) -> Result<RilResponse, RilError> {
    ctx.engine.screen.set(on);

    if on {
        ctx.chan.send("AT+CREG=2")?;
        ctx.chan.send("AT+CGREG=2")?;
        ctx.chan.send("AT+CGEREP=1,0")?;
        ctx.chan.send("AT+CMER=3,0,0,1")?;
    } else {
        ctx.chan.send("AT+CREG=0")?;
        ctx.chan.send("AT+CGREG=0")?;
        ctx.chan.send("AT+CGEREP=0,0")?;
    }
    Ok(RilResponse::None)
}

/// Dispatch one admitted request to its handler and complete the token.
fn dispatch(ctx: &Ctx, request: RilRequest, token: Token) {
    let code = request.code();
    let state = ctx.engine.radio_state();
    info!("processing {code:?}");

    if let Some(err) = check_admission(state, code) {
        ctx.engine.complete_request(token, Err(err));
        return;
    }

    // Call listing is admitted while locked only so the host can clear
    // stale call screens; it still reports the radio unavailable.
    if code == RequestCode::GetCurrentCalls && state == RadioState::SimLockedOrAbsent {
        ctx.engine
            .complete_request(token, Err(RilError::RadioNotAvailable));
        return;
    }

    let result = match request {
        RilRequest::GetSimStatus => sim::get_card_status(ctx),
        RilRequest::EnterSimPin { pin } => sim::enter_sim_pin(ctx, &pin),
        RilRequest::EnterSimPuk { puk, new_pin } => sim::enter_sim_puk(ctx, &puk, &new_pin),
        RilRequest::EnterNetworkDepersonalization { code } => {
            sim::enter_network_depersonalization(ctx, &code)
        }
        RilRequest::ChangeSimPin { old_pin, new_pin } => {
            sim::change_sim_pin(ctx, &old_pin, &new_pin)
        }
        RilRequest::GetCurrentCalls => calls::get_current_calls(ctx),
        RilRequest::GetImsi => get_imsi(ctx),
        RilRequest::GetImei => get_imei(ctx),
        RilRequest::BasebandVersion => baseband_version(ctx),
        RilRequest::RadioPower { on } => radio_power(ctx, on),
        RilRequest::ScreenState { on } => {
            let result = screen_state(ctx, on);
            if result.is_ok() && on {
                // Rehash network values after the blackout.
                ctx.engine.host_unsolicited(Unsolicited::NetworkStateChanged);
            }
            result
        }
        RilRequest::SignalStrength => network::signal_strength(ctx),
        RilRequest::RegistrationState => network::registration_state(ctx),
        RilRequest::GprsRegistrationState => network::gprs_registration_state(ctx),
        RilRequest::Operator => network::operator(ctx),
        RilRequest::QueryNetworkSelectionMode => network::query_network_selection_mode(ctx),
        RilRequest::SetNetworkSelectionAutomatic => {
            // Completion is deferred to the operator poll event.
            match network::set_network_selection_automatic(ctx, token) {
                Ok(()) => return,
                Err(e) => Err(e),
            }
        }
        RilRequest::SetupDataCall {
            apn,
            user,
            password,
            auth,
        } => pdp::setup_data_call(ctx, &apn, &user, &password, auth),
        RilRequest::DeactivateDataCall => pdp::deactivate_data_call(ctx),
        RilRequest::LastDataCallFailCause => pdp::last_data_call_fail_cause(ctx),
        RilRequest::DataCallList => pdp::data_call_list(ctx),
        RilRequest::SendSms { smsc, pdu } => sms::send_sms(ctx, smsc.as_deref(), &pdu),
        RilRequest::SmsAcknowledge => {
            ctx.engine.gate().acknowledge(ctx.engine.host());
            Ok(RilResponse::None)
        }
        RilRequest::GetSmscAddress => sms::get_smsc_address(ctx),
        RilRequest::SetSmscAddress { smsc } => sms::set_smsc_address(ctx, &smsc),
        RilRequest::GetBroadcastConfig => sms::get_broadcast_config(ctx),
        RilRequest::SetBroadcastConfig { ranges } => sms::set_broadcast_config(ctx, &ranges),
        RilRequest::BroadcastActivation { activate } => sms::broadcast_activation(ctx, activate),
    };

    ctx.engine.complete_request(token, result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::testing::RecordingHost;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    /// A scripted modem on loopback: sends EMRDY, then answers every
    /// command line, with specific replies for the interesting verbs and
    /// a plain OK otherwise.
    fn fake_modem(listener: TcpListener, overrides: Vec<(&'static str, Vec<&'static str>)>) {
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut stream = stream;
            stream.write_all(b"\r\nEMRDY: 1\r\n").unwrap();

            loop {
                let mut cmd = Vec::new();
                if reader.read_until(b'\r', &mut cmd).unwrap_or(0) == 0 {
                    return;
                }
                let cmd = String::from_utf8_lossy(&cmd).trim().to_string();
                if cmd.is_empty() {
                    continue;
                }
                match overrides.iter().find(|(c, _)| *c == cmd) {
                    Some((_, lines)) => {
                        for line in lines {
                            let _ = stream.write_all(format!("\r\n{line}").as_bytes());
                        }
                        let _ = stream.write_all(b"\r\n");
                    }
                    None => {
                        let _ = stream.write_all(b"\r\nOK\r\n");
                    }
                }
            }
        });
    }

    fn engine_with_ready_sim() -> (Engine, std::sync::mpsc::Receiver<(Token, Result<RilResponse, RilError>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        fake_modem(
            listener,
            vec![
                ("AT+CFUN?", vec!["+CFUN: 1", "OK"]),
                ("AT+CPIN?", vec!["+CPIN: READY", "OK"]),
                ("AT+CIMI", vec!["240080123456789", "OK"]),
                ("AT+CGSN", vec!["357042101234567", "OK"]),
                ("AT+CSQ", vec!["+CSQ: 17,99", "OK"]),
            ],
        );

        let (host, completions, _indications) = RecordingHost::new();
        let config = Config {
            port: Some(port),
            ..Config::default()
        };
        let engine = Engine::start(&config, Arc::new(host)).unwrap();
        (engine, completions)
    }

    fn wait_for_state(engine: &Engine, want: RadioState) {
        let deadline = std::time::Instant::now() + Duration::from_secs(20);
        while engine.current_state() != want {
            assert!(
                std::time::Instant::now() < deadline,
                "never reached {want:?}, stuck at {:?}",
                engine.current_state()
            );
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_engine_comes_up_to_sim_ready() {
        let (engine, _completions) = engine_with_ready_sim();
        wait_for_state(&engine, RadioState::SimReady);
        engine.shutdown();
    }

    #[test]
    fn test_request_round_trip() {
        let (engine, completions) = engine_with_ready_sim();
        wait_for_state(&engine, RadioState::SimReady);

        engine.on_request(RilRequest::GetImsi, Token(11));
        let (token, result) = completions.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(token, Token(11));
        assert_eq!(result, Ok(RilResponse::Imsi("240080123456789".into())));

        engine.on_request(RilRequest::SignalStrength, Token(12));
        let (token, result) = completions.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(token, Token(12));
        assert_eq!(result, Ok(RilResponse::SignalStrength { rssi: 17, ber: 99 }));

        engine.shutdown();
    }

    #[test]
    fn test_denied_registration_reads_detailed_cause() {
        use crate::requests::RegistrationInfo;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        fake_modem(
            listener,
            vec![
                ("AT+CFUN?", vec!["+CFUN: 1", "OK"]),
                ("AT+CPIN?", vec!["+CPIN: READY", "OK"]),
                ("AT+CREG?", vec!["+CREG: 2,3", "OK"]),
                ("AT*E2REG?", vec!["*E2REG: 0,16", "OK"]),
            ],
        );

        let (host, completions, _indications) = RecordingHost::new();
        let config = Config {
            port: Some(port),
            ..Config::default()
        };
        let engine = Engine::start(&config, Arc::new(host)).unwrap();
        wait_for_state(&engine, RadioState::SimReady);

        engine.on_request(RilRequest::RegistrationState, Token(21));
        let (token, result) = completions.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(token, Token(21));
        assert_eq!(
            result,
            Ok(RilResponse::Registration(RegistrationInfo {
                status: 3,
                lac: None,
                cid: None,
                network_type: None,
                denied_reason: Some(RegDeniedReason::ImsiUnknownInHlr),
            }))
        );
        assert_eq!(
            engine.shared().reg_denied_reason(),
            Some(RegDeniedReason::ImsiUnknownInHlr)
        );
        engine.shutdown();
    }

    #[test]
    fn test_requests_complete_in_submission_order() {
        let (engine, completions) = engine_with_ready_sim();
        wait_for_state(&engine, RadioState::SimReady);

        engine.on_request(RilRequest::GetImsi, Token(1));
        engine.on_request(RilRequest::GetImei, Token(2));
        engine.on_request(RilRequest::GetImsi, Token(3));

        let tokens: Vec<Token> = (0..3)
            .map(|_| completions.recv_timeout(Duration::from_secs(10)).unwrap().0)
            .collect();
        assert_eq!(tokens, vec![Token(1), Token(2), Token(3)]);
        engine.shutdown();
    }

    #[test]
    fn test_version_string() {
        assert!(VERSION_STRING.starts_with("rild "));
    }
}
