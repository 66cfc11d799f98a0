//! Typed host traffic: requests, responses, unsolicited indications, and
//! the scheduled-event tasks the engine runs between requests.

use std::fmt;
use std::sync::Arc;

use crate::error::PdpFailCause;
use crate::state::RadioState;

/// Opaque completion token supplied by the host with each request and
/// echoed back on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// A host-initiated work item with its code-specific payload.
#[derive(Debug, Clone)]
pub enum RilRequest {
    GetSimStatus,
    EnterSimPin { pin: String },
    EnterSimPuk { puk: String, new_pin: String },
    EnterNetworkDepersonalization { code: String },
    ChangeSimPin { old_pin: String, new_pin: String },
    GetCurrentCalls,
    GetImsi,
    GetImei,
    BasebandVersion,
    RadioPower { on: bool },
    ScreenState { on: bool },
    SignalStrength,
    RegistrationState,
    GprsRegistrationState,
    Operator,
    QueryNetworkSelectionMode,
    SetNetworkSelectionAutomatic,
    SetupDataCall { apn: String, user: String, password: String, auth: AuthType },
    DeactivateDataCall,
    LastDataCallFailCause,
    DataCallList,
    SendSms { smsc: Option<String>, pdu: String },
    SmsAcknowledge,
    GetSmscAddress,
    SetSmscAddress { smsc: String },
    GetBroadcastConfig,
    SetBroadcastConfig { ranges: Vec<BroadcastRange> },
    BroadcastActivation { activate: bool },
}

/// Payload-free request discriminant, used by the admission policy and the
/// priority table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCode {
    GetSimStatus,
    EnterSimPin,
    EnterSimPuk,
    EnterNetworkDepersonalization,
    ChangeSimPin,
    GetCurrentCalls,
    GetImsi,
    GetImei,
    BasebandVersion,
    RadioPower,
    ScreenState,
    SignalStrength,
    RegistrationState,
    GprsRegistrationState,
    Operator,
    QueryNetworkSelectionMode,
    SetNetworkSelectionAutomatic,
    SetupDataCall,
    DeactivateDataCall,
    LastDataCallFailCause,
    DataCallList,
    SendSms,
    SmsAcknowledge,
    GetSmscAddress,
    SetSmscAddress,
    GetBroadcastConfig,
    SetBroadcastConfig,
    BroadcastActivation,
}

impl RilRequest {
    pub fn code(&self) -> RequestCode {
        match self {
            RilRequest::GetSimStatus => RequestCode::GetSimStatus,
            RilRequest::EnterSimPin { .. } => RequestCode::EnterSimPin,
            RilRequest::EnterSimPuk { .. } => RequestCode::EnterSimPuk,
            RilRequest::EnterNetworkDepersonalization { .. } => {
                RequestCode::EnterNetworkDepersonalization
            }
            RilRequest::ChangeSimPin { .. } => RequestCode::ChangeSimPin,
            RilRequest::GetCurrentCalls => RequestCode::GetCurrentCalls,
            RilRequest::GetImsi => RequestCode::GetImsi,
            RilRequest::GetImei => RequestCode::GetImei,
            RilRequest::BasebandVersion => RequestCode::BasebandVersion,
            RilRequest::RadioPower { .. } => RequestCode::RadioPower,
            RilRequest::ScreenState { .. } => RequestCode::ScreenState,
            RilRequest::SignalStrength => RequestCode::SignalStrength,
            RilRequest::RegistrationState => RequestCode::RegistrationState,
            RilRequest::GprsRegistrationState => RequestCode::GprsRegistrationState,
            RilRequest::Operator => RequestCode::Operator,
            RilRequest::QueryNetworkSelectionMode => RequestCode::QueryNetworkSelectionMode,
            RilRequest::SetNetworkSelectionAutomatic => RequestCode::SetNetworkSelectionAutomatic,
            RilRequest::SetupDataCall { .. } => RequestCode::SetupDataCall,
            RilRequest::DeactivateDataCall => RequestCode::DeactivateDataCall,
            RilRequest::LastDataCallFailCause => RequestCode::LastDataCallFailCause,
            RilRequest::DataCallList => RequestCode::DataCallList,
            RilRequest::SendSms { .. } => RequestCode::SendSms,
            RilRequest::SmsAcknowledge => RequestCode::SmsAcknowledge,
            RilRequest::GetSmscAddress => RequestCode::GetSmscAddress,
            RilRequest::SetSmscAddress { .. } => RequestCode::SetSmscAddress,
            RilRequest::GetBroadcastConfig => RequestCode::GetBroadcastConfig,
            RilRequest::SetBroadcastConfig { .. } => RequestCode::SetBroadcastConfig,
            RilRequest::BroadcastActivation { .. } => RequestCode::BroadcastActivation,
        }
    }
}

/// PDP authentication protocol selection, from the host's auth digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    None,
    Pap,
    Chap,
    PapOrChap,
}

impl AuthType {
    /// Host auth digit 0..=3. Anything else falls back to the permissive
    /// setting, matching modem behavior for unknown values.
    pub fn from_digit(digit: &str) -> AuthType {
        match digit {
            "0" => AuthType::None,
            "1" => AuthType::Pap,
            "2" => AuthType::Chap,
            _ => AuthType::PapOrChap,
        }
    }
}

/// Cell broadcast service-id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastRange {
    pub from_service_id: i32,
    pub to_service_id: i32,
}

/// One configured PDP context, for DATA_CALL_LIST and the setup response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCallInfo {
    pub cid: i32,
    pub active: bool,
    pub pdp_type: String,
    pub apn: String,
    pub address: String,
    /// Interface name; only meaningful on the setup-data-call response.
    pub iface: Option<String>,
}

/// One entry of the current-calls list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallInfo {
    pub index: i32,
    pub is_mt: bool,
    pub state: CallState,
    pub is_voice: bool,
    pub is_multiparty: bool,
    pub number: Option<String>,
    pub toa: Option<i32>,
    pub name: Option<String>,
    /// 0 allowed, 1 restricted, 2 unknown, 3 payphone.
    pub number_presentation: i32,
    pub name_presentation: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Active,
    Holding,
    Dialing,
    Alerting,
    Incoming,
    Waiting,
}

/// Registration query result. LAC renders as four lowercase hex digits,
/// CID as eight; both absent when the modem is not registered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistrationInfo {
    pub status: i32,
    pub lac: Option<String>,
    pub cid: Option<String>,
    /// Host network-type code (1 GPRS, 2 EDGE, 3 UMTS, 9 HSDPA, 10 HSUPA,
    /// 11 HSPA), when the access technology is known.
    pub network_type: Option<i32>,
    /// Why registration was denied, when the network said no.
    pub denied_reason: Option<RegDeniedReason>,
}

/// Detailed registration-denial reason, read back from `AT*E2REG?` when
/// the network rejects us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegDeniedReason {
    General,
    AuthenticationFailure,
    ImsiUnknownInHlr,
    IllegalMs,
    IllegalMe,
    PlmnNotAllowed,
    LocationAreaNotAllowed,
    RoamingNotAllowed,
    NoSuitableCellInLocationArea,
    NetworkFailure,
}

/// SIM card status, host-facing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardStatus {
    pub card_state: CardState,
    pub app: Option<AppStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Absent,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppStatus {
    pub app_type: AppType,
    pub app_state: AppState,
    pub pin_state: PinState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppType {
    Unknown,
    Sim,
    Usim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Unknown,
    Detected,
    Pin,
    Puk,
    SubscriptionPerso,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    Unknown,
    EnabledNotVerified,
    EnabledBlocked,
}

/// Successful request payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RilResponse {
    None,
    Imsi(String),
    Imei(String),
    BasebandVersion(String),
    SimStatus(CardStatus),
    PinRetries(i32),
    Calls(Vec<CallInfo>),
    SignalStrength { rssi: i32, ber: i32 },
    Registration(RegistrationInfo),
    Operator {
        long_name: Option<String>,
        short_name: Option<String>,
        numeric: Option<String>,
    },
    NetworkSelectionMode(i32),
    DataCall(DataCallInfo),
    DataCallList(Option<DataCallInfo>),
    LastDataCallFailCause(PdpFailCause),
    SmsSent { message_ref: i32 },
    SmscAddress(String),
    BroadcastConfig(Vec<BroadcastRange>),
}

/// Modem-originated indications surfaced to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsolicited {
    RadioStateChanged(RadioState),
    NetworkStateChanged,
    CallStateChanged,
    CallRing,
    NewSms(String),
    NewSmsStatusReport(String),
    NewBroadcastSms(Vec<u8>),
    NewSmsOnSim(i32),
    NitzTimeReceived(String),
    SignalStrength { rssi: i32, ber: i32 },
    DataCallListChanged(Option<DataCallInfo>),
    SimStatusChanged,
    SuppServiceNotification {
        /// false for +CSSI (mobile originated), true for +CSSU.
        mt: bool,
        code: i32,
        index: Option<i32>,
    },
    UssdReceived { mode: i32, message: Option<String> },
    StkSessionEnd,
}

/// Work the queues run between host requests. Cloneable so an event can be
/// scheduled on both queues at once.
#[derive(Clone)]
pub enum Task {
    /// Read `AT+CPIN?` and advance the radio state machine. `force` skips
    /// the only-while-pending guard (used after `*ESIMSR`).
    PollSimState { force: bool },
    /// SIM stuck in the powered-off state: probe and pulse `AT*ESIMR`.
    SimResetProbe,
    /// Query `AT+CSQ`; on failure report `fallback_bars` as the strength.
    PollSignalStrength { fallback_bars: i32 },
    /// `AT+COPS?` until an operator shows up, then complete the pending
    /// network-selection request.
    PollOperatorSelected { token: Token, loops: u32 },
    /// Re-read the PDP context list and notify the host.
    DataCallListChanged,
    /// Post-SIM-ready initialization command sequence.
    SimReadyInit,
    /// Post-radio-power-on step: kick off the SIM poll.
    RadioPowerOn,
    /// Host-requested timed callback.
    Callback(Arc<dyn Fn() + Send + Sync>),
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Task::PollSimState { .. } => "PollSimState",
            Task::SimResetProbe => "SimResetProbe",
            Task::PollSignalStrength { .. } => "PollSignalStrength",
            Task::PollOperatorSelected { .. } => "PollOperatorSelected",
            Task::DataCallListChanged => "DataCallListChanged",
            Task::SimReadyInit => "SimReadyInit",
            Task::RadioPowerOn => "RadioPowerOn",
            Task::Callback(_) => "Callback",
        };
        f.write_str(name)
    }
}
