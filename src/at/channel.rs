//! Single-in-flight AT command channel.
//!
//! One command may be pending at a time; callers serialize on an entry
//! mutex and park on a condition variable until the reader thread deposits
//! the assembled response in the shared slot. Unsolicited lines never touch
//! the slot — they go to the channel's unsolicited handler on the reader
//! thread, which must not (and structurally cannot) send commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::at::reader;
use crate::at::response::{is_final_error, is_final_success, AtResponse, ResponseKind};
use crate::error::AtError;
use crate::transport::Transport;

/// Default per-command deadline. Generous because network-touching
/// commands (attach, COPS scans) legitimately take minutes.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Handshake probe timing: short sends, a handful of retries.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(250);
const HANDSHAKE_RETRIES: u32 = 8;

/// Escape byte thrown on the line by the timeout recovery path.
const ESCAPE: u8 = 0x1b;

/// Ctrl-Z terminates the second stage of an SMS send.
const CTRL_Z: u8 = 0x1a;

/// Unsolicited line sink, invoked on the reader thread. The second
/// argument carries the PDU line for `+CMT:`-style two-line indications.
pub type UnsolHandler = Box<dyn Fn(&str, Option<&str>) + Send>;

pub(crate) struct Pending {
    pub command: String,
    pub kind: ResponseKind,
    pub prefix: Option<String>,
    /// Second-stage SMS payload; taken when the `>` prompt arrives.
    pub sms_payload: Option<String>,
    pub response: AtResponse,
}

#[derive(Default)]
pub(crate) struct Slot {
    pub pending: Option<Pending>,
    pub done: Option<AtResponse>,
}

/// What the reader should do with a line it just framed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Echo, intermediate, or final — consumed by the pending command.
    Consumed,
    /// Hand to the unsolicited router.
    Unsolicited,
}

pub struct AtChannel {
    slot: Mutex<Slot>,
    cond: Condvar,
    /// Serializes callers; held across the whole exchange.
    entry: Mutex<()>,
    transport: Arc<Transport>,
    timeout: Mutex<Duration>,
    closed: AtomicBool,
    reader_tid: OnceLock<ThreadId>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    on_timeout: Mutex<Option<Box<dyn Fn(&AtChannel) + Send + Sync>>>,
    on_closed: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl AtChannel {
    /// Wrap an open transport and spawn its reader thread.
    pub fn open(transport: Arc<Transport>, unsol: UnsolHandler) -> Arc<AtChannel> {
        let chan = Arc::new(AtChannel {
            slot: Mutex::new(Slot::default()),
            cond: Condvar::new(),
            entry: Mutex::new(()),
            transport: transport.clone(),
            timeout: Mutex::new(DEFAULT_COMMAND_TIMEOUT),
            closed: AtomicBool::new(false),
            reader_tid: OnceLock::new(),
            reader_handle: Mutex::new(None),
            on_timeout: Mutex::new(None),
            on_closed: Mutex::new(None),
        });

        let reader_chan = chan.clone();
        let handle = thread::Builder::new()
            .name(format!("at-reader-{}", transport.describe()))
            .spawn(move || reader::run(&reader_chan, &transport, unsol))
            .expect("spawn reader thread");

        let _ = chan.reader_tid.set(handle.thread().id());
        *chan.reader_handle.lock().unwrap() = Some(handle);
        chan
    }

    /// Override the per-command deadline (the priority channel runs 30 s).
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap() = timeout;
    }

    /// Invoked on the command thread when a command times out, before the
    /// caller sees [`AtError::Timeout`]. Handlers typically escape and mark
    /// the radio unavailable.
    pub fn set_on_timeout(&self, cb: impl Fn(&AtChannel) + Send + Sync + 'static) {
        *self.on_timeout.lock().unwrap() = Some(Box::new(cb));
    }

    /// Invoked on the reader thread when the transport closes underneath
    /// us (not on [`AtChannel::close`]).
    pub fn set_on_closed(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.on_closed.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the channel: wake any waiter with `ChannelClosed`, stop the
    /// reader, and release the transport.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.shutdown();
        {
            let mut slot = self.slot.lock().unwrap();
            slot.pending = None;
            self.cond.notify_all();
        }
        let handle = self.reader_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
        info!("AT channel {}: closed", self.transport.describe());
    }

    /// Throw an escape byte on the line to abort whatever the modem thinks
    /// is in progress.
    pub fn send_escape(&self) {
        let _ = self.transport.write_all(&[ESCAPE]);
    }

    /// No intermediate expected.
    pub fn send(&self, command: &str) -> Result<AtResponse, AtError> {
        self.send_full(command, ResponseKind::NoResult, None, None, None)
    }

    /// One intermediate starting with a decimal digit.
    pub fn send_numeric(&self, command: &str) -> Result<AtResponse, AtError> {
        self.send_full(command, ResponseKind::Numeric, None, None, None)
    }

    /// One intermediate starting with `prefix`.
    pub fn send_singleline(&self, command: &str, prefix: &str) -> Result<AtResponse, AtError> {
        self.send_full(command, ResponseKind::SingleLine, Some(prefix), None, None)
    }

    /// Any number of intermediates starting with `prefix`.
    pub fn send_multiline(&self, command: &str, prefix: &str) -> Result<AtResponse, AtError> {
        self.send_full(command, ResponseKind::MultiLine, Some(prefix), None, None)
    }

    /// Two-stage SMS send: `command`, wait for the `>` prompt, then
    /// `payload` terminated by Ctrl-Z; the rest behaves like
    /// [`AtChannel::send_singleline`].
    pub fn send_sms(
        &self,
        command: &str,
        payload: &str,
        prefix: &str,
    ) -> Result<AtResponse, AtError> {
        self.send_full(
            command,
            ResponseKind::SingleLine,
            Some(prefix),
            Some(payload),
            None,
        )
    }

    /// Probe the command port until the modem answers. Any final result
    /// code counts — the point is synchronization, not success.
    pub fn handshake(&self) -> Result<(), AtError> {
        for attempt in 1..=HANDSHAKE_RETRIES {
            match self.send_full(
                "ATE0Q0V1",
                ResponseKind::NoResult,
                None,
                None,
                Some(HANDSHAKE_TIMEOUT),
            ) {
                Ok(_) | Err(AtError::Generic { .. }) => return Ok(()),
                Err(AtError::Timeout) => {
                    debug!("handshake attempt {attempt} timed out");
                }
                Err(e) => return Err(e),
            }
        }
        Err(AtError::Timeout)
    }

    fn send_full(
        &self,
        command: &str,
        kind: ResponseKind,
        prefix: Option<&str>,
        sms_payload: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<AtResponse, AtError> {
        if self.is_closed() {
            return Err(AtError::ChannelClosed);
        }
        if Some(&thread::current().id()) == self.reader_tid.get() {
            // Sending from the reader thread would deadlock the channel:
            // nobody would be left to complete the command.
            return Err(AtError::InvalidThread);
        }

        let _entry = self.entry.lock().unwrap();

        {
            let mut slot = self.slot.lock().unwrap();
            if slot.pending.is_some() {
                return Err(AtError::CommandPending);
            }
            slot.done = None;
            slot.pending = Some(Pending {
                command: command.to_string(),
                kind,
                prefix: prefix.map(str::to_string),
                sms_payload: sms_payload.map(str::to_string),
                response: AtResponse::new(),
            });
        }

        debug!("-> {command}");
        if self.transport.write_all(format!("{command}\r").as_bytes()).is_err() {
            self.slot.lock().unwrap().pending = None;
            return Err(AtError::ChannelClosed);
        }

        let timeout = timeout.unwrap_or_else(|| *self.timeout.lock().unwrap());
        let deadline = Instant::now() + timeout;

        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(done) = slot.done.take() {
                drop(slot);
                return finish(done, kind);
            }
            if self.is_closed() {
                slot.pending = None;
                return Err(AtError::ChannelClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                // Abandon the command; a late final will be routed as
                // unsolicited, which the router ignores by prefix.
                slot.pending = None;
                drop(slot);
                warn!("command timed out: {command}");
                let cb = self.on_timeout.lock().unwrap();
                if let Some(cb) = cb.as_ref() {
                    cb(self);
                }
                return Err(AtError::Timeout);
            }
            let (guard, _) = self.cond.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }

    // ── Reader-thread side ──────────────────────────────────────────────

    /// Classify a framed line against the pending command, consuming it
    /// when it is an echo, an expected intermediate, or a final result.
    pub(crate) fn process_line(&self, line: &str) -> Verdict {
        let mut slot = self.slot.lock().unwrap();

        let Some(pending) = slot.pending.as_mut() else {
            return Verdict::Unsolicited;
        };

        // Echo of the command we just wrote (seen until ATE0 sticks).
        if line == pending.command {
            return Verdict::Consumed;
        }

        if is_final_success(line) || is_final_error(line) {
            let mut pending = slot.pending.take().expect("pending checked above");
            pending.response.success = is_final_success(line);
            pending.response.final_response = line.to_string();
            slot.done = Some(pending.response);
            self.cond.notify_all();
            return Verdict::Consumed;
        }

        let trimmed = line.trim_start();
        let accept = match pending.kind {
            ResponseKind::NoResult => false,
            ResponseKind::Numeric => {
                pending.response.intermediates.is_empty()
                    && trimmed.chars().next().is_some_and(|c| c.is_ascii_digit())
            }
            ResponseKind::SingleLine => {
                pending.response.intermediates.is_empty()
                    && pending
                        .prefix
                        .as_deref()
                        .is_some_and(|p| trimmed.starts_with(p))
            }
            ResponseKind::MultiLine => pending
                .prefix
                .as_deref()
                .is_some_and(|p| trimmed.starts_with(p)),
        };

        if accept {
            pending.response.intermediates.push(line.to_string());
            Verdict::Consumed
        } else {
            Verdict::Unsolicited
        }
    }

    /// Is the pending command an SMS send still waiting for its prompt?
    pub(crate) fn awaiting_sms_prompt(&self) -> bool {
        let slot = self.slot.lock().unwrap();
        slot.pending
            .as_ref()
            .is_some_and(|p| p.sms_payload.is_some())
    }

    /// The `>` prompt arrived: write the second stage.
    pub(crate) fn send_sms_payload(&self) {
        let payload = {
            let mut slot = self.slot.lock().unwrap();
            slot.pending.as_mut().and_then(|p| p.sms_payload.take())
        };
        if let Some(payload) = payload {
            debug!("-> <pdu> ({} hex chars)", payload.len());
            let mut bytes = payload.into_bytes();
            bytes.push(CTRL_Z);
            if self.transport.write_all(&bytes).is_err() {
                self.reader_closed();
            }
        }
    }

    /// The transport is gone. Finalize any in-flight command as closed and
    /// tell the owner. Runs on the reader thread.
    pub(crate) fn reader_closed(&self) {
        let already = self.closed.swap(true, Ordering::SeqCst);
        {
            let mut slot = self.slot.lock().unwrap();
            slot.pending = None;
            self.cond.notify_all();
        }
        if !already {
            warn!("AT channel {}: reader closed", self.transport.describe());
            let cb = self.on_closed.lock().unwrap();
            if let Some(cb) = cb.as_ref() {
                cb();
            }
        }
    }
}

fn finish(response: AtResponse, kind: ResponseKind) -> Result<AtResponse, AtError> {
    if !response.success {
        return Err(AtError::Generic {
            cme: response.cme_error(),
            cms: response.cms_error(),
        });
    }
    match kind {
        ResponseKind::Numeric | ResponseKind::SingleLine
            if response.intermediates.is_empty() =>
        {
            Err(AtError::InvalidResponse)
        }
        _ => Ok(response),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;

    /// Scripted modem: maps each received command line to response lines.
    fn fake_modem(
        script: Vec<(&'static str, Vec<&'static str>)>,
    ) -> (Arc<AtChannel>, mpsc::Receiver<(String, Option<String>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve_script(stream, &script);
        });

        let transport = Arc::new(Transport::open_tcp(None, port).unwrap());
        let (tx, rx) = mpsc::channel();
        let chan = AtChannel::open(
            transport,
            Box::new(move |line, pdu| {
                let _ = tx.send((line.to_string(), pdu.map(str::to_string)));
            }),
        );
        (chan, rx)
    }

    fn serve_script(stream: TcpStream, script: &[(&str, Vec<&str>)]) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut stream = stream;
        loop {
            let mut cmd = Vec::new();
            if reader.read_until(b'\r', &mut cmd).unwrap_or(0) == 0 {
                return;
            }
            let cmd = String::from_utf8_lossy(&cmd).trim().to_string();
            let Some((_, lines)) = script.iter().find(|(c, _)| *c == cmd) else {
                let _ = stream.write_all(b"\r\nERROR\r\n");
                continue;
            };
            for line in lines {
                let _ = stream.write_all(format!("\r\n{line}").as_bytes());
            }
            let _ = stream.write_all(b"\r\n");
        }
    }

    #[test]
    fn test_send_no_result() {
        let (chan, _rx) = fake_modem(vec![("AT+CMEE=1", vec!["OK"])]);
        let resp = chan.send("AT+CMEE=1").unwrap();
        assert!(resp.success);
        assert!(resp.intermediates.is_empty());
        chan.close();
    }

    #[test]
    fn test_send_singleline() {
        let (chan, _rx) = fake_modem(vec![("AT+CSQ", vec!["+CSQ: 15,99", "OK"])]);
        let resp = chan.send_singleline("AT+CSQ", "+CSQ:").unwrap();
        assert_eq!(resp.first_line(), Some("+CSQ: 15,99"));
        chan.close();
    }

    #[test]
    fn test_send_numeric() {
        let (chan, _rx) = fake_modem(vec![("AT+CIMI", vec!["240080123456789", "OK"])]);
        let resp = chan.send_numeric("AT+CIMI").unwrap();
        assert_eq!(resp.first_line(), Some("240080123456789"));
        chan.close();
    }

    #[test]
    fn test_multiline_collects_all_matching() {
        let (chan, _rx) = fake_modem(vec![(
            "AT+CLCC",
            vec!["+CLCC: 1,0,2,0,0", "+CLCC: 2,1,4,0,0", "OK"],
        )]);
        let resp = chan.send_multiline("AT+CLCC", "+CLCC:").unwrap();
        assert_eq!(resp.intermediates.len(), 2);
        chan.close();
    }

    #[test]
    fn test_multiline_empty_is_ok() {
        let (chan, _rx) = fake_modem(vec![("AT+CLCC", vec!["OK"])]);
        let resp = chan.send_multiline("AT+CLCC", "+CLCC:").unwrap();
        assert!(resp.intermediates.is_empty());
        chan.close();
    }

    #[test]
    fn test_error_final_with_cme_code() {
        let (chan, _rx) = fake_modem(vec![("AT+CPIN?", vec!["+CME ERROR: 10"])]);
        match chan.send_singleline("AT+CPIN?", "+CPIN:") {
            Err(AtError::Generic { cme: Some(10), .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        chan.close();
    }

    #[test]
    fn test_missing_intermediate_is_invalid_response() {
        let (chan, _rx) = fake_modem(vec![("AT+CSQ", vec!["OK"])]);
        assert_eq!(
            chan.send_singleline("AT+CSQ", "+CSQ:"),
            Err(AtError::InvalidResponse)
        );
        chan.close();
    }

    #[test]
    fn test_unsolicited_during_pending_command() {
        let (chan, rx) = fake_modem(vec![("AT+CSQ", vec!["*E2NAP: 2", "+CSQ: 20,99", "OK"])]);
        let resp = chan.send_singleline("AT+CSQ", "+CSQ:").unwrap();
        assert_eq!(resp.first_line(), Some("+CSQ: 20,99"));
        let (line, pdu) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(line, "*E2NAP: 2");
        assert!(pdu.is_none());
        chan.close();
    }

    #[test]
    fn test_echo_is_discarded() {
        let (chan, rx) = fake_modem(vec![("AT+CSQ", vec!["AT+CSQ", "+CSQ: 3,99", "OK"])]);
        let resp = chan.send_singleline("AT+CSQ", "+CSQ:").unwrap();
        assert_eq!(resp.intermediates.len(), 1);
        assert!(rx.try_recv().is_err());
        chan.close();
    }

    #[test]
    fn test_sms_two_stage_send() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let modem = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut stream = stream;
            let mut cmd = Vec::new();
            reader.read_until(b'\r', &mut cmd).unwrap();
            assert_eq!(String::from_utf8_lossy(&cmd).trim(), "AT+CMGS=12");
            stream.write_all(b"\r\n> ").unwrap();
            let mut pdu = Vec::new();
            reader.read_until(0x1a, &mut pdu).unwrap();
            assert_eq!(pdu.last(), Some(&0x1au8));
            let pdu = String::from_utf8_lossy(&pdu[..pdu.len() - 1]).to_string();
            stream.write_all(b"\r\n+CMGS: 4\r\n\r\nOK\r\n").unwrap();
            pdu
        });

        let transport = Arc::new(Transport::open_tcp(None, port).unwrap());
        let chan = AtChannel::open(transport, Box::new(|_, _| {}));
        let resp = chan.send_sms("AT+CMGS=12", "0011000B9121", "+CMGS:").unwrap();
        assert_eq!(resp.first_line(), Some("+CMGS: 4"));
        assert_eq!(modem.join().unwrap(), "0011000B9121");
        chan.close();
    }

    #[test]
    fn test_timeout_fires_callback_and_abandons() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // Modem that accepts the connection and never answers.
        let _silent = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(10));
            drop(stream);
        });

        let transport = Arc::new(Transport::open_tcp(None, port).unwrap());
        let chan = AtChannel::open(transport, Box::new(|_, _| {}));
        chan.set_timeout(Duration::from_millis(200));

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        chan.set_on_timeout(move |c| {
            c.send_escape();
            fired2.store(true, Ordering::SeqCst);
        });

        assert_eq!(chan.send("AT+CFUN?"), Err(AtError::Timeout));
        assert!(fired.load(Ordering::SeqCst));
        chan.close();
    }

    #[test]
    fn test_reader_closed_during_in_flight_command() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _modem = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(200));
            drop(stream); // hang up mid-command
        });

        let transport = Arc::new(Transport::open_tcp(None, port).unwrap());
        let chan = AtChannel::open(transport, Box::new(|_, _| {}));

        let closed = Arc::new(AtomicBool::new(false));
        let closed2 = closed.clone();
        chan.set_on_closed(move || closed2.store(true, Ordering::SeqCst));

        assert_eq!(chan.send("AT+CFUN?"), Err(AtError::ChannelClosed));
        assert!(closed.load(Ordering::SeqCst));
        chan.close();
    }

    #[test]
    fn test_commands_complete_in_order() {
        let (chan, _rx) = fake_modem(vec![
            ("AT+CGSN", vec!["123456789012345", "OK"]),
            ("AT+CIMI", vec!["240080123456789", "OK"]),
        ]);
        let first = chan.send_numeric("AT+CGSN").unwrap();
        let second = chan.send_numeric("AT+CIMI").unwrap();
        assert_eq!(first.first_line(), Some("123456789012345"));
        assert_eq!(second.first_line(), Some("240080123456789"));
        chan.close();
    }

    #[test]
    fn test_send_after_close_fails() {
        let (chan, _rx) = fake_modem(vec![]);
        chan.close();
        assert_eq!(chan.send("AT"), Err(AtError::ChannelClosed));
    }

    #[test]
    fn test_handshake_succeeds_on_any_final() {
        let (chan, _rx) = fake_modem(vec![("ATE0Q0V1", vec!["OK"])]);
        assert!(chan.handshake().is_ok());
        chan.close();
    }
}
