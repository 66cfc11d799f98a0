//! Per-channel reader thread: frames transport bytes into CR/LF lines and
//! classifies each as echo, SMS prompt, intermediate, final, or
//! unsolicited.
//!
//! SMS-deliver indications (`+CMT:`, `+CDS:`, `+CBM:`, `+CLASS0:`) are
//! followed by a bare PDU line; the reader pairs the two before handing
//! them to the unsolicited handler. The `>` prompt of a two-stage SMS send
//! arrives without a line terminator, so it is detected on the raw buffer.

use tracing::{debug, trace};

use crate::at::channel::{AtChannel, UnsolHandler, Verdict};
use crate::transport::{ReadOutcome, Transport};

const READ_BUF_SIZE: usize = 1024;

/// Unsolicited indications whose payload arrives on the following line.
const SMS_UNSOLICITED: [&str; 4] = ["+CMT:", "+CDS:", "+CBM:", "+CLASS0:"];

fn is_sms_unsolicited(line: &str) -> bool {
    SMS_UNSOLICITED.iter().any(|p| line.starts_with(p))
}

/// Reader loop. Returns when the channel closes or the transport dies; in
/// the latter case the channel's reader-closed path runs first, on this
/// thread.
pub(crate) fn run(chan: &AtChannel, transport: &Transport, unsol: UnsolHandler) {
    let mut framer = LineFramer::new();
    let mut pairing: Option<String> = None;
    let mut buf = [0u8; READ_BUF_SIZE];

    loop {
        match transport.read(&mut buf) {
            ReadOutcome::Data(n) => framer.push(&buf[..n]),
            ReadOutcome::Idle => {
                if chan.is_closed() {
                    debug!("reader: channel closed, exiting");
                    return;
                }
                continue;
            }
            ReadOutcome::Closed => {
                chan.reader_closed();
                return;
            }
        }

        loop {
            match framer.next(chan.awaiting_sms_prompt()) {
                Framed::Line(line) => handle_line(chan, &unsol, &mut pairing, &line),
                Framed::SmsPrompt => chan.send_sms_payload(),
                Framed::Pending => break,
            }
        }

        if chan.is_closed() {
            return;
        }
    }
}

fn handle_line(chan: &AtChannel, unsol: &UnsolHandler, pairing: &mut Option<String>, line: &str) {
    trace!("<- {line}");

    // A held SMS indication consumes this line as its PDU, whatever it
    // looks like.
    if let Some(indication) = pairing.take() {
        unsol(&indication, Some(line));
        return;
    }

    if is_sms_unsolicited(line) {
        *pairing = Some(line.to_string());
        return;
    }

    if chan.process_line(line) == Verdict::Unsolicited {
        unsol(line, None);
    }
}

/// What the framer produced from the buffered bytes.
enum Framed {
    Line(String),
    SmsPrompt,
    Pending,
}

/// Accumulates raw bytes and yields complete lines. Interior NULs and
/// other stray control bytes (stale buffer garbage after a modem reset)
/// are dropped before UTF-8 conversion.
struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    fn new() -> Self {
        LineFramer { buf: Vec::new() }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next(&mut self, awaiting_prompt: bool) -> Framed {
        // Leading line terminators carry no information.
        let skip = self
            .buf
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();
        if skip > 0 {
            self.buf.drain(..skip);
        }

        // The SMS prompt is not line-terminated: "> " sitting at the start
        // of the buffer while a send is waiting for it.
        if awaiting_prompt && self.buf.first() == Some(&b'>') {
            let keep = self
                .buf
                .iter()
                .position(|&b| b != b'>' && b != b' ')
                .unwrap_or(self.buf.len());
            self.buf.drain(..keep);
            return Framed::SmsPrompt;
        }

        let Some(eol) = self.buf.iter().position(|&b| b == b'\r' || b == b'\n') else {
            return Framed::Pending;
        };

        let raw: Vec<u8> = self.buf.drain(..=eol).collect();
        let line: String = String::from_utf8_lossy(&raw[..raw.len() - 1])
            .chars()
            .filter(|c| !c.is_control() && *c != '\u{FFFD}')
            .collect();

        if line.is_empty() {
            // Blank line between payload lines; try the rest of the buffer.
            self.next(awaiting_prompt)
        } else {
            Framed::Line(line)
        }
    }
}
