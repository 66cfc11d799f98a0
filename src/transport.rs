//! Byte transport to the modem: a raw serial TTY or a TCP stream.
//!
//! The TTY is configured raw 115200 8N1 with hardware flow control and
//! `VMIN=0, VTIME=5`, so blocked reads return every 500 ms and the reader
//! thread can notice shutdown without an extra wakeup mechanism. The TCP
//! path gets the same idle-tick behavior from a socket read timeout.
//!
//! Before the first command is issued the modem announces `EMRDY` on the
//! line; [`Transport::wait_for_ready`] watches for it. Some firmware
//! revisions skip the banner, so its absence is logged and tolerated.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, ControlFlags, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tracing::{debug, info, warn};

/// How long to watch for the `EMRDY` banner after opening.
pub const READY_BANNER_WINDOW: Duration = Duration::from_secs(10);

/// Pause between transport open attempts.
pub const REOPEN_DELAY: Duration = Duration::from_secs(5);

/// Result of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes arrived.
    Data(usize),
    /// Nothing arrived within the idle tick; try again.
    Idle,
    /// The stream is gone (EOF or unrecoverable error).
    Closed,
}

/// Helper to get a `BorrowedFd` from a `RawFd` for nix termios calls.
///
/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

enum Stream {
    Tty { fd: RawFd },
    Tcp(TcpStream),
}

/// An open bidirectional byte stream to the modem. Reads and writes may
/// come from different threads; both take `&self`.
pub struct Transport {
    stream: Stream,
    desc: String,
}

impl Transport {
    /// Open and configure a serial device (e.g. `/dev/ttyACM1`).
    pub fn open_tty(device: &str) -> Result<Self, String> {
        let fd = fcntl::open(device, OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty())
            .map_err(|e| format!("open {device}: {e}"))?;

        configure_termios(fd).inspect_err(|_| {
            let _ = unistd::close(fd);
        })?;

        info!("Transport {device}: opened (raw 115200 8N1, CRTSCTS)");
        Ok(Transport {
            stream: Stream::Tty { fd },
            desc: device.to_string(),
        })
    }

    /// Connect to a modem exposed over TCP, on `host` or loopback.
    pub fn open_tcp(host: Option<&str>, port: u16) -> Result<Self, String> {
        let host = host.unwrap_or("127.0.0.1");
        let stream =
            TcpStream::connect((host, port)).map_err(|e| format!("connect {host}:{port}: {e}"))?;
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .map_err(|e| format!("set_read_timeout: {e}"))?;
        stream.set_nodelay(true).ok();

        info!("Transport {host}:{port}: connected");
        Ok(Transport {
            stream: Stream::Tcp(stream),
            desc: format!("{host}:{port}"),
        })
    }

    /// Human-readable endpoint, for logs.
    pub fn describe(&self) -> &str {
        &self.desc
    }

    /// One read attempt. Returns within roughly half a second even when no
    /// data arrives.
    pub fn read(&self, buf: &mut [u8]) -> ReadOutcome {
        match &self.stream {
            Stream::Tty { fd } => match unistd::read(*fd, buf) {
                // VTIME expired with nothing buffered.
                Ok(0) => ReadOutcome::Idle,
                Ok(n) => ReadOutcome::Data(n),
                Err(nix::errno::Errno::EINTR | nix::errno::Errno::EAGAIN) => ReadOutcome::Idle,
                Err(e) => {
                    warn!("Transport {}: read error: {e}", self.desc);
                    ReadOutcome::Closed
                }
            },
            Stream::Tcp(stream) => match (&mut (&*stream)).read(buf) {
                Ok(0) => ReadOutcome::Closed,
                Ok(n) => ReadOutcome::Data(n),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    ReadOutcome::Idle
                }
                Err(e) => {
                    warn!("Transport {}: read error: {e}", self.desc);
                    ReadOutcome::Closed
                }
            },
        }
    }

    /// Write the whole buffer.
    pub fn write_all(&self, bytes: &[u8]) -> Result<(), String> {
        match &self.stream {
            Stream::Tty { fd } => {
                let mut rest = bytes;
                while !rest.is_empty() {
                    // SAFETY: fd is valid for the lifetime of self
                    let n = unistd::write(unsafe { borrow_fd(*fd) }, rest)
                        .map_err(|e| format!("write {}: {e}", self.desc))?;
                    rest = &rest[n..];
                }
                Ok(())
            }
            Stream::Tcp(stream) => (&mut (&*stream))
                .write_all(bytes)
                .map_err(|e| format!("write {}: {e}", self.desc)),
        }
    }

    /// Watch for the `EMRDY` ready banner. Returns whether it was seen;
    /// callers proceed either way.
    pub fn wait_for_ready(&self, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        let mut seen = Vec::new();
        let mut buf = [0u8; 256];

        while Instant::now() < deadline {
            match self.read(&mut buf) {
                ReadOutcome::Data(n) => {
                    seen.extend_from_slice(&buf[..n]);
                    if contains_bytes(&seen, b"EMRDY") {
                        info!("Transport {}: got EMRDY", self.desc);
                        return true;
                    }
                }
                ReadOutcome::Idle => {}
                ReadOutcome::Closed => break,
            }
        }

        warn!(
            "Transport {}: no EMRDY within {:?}, proceeding anyway",
            self.desc, window
        );
        false
    }

    /// Unblock a reader parked in `read` on the TCP path. TTY readers fall
    /// out on their next idle tick.
    pub fn shutdown(&self) {
        if let Stream::Tcp(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
        debug!("Transport {}: shutdown requested", self.desc);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Stream::Tty { fd } = self.stream {
            let _ = unistd::close(fd);
        }
    }
}

/// Raw mode, 115200 baud, 8N1, hardware flow control, flushed.
/// `VMIN=0, VTIME=5` → reads return after 500 ms of silence.
fn configure_termios(fd: RawFd) -> Result<(), String> {
    // SAFETY: fd is valid — caller just opened it
    let borrowed = unsafe { borrow_fd(fd) };

    termios::tcflush(borrowed, termios::FlushArg::TCIOFLUSH)
        .map_err(|e| format!("tcflush: {e}"))?;

    let mut tio = termios::tcgetattr(borrowed).map_err(|e| format!("tcgetattr: {e}"))?;

    termios::cfmakeraw(&mut tio);

    termios::cfsetispeed(&mut tio, termios::BaudRate::B115200)
        .map_err(|e| format!("cfsetispeed: {e}"))?;
    termios::cfsetospeed(&mut tio, termios::BaudRate::B115200)
        .map_err(|e| format!("cfsetospeed: {e}"))?;

    // 8N1 with RTS/CTS; CREAD on, modem control lines honored (the module
    // drops DCD on hangup and we want to see it).
    tio.control_flags |= ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CRTSCTS;

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 5;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio).map_err(|e| format!("tcsetattr: {e}"))?;
    termios::tcflush(borrowed, termios::FlushArg::TCIOFLUSH)
        .map_err(|e| format!("tcflush: {e}"))?;

    Ok(())
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
