//! The host-facing side of the engine: the environment callbacks the core
//! invokes, and a logging implementation for standalone runs.

use std::sync::Mutex;

use tracing::info;

use crate::error::RilError;
use crate::requests::{RilResponse, Token, Unsolicited};

/// Callbacks into the host telephony stack. Completion may arrive on
/// either worker thread; unsolicited indications may additionally arrive
/// on a reader thread. Implementations must not block for long and must
/// never call back into the engine's request path re-entrantly.
pub trait HostEnv: Send + Sync {
    /// A request finished, successfully or not.
    fn request_complete(&self, token: Token, result: Result<RilResponse, RilError>);

    /// A modem-originated indication.
    fn unsolicited(&self, indication: Unsolicited);
}

/// Host environment that logs all traffic; used by the `rild` binary when
/// no telephony stack is attached.
#[derive(Default)]
pub struct LogHost {
    seen: Mutex<Vec<Unsolicited>>,
}

impl LogHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indications observed so far, oldest first.
    pub fn take_unsolicited(&self) -> Vec<Unsolicited> {
        std::mem::take(&mut self.seen.lock().unwrap())
    }
}

impl HostEnv for LogHost {
    fn request_complete(&self, token: Token, result: Result<RilResponse, RilError>) {
        match result {
            Ok(resp) => info!("request {token:?} complete: {resp:?}"),
            Err(err) => info!("request {token:?} failed: {err}"),
        }
    }

    fn unsolicited(&self, indication: Unsolicited) {
        info!("unsolicited: {indication:?}");
        self.seen.lock().unwrap().push(indication);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::mpsc;

    /// Test host that forwards everything to channels.
    pub struct RecordingHost {
        pub completions: Mutex<mpsc::Sender<(Token, Result<RilResponse, RilError>)>>,
        pub indications: Mutex<mpsc::Sender<Unsolicited>>,
    }

    impl RecordingHost {
        pub fn new() -> (
            Self,
            mpsc::Receiver<(Token, Result<RilResponse, RilError>)>,
            mpsc::Receiver<Unsolicited>,
        ) {
            let (ctx, crx) = mpsc::channel();
            let (utx, urx) = mpsc::channel();
            (
                RecordingHost {
                    completions: Mutex::new(ctx),
                    indications: Mutex::new(utx),
                },
                crx,
                urx,
            )
        }
    }

    impl HostEnv for RecordingHost {
        fn request_complete(&self, token: Token, result: Result<RilResponse, RilError>) {
            let _ = self.completions.lock().unwrap().send((token, result));
        }

        fn unsolicited(&self, indication: Unsolicited) {
            let _ = self.indications.lock().unwrap().send(indication);
        }
    }
}
