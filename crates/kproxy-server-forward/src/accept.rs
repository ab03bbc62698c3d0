//! Accept error handling
//!
//! Errors that clear up on their own (a peer that went away before accept,
//! descriptor exhaustion) are retried after a growing delay. Anything else
//! ends the accept loop.

use std::io;
use std::time::Duration;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

#[cfg(unix)]
const EMFILE: i32 = 24;
#[cfg(unix)]
const ENFILE: i32 = 23;
#[cfg(windows)]
const WSAEMFILE: i32 = 10024;

/// Whether accept may succeed again without intervention
pub(crate) fn is_transient_accept_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        matches!(e.raw_os_error(), Some(EMFILE) | Some(ENFILE))
    }
    #[cfg(windows)]
    {
        matches!(e.raw_os_error(), Some(WSAEMFILE))
    }
    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

/// Delay between accept retries, doubling up to one second
#[derive(Debug, Default)]
pub(crate) struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => MIN_ACCEPT_BACKOFF,
            Some(previous) => (previous * 2).min(MAX_ACCEPT_BACKOFF),
        };
        self.current = Some(delay);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}
