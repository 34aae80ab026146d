// Notices when whoever reads our stdout pipe goes away

use std::{thread, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POLL_TIMEOUT_MS: libc::c_int = 250;

/// Cancels `cancel` once stdout reports `POLLERR` or `POLLHUP`
///
/// Runs on a detached thread, runtime shutdown does not wait for it.
pub fn spawn(cancel: CancellationToken) {
    let res = thread::Builder::new()
        .name("stdout-watch".into())
        .spawn(move || watch(cancel));
    if let Err(e) = res {
        warn!("Unable to watch stdout for closure: {e}");
    }
}

fn watch(cancel: CancellationToken) {
    let mut fd = libc::pollfd {
        fd: libc::STDOUT_FILENO,
        events: 0,
        revents: 0,
    };

    while !cancel.is_cancelled() {
        fd.revents = 0;
        // SAFETY: a single valid pollfd that outlives the call
        let ready = unsafe { libc::poll(&mut fd, 1, POLL_TIMEOUT_MS) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            warn!("Polling stdout failed: {err}");
            return;
        }
        if ready > 0 && fd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            debug!("stdout consumer closed (revents {:#x})", fd.revents);
            cancel.cancel();
            return;
        }
        if ready == 0 {
            continue;
        }
        // Some other readiness bit without an error, back off so we don't spin
        thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Returns immediately instead of polling forever
        watch(cancel);
    }
}
