use std::fmt::{Display, Formatter};
use tokio::sync::watch;
use tracing::info;

/// Why the pipeline is being taken down.
///
/// The first reason requested wins and is observed by every task, so collectors can
/// stamp their final state transitions with it and the host can tell a clean exit from
/// an escalated failure.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ShutdownReason {
    /// The host's signal handler (SIGINT/SIGTERM) requested a graceful exit.
    HostSignal,
    /// A fatal error escalated past its supervisor; `module` names the reporter.
    Fatal { module: String },
}

impl Display for ShutdownReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::HostSignal => write!(f, "host signal"),
            ShutdownReason::Fatal { module } => write!(f, "fatal error in {module}"),
        }
    }
}

/// Builds the shutdown channel: a ([`ShutdownHandle`], [`ShutdownSignal`]) pair. The
/// handle stays with whoever decides the pipeline's fate; the signal half is cloned
/// into every task and polled at each suspension point.
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(None);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

/// Requests pipeline shutdown with a [`ShutdownReason`]. Only the first request is
/// delivered; later ones are no-ops so an escalated failure cannot be papered over by
/// the host's own signal arriving moments later.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self, reason: ShutdownReason) {
        let mut delivered = false;
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            delivered = true;
            true
        });

        if delivered {
            if let Some(reason) = self.tx.borrow().as_ref() {
                info!(%reason, "pipeline shutdown requested");
            }
        }
    }
}

/// Observes the shutdown request.
///
/// `recv` completes once a reason is available and keeps returning it immediately
/// afterwards, which makes it safe to poll at the top of every loop iteration. A
/// dropped [`ShutdownHandle`] reads as a host-driven exit.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The requested reason, if shutdown has been requested yet.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.rx.borrow().clone()
    }

    pub async fn recv(&mut self) -> ShutdownReason {
        match self.rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or(ShutdownReason::HostSignal),
            // Handle dropped without a reason: the pipeline is going away regardless.
            Err(_) => ShutdownReason::HostSignal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_reason_wins_across_all_signal_clones() {
        let (handle, signal) = shutdown_channel();
        let mut first = signal.clone();
        let mut second = signal;

        assert!(!first.is_shutdown());
        assert_eq!(None, first.reason());

        handle.shutdown(ShutdownReason::Fatal {
            module: "processor-0".to_owned(),
        });
        // Late host signal does not overwrite the escalated failure.
        handle.shutdown(ShutdownReason::HostSignal);

        let expected = ShutdownReason::Fatal {
            module: "processor-0".to_owned(),
        };
        assert_eq!(expected, first.recv().await);
        assert_eq!(expected, second.recv().await);
        assert!(first.is_shutdown());
        assert_eq!(Some(expected.clone()), first.reason());

        // Subsequent receives return immediately with the same reason.
        assert_eq!(expected, first.recv().await);
    }

    #[tokio::test]
    async fn test_dropped_handle_reads_as_host_driven_exit() {
        let (handle, mut signal) = shutdown_channel();
        drop(handle);

        assert_eq!(ShutdownReason::HostSignal, signal.recv().await);
    }
}
