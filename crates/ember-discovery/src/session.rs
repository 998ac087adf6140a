use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::poison;

/// Exactly-once resolution of a pending launch.
///
/// Several flows race to resolve the same launch: the correlator (winner
/// found), the notification channel (closed unresolved) and the host-process
/// exit watcher. Whichever calls [`SessionResolver::resolve`] first wins;
/// every later call is a no-op. Port 0 is the "no usable target" sentinel.
#[derive(Clone)]
pub(crate) struct SessionResolver {
    tx: Arc<Mutex<Option<oneshot::Sender<u16>>>>,
}

impl SessionResolver {
    pub(crate) fn new() -> (Self, oneshot::Receiver<u16>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Returns whether this call performed the resolution.
    pub(crate) fn resolve(&self, port: u16) -> bool {
        let mut slot = poison::lock(&self.tx, "session resolver");
        match slot.take() {
            Some(tx) => {
                let _ = tx.send(port);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        poison::lock(&self.tx, "session resolver").is_none()
    }
}
