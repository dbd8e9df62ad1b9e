//! Single resettable deadline timer.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// One live timer per adapter: arming spawns a task, re-arming reschedules
/// it through a watch channel instead of spawning another. Dropping the
/// timer cancels it.
pub(crate) struct Deadline {
    tx: watch::Sender<Instant>,
    task: JoinHandle<()>,
}

impl Deadline {
    pub(crate) fn arm<F>(at: Instant, on_expire: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (tx, mut rx) = watch::channel(at);
        let task = tokio::spawn(async move {
            loop {
                let at = *rx.borrow_and_update();
                tokio::select! {
                    _ = time::sleep_until(at) => {
                        on_expire();
                        return;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Self { tx, task }
    }

    pub(crate) fn reset(&self, at: Instant) {
        let _ = self.tx.send(at);
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.task.abort();
    }
}
