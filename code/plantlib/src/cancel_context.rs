use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// Context object used to cancel an async operation and optionally wait for it
// to complete. Once cancelled it stays cancelled: every later wait returns
// immediately.
pub struct CancelContext {
    cancelled: AtomicBool,
    cancel_signal: Signal<CriticalSectionRawMutex, ()>,
    done_signal: Signal<CriticalSectionRawMutex, ()>,
}

impl Default for CancelContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelContext {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            cancel_signal: Signal::new(),
            done_signal: Signal::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_signal.signal(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancel_and_wait(&self) {
        self.cancel();
        self.done_signal.wait().await
    }

    pub async fn wait_for_cancel(&self) {
        if self.is_cancelled() {
            return;
        }
        self.cancel_signal.wait().await
    }

    pub fn done(&self) {
        self.done_signal.signal(());
    }

    // Drives `fut` until it finishes or the context is cancelled, whichever
    // comes first. On cancellation the future is dropped and None is
    // returned.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        if self.is_cancelled() {
            return None;
        }
        match select(fut, self.wait_for_cancel()).await {
            Either::First(out) => Some(out),
            Either::Second(()) => None,
        }
    }

    // Returns false if the sleep was cut short by cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.run_until_cancelled(tokio::time::sleep(duration))
            .await
            .is_some()
    }
}
