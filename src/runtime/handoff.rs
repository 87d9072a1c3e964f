//! One-shot ownership transfer of an accepted connection to its worker.
//!
//! The channel has no buffer, so a delivery only succeeds at the moment the
//! worker is blocked in [`Claim::claim`]. When `deliver` returns `Ok` the
//! worker owns the item and the sender can never observe it again.

use crate::shutdown::ShutdownFlag;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

/// Sending half, held by the accept loop.
#[derive(Debug)]
pub struct Handoff<T> {
    tx: SyncSender<T>,
}

/// Receiving half, moved into the worker thread.
#[derive(Debug)]
pub struct Claim<T> {
    rx: Receiver<T>,
}

/// Why a delivery did not complete. The undelivered item is handed back.
#[derive(Debug)]
pub enum HandoffError<T> {
    /// Shutdown was requested before the worker claimed the item.
    Abandoned(T),
    /// The worker went away without claiming.
    Disconnected(T),
}

impl<T> HandoffError<T> {
    pub fn into_inner(self) -> T {
        match self {
            HandoffError::Abandoned(item) | HandoffError::Disconnected(item) => item,
        }
    }
}

/// Create a connected handoff pair.
pub fn channel<T>() -> (Handoff<T>, Claim<T>) {
    let (tx, rx) = mpsc::sync_channel(0);
    (Handoff { tx }, Claim { rx })
}

impl<T> Handoff<T> {
    /// Block until the worker has taken `item`.
    ///
    /// Waits in slices of `slice` so a shutdown request is noticed within one
    /// slice even if the worker never shows up. `SyncSender` has no timed
    /// send, so each slice is a failed `try_send` followed by a sleep.
    pub fn deliver(
        self,
        mut item: T,
        slice: Duration,
        shutdown: &ShutdownFlag,
    ) -> Result<(), HandoffError<T>> {
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(back)) => {
                    return Err(HandoffError::Disconnected(back));
                }
                Err(TrySendError::Full(back)) => {
                    if shutdown.is_requested() {
                        return Err(HandoffError::Abandoned(back));
                    }
                    item = back;
                    thread::sleep(slice);
                }
            }
        }
    }
}

impl<T> Claim<T> {
    /// Take ownership of the delivered item, or `None` if the sender gave up.
    pub fn claim(self) -> Option<T> {
        self.rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLICE: Duration = Duration::from_micros(100);

    #[test]
    fn test_delivery_transfers_ownership() {
        let (handoff, claim) = channel::<String>();
        let shutdown = ShutdownFlag::new();

        let worker = thread::spawn(move || claim.claim());
        handoff
            .deliver("socket".to_string(), SLICE, &shutdown)
            .unwrap();

        assert_eq!(worker.join().unwrap().as_deref(), Some("socket"));
    }

    #[test]
    fn test_delivery_waits_for_late_claim() {
        let (handoff, claim) = channel::<u32>();
        let shutdown = ShutdownFlag::new();

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            claim.claim()
        });
        handoff.deliver(7, SLICE, &shutdown).unwrap();

        assert_eq!(worker.join().unwrap(), Some(7));
    }

    #[test]
    fn test_disconnected_worker_returns_item() {
        let (handoff, claim) = channel::<u32>();
        drop(claim);

        let err = handoff.deliver(3, SLICE, &ShutdownFlag::new()).unwrap_err();
        assert!(matches!(err, HandoffError::Disconnected(3)));
    }

    #[test]
    fn test_shutdown_abandons_unclaimed_item() {
        let (handoff, _claim) = channel::<u32>();
        let shutdown = ShutdownFlag::new();
        shutdown.request();

        let err = handoff.deliver(9, SLICE, &shutdown).unwrap_err();
        assert_eq!(err.into_inner(), 9);
    }

    #[test]
    fn test_shutdown_while_waiting_ends_within_slices() {
        let (handoff, _claim) = channel::<u32>();
        let shutdown = ShutdownFlag::new();
        let slice = Duration::from_millis(10);

        let requester = {
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                shutdown.request();
            })
        };

        let started = std::time::Instant::now();
        let err = handoff.deliver(5, slice, &shutdown).unwrap_err();
        assert!(matches!(err, HandoffError::Abandoned(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
        requester.join().unwrap();
    }

    #[test]
    fn test_claim_after_sender_gives_up() {
        let (handoff, claim) = channel::<u32>();
        drop(handoff);
        assert_eq!(claim.claim(), None);
    }
}
