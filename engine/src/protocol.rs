//! Messaging scaffold shared by every participant (§5, §9's "task + channel"
//! substitution for the source's one-process-per-participant MPI transport).
//!
//! Each participant owns one `tokio::sync::mpsc` mailbox; multiple peers hold
//! clones of its `Sender`, so the channel itself is the multi-producer side
//! of the protocol's point-to-point topology. Every payload riding a mailbox
//! is wrapped in [`simsom_types::Envelope`] so the receiver can validate
//! `sender` against the set of roles it expects for that variant (§7's
//! protocol-error class). The STOP control tag is not a mailbox variant: it
//! is a shared [`StopSignal`], mirroring how `envelope.rs` already documents
//! the control frame as out-of-band from the data variants.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Barrier};
use tokio::task::JoinHandle;
use tracing::warn;

/// Cooperative shutdown flag shared by every participant. Any participant
/// that detects quiescence (§5's "probe-with-timeout returns false") sets
/// this itself rather than waiting on the Analyzer, matching the source's
/// `handle_crash` escalation: a local stall is promoted to a global STOP.
#[derive(Clone)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Broadcasts STOP to every clone of this signal. Idempotent (§8
    /// "STOP idempotence"): setting `true` on an already-stopped signal is a
    /// no-op as far as observers are concerned.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Resolves once the signal is (or becomes) stopped. Used inside a
    /// `select!` alongside mailbox receipt so a STOP can interrupt an
    /// in-progress probe.
    pub async fn stopped(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        let _ = self.rx.changed().await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one probe-with-timeout cycle (§5's suspension-point contract).
pub enum Probe<T> {
    /// A payload arrived before the timeout.
    Message(T),
    /// No peer spoke within `timeout` and STOP had not already been
    /// observed — the caller must escalate (§7 "Quiescence / stall").
    Quiescent,
    /// STOP was already observed, or the mailbox's senders all dropped.
    Stopped,
}

/// Suspends until a message arrives, STOP fires, or `timeout` elapses,
/// whichever comes first. Never blocks indefinitely: this is the only
/// suspension point a participant's loop has (§5).
pub async fn probe<T>(
    mailbox: &mut mpsc::Receiver<T>,
    stop: &mut StopSignal,
    timeout: Duration,
) -> Probe<T> {
    if stop.is_stopped() {
        return Probe::Stopped;
    }
    tokio::select! {
        _ = stop.stopped() => Probe::Stopped,
        res = tokio::time::timeout(timeout, mailbox.recv()) => {
            match res {
                Ok(Some(msg)) => Probe::Message(msg),
                Ok(None) => Probe::Stopped,
                Err(_) => Probe::Quiescent,
            }
        }
    }
}

/// A non-blocking outbound channel with backpressure tracking (§4.3's
/// "outstanding non-blocking sends... when count exceeds a high-water mark
/// the loop waits for all to complete"). `try_send` is attempted first; if
/// the bounded channel is momentarily full, the send is promoted to a
/// spawned task whose `JoinHandle` is tracked, so the caller's loop is never
/// blocked by a single slow peer.
pub struct Outbox<T: Send + 'static> {
    sender: mpsc::Sender<T>,
    outstanding: VecDeque<JoinHandle<()>>,
    high_water_mark: usize,
}

impl<T: Send + 'static> Outbox<T> {
    pub fn new(sender: mpsc::Sender<T>, high_water_mark: usize) -> Self {
        Self {
            sender,
            outstanding: VecDeque::new(),
            high_water_mark,
        }
    }

    /// Send without blocking the caller. Drains outstanding sends first if
    /// the high-water mark has already been crossed.
    pub async fn send(&mut self, value: T) {
        if self.outstanding.len() > self.high_water_mark {
            self.drain().await;
        }
        match self.sender.try_send(value) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(value)) => {
                let sender = self.sender.clone();
                self.outstanding.push_back(tokio::spawn(async move {
                    let _ = sender.send(value).await;
                }));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("outbox send dropped: receiver gone");
            }
        }
    }

    /// Awaits every outstanding send. Called both when the high-water mark
    /// is crossed mid-loop and unconditionally before a participant enters
    /// the shutdown barrier (§4.3, §5).
    pub async fn drain(&mut self) {
        while let Some(handle) = self.outstanding.pop_front() {
            let _ = handle.await;
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}

/// Drains every message already buffered in `mailbox` without waiting,
/// matching §4.2's "drain further incoming until timeout" STOP handling:
/// once a participant has observed STOP it finishes what peers already
/// enqueued rather than discarding it, but never blocks to wait for more.
pub fn drain_ready<T>(mailbox: &mut mpsc::Receiver<T>) -> Vec<T> {
    let mut drained = Vec::new();
    while let Ok(msg) = mailbox.try_recv() {
        drained.push(msg);
    }
    drained
}

/// Wraps the shutdown [`Barrier`] every participant waits on after draining,
/// so every CSV flush, drained send, and acknowledged STOP has completed
/// before any participant exits (§5 "Shutdown barrier").
pub async fn enter_barrier(barrier: &Barrier) {
    barrier.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn probe_returns_quiescent_after_timeout_with_no_stop() {
        let (_tx, mut rx) = mpsc::channel::<u8>(1);
        let mut stop = StopSignal::new();
        match probe(&mut rx, &mut stop, Duration::from_millis(10)).await {
            Probe::Quiescent => {}
            _ => panic!("expected quiescent probe"),
        }
    }

    #[tokio::test]
    async fn probe_returns_stopped_once_triggered() {
        let (_tx, mut rx) = mpsc::channel::<u8>(1);
        let mut stop = StopSignal::new();
        stop.trigger();
        match probe(&mut rx, &mut stop, Duration::from_millis(500)).await {
            Probe::Stopped => {}
            _ => panic!("expected stopped probe"),
        }
    }

    #[tokio::test]
    async fn probe_stop_idempotent_after_already_stopped() {
        let (_tx, mut rx) = mpsc::channel::<u8>(1);
        let mut stop = StopSignal::new();
        stop.trigger();
        stop.trigger();
        assert!(stop.is_stopped());
        match probe(&mut rx, &mut stop, Duration::from_millis(10)).await {
            Probe::Stopped => {}
            _ => panic!("expected stopped probe"),
        }
    }

    #[tokio::test]
    async fn outbox_drains_outstanding_sends() {
        let (tx, mut rx) = mpsc::channel::<u8>(1);
        let mut outbox = Outbox::new(tx, 0);
        outbox.send(1).await;
        outbox.send(2).await; // channel capacity 1, so this one is spawned
        assert_eq!(rx.recv().await, Some(1));
        outbox.drain().await;
        assert_eq!(rx.recv().await, Some(2));
    }
}
