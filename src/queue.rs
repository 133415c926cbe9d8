//! Per-provider sequential gating.
//!
//! When sequential mode is on for a provider, at most one request is in the
//! processing state at a time; the rest park in a priority queue (strict
//! tier order, FIFO within a tier). Admission never preempts the in-flight
//! request. Mode switches are dynamic: turning sequential off drains the
//! queue by admitting every waiter without the single-flight constraint,
//! turning it on only affects requests enqueued afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::context::Priority;

/// Why `enter` refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterError {
    /// The wait queue is at `max_depth`.
    Full,
    /// The request's deadline expired before it reached the head of line.
    DeadlineExceeded,
}

/// How an admitted request holds the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotMode {
    /// Holds the single processing slot; release wakes the next waiter.
    Processing,
    /// Admitted without the single-flight constraint (concurrent mode or a
    /// drain); release is a no-op on the queue.
    Passthrough,
}

struct Waiter {
    seq: u64,
    priority: Priority,
    admit: oneshot::Sender<SlotMode>,
}

struct GateInner {
    sequential: bool,
    processing: bool,
    waiters: Vec<Waiter>,
    next_seq: u64,
}

impl GateInner {
    /// Index of the next waiter to admit: lowest priority rank, then FIFO.
    fn best_waiter(&self) -> Option<usize> {
        self.waiters
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| (w.priority.rank(), w.seq))
            .map(|(idx, _)| idx)
    }

    /// Hand the processing slot to the best waiter, skipping any whose
    /// receiver is already gone (deadline fired between park and wake).
    fn wake_next(&mut self) {
        while !self.processing {
            let Some(idx) = self.best_waiter() else {
                return;
            };
            let waiter = self.waiters.remove(idx);
            if waiter.admit.send(SlotMode::Processing).is_ok() {
                self.processing = true;
            }
        }
    }
}

struct Gate {
    inner: Mutex<GateInner>,
}

/// A held queue position. Must be released (or dropped) exactly once; drop
/// releases implicitly so cancellation cannot wedge the provider.
pub struct QueueSlot {
    gate: Arc<Gate>,
    mode: SlotMode,
    released: bool,
}

impl std::fmt::Debug for QueueSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSlot")
            .field("mode", &self.mode)
            .field("released", &self.released)
            .finish()
    }
}

impl QueueSlot {
    /// Release the slot and wake the next waiter.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.mode == SlotMode::Processing {
            let mut inner = self.gate.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.processing = false;
            if inner.sequential {
                inner.wake_next();
            }
        }
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Per-provider stats for the management API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub provider: String,
    pub sequential: bool,
    pub processing: bool,
    pub waiting: usize,
}

/// Registry of per-provider sequential gates.
pub struct SequentialQueues {
    gates: RwLock<HashMap<String, Arc<Gate>>>,
    max_depth: usize,
}

impl SequentialQueues {
    /// `sequential_providers` seeds the initial per-provider mode.
    pub fn new(max_depth: usize, sequential_providers: impl IntoIterator<Item = String>) -> Self {
        let gates = sequential_providers
            .into_iter()
            .map(|provider| {
                (
                    provider,
                    Arc::new(Gate {
                        inner: Mutex::new(GateInner {
                            sequential: true,
                            processing: false,
                            waiters: Vec::new(),
                            next_seq: 0,
                        }),
                    }),
                )
            })
            .collect();
        Self {
            gates: RwLock::new(gates),
            max_depth,
        }
    }

    fn gate(&self, provider: &str) -> Arc<Gate> {
        {
            let map = self.gates.read().unwrap_or_else(|e| e.into_inner());
            if let Some(gate) = map.get(provider) {
                return Arc::clone(gate);
            }
        }
        let mut map = self.gates.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(provider.to_string()).or_insert_with(|| {
            Arc::new(Gate {
                inner: Mutex::new(GateInner {
                    sequential: false,
                    processing: false,
                    waiters: Vec::new(),
                    next_seq: 0,
                }),
            })
        }))
    }

    pub fn is_sequential(&self, provider: &str) -> bool {
        let map = self.gates.read().unwrap_or_else(|e| e.into_inner());
        map.get(provider).is_some_and(|gate| {
            gate.inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .sequential
        })
    }

    /// Toggle a provider's mode. Turning sequential off drains the queue:
    /// every waiter is admitted immediately without the single-flight
    /// constraint. Turning it on affects only requests enqueued afterwards.
    pub fn set_sequential(&self, provider: &str, sequential: bool) {
        let gate = self.gate(provider);
        let mut inner = gate.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.sequential == sequential {
            return;
        }
        inner.sequential = sequential;
        if !sequential {
            tracing::info!(provider, waiters = inner.waiters.len(), "sequential mode off, draining queue");
            for waiter in inner.waiters.drain(..) {
                // A closed receiver means the waiter already timed out.
                let _ = waiter.admit.send(SlotMode::Passthrough);
            }
        } else {
            tracing::info!(provider, "sequential mode on");
        }
    }

    /// Enter the gate for `provider`, parking until admitted or `deadline`.
    pub async fn enter(
        &self,
        provider: &str,
        priority: Priority,
        deadline: Instant,
    ) -> Result<QueueSlot, EnterError> {
        let gate = self.gate(provider);

        let (seq, mut receiver) = {
            let mut inner = gate.inner.lock().unwrap_or_else(|e| e.into_inner());
            if !inner.sequential {
                return Ok(QueueSlot {
                    gate: Arc::clone(&gate),
                    mode: SlotMode::Passthrough,
                    released: false,
                });
            }
            if !inner.processing && inner.waiters.is_empty() {
                inner.processing = true;
                return Ok(QueueSlot {
                    gate: Arc::clone(&gate),
                    mode: SlotMode::Processing,
                    released: false,
                });
            }
            if inner.waiters.len() >= self.max_depth {
                return Err(EnterError::Full);
            }
            let (tx, rx) = oneshot::channel();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.waiters.push(Waiter {
                seq,
                priority,
                admit: tx,
            });
            (seq, rx)
        };

        tokio::select! {
            admitted = &mut receiver => match admitted {
                Ok(mode) => Ok(QueueSlot {
                    gate: Arc::clone(&gate),
                    mode,
                    released: false,
                }),
                // Sender dropped without admitting; treat as a timeout.
                Err(_) => Err(EnterError::DeadlineExceeded),
            },
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                {
                    let mut inner = gate.inner.lock().unwrap_or_else(|e| e.into_inner());
                    inner.waiters.retain(|w| w.seq != seq);
                }
                // If admission raced the deadline, the slot is already in
                // the channel and must be handed back before reporting the
                // timeout, or the provider would wedge.
                if let Ok(mode) = receiver.try_recv() {
                    QueueSlot { gate: Arc::clone(&gate), mode, released: false }.release();
                }
                Err(EnterError::DeadlineExceeded)
            }
        }
    }

    /// Stats for every known gate.
    pub fn stats(&self) -> Vec<QueueStats> {
        let map = self.gates.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<QueueStats> = map
            .iter()
            .map(|(provider, gate)| {
                let inner = gate.inner.lock().unwrap_or_else(|e| e.into_inner());
                QueueStats {
                    provider: provider.clone(),
                    sequential: inner.sequential,
                    processing: inner.processing,
                    waiting: inner.waiters.len(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }
}
