//! Single-flight register/command RPC.
//!
//! One transaction is in flight per link at any time. Instead of matching
//! replies against a table of in-band identifiers, the engine keeps one
//! shared transaction slot as an explicit state machine
//! (`Idle -> Pending -> Completed`) plus monotonic request/response
//! counters for observability. The slot design is sound only because the
//! request mutex guarantees no new request is enqueued while one is
//! outstanding; register access is low-rate relative to bulk data, so the
//! lost throughput buys a much simpler correlation protocol.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;

use crate::{
    codec::{CommandFrame, RegisterReply, RegisterRequest},
    dest::{TransportError, TxFrame, TxPayload, max_register_words, set::DestinationSet},
    protocol::{Routing, TxKind},
    queue::BoundedQueue,
    register::{Command, Register},
    stats::LinkStats,
    sync::{AtomicDuration, Notifier, event},
};

/// Effectively-forever wait used when timeouts are disabled for debugging.
const NO_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24);

/// Errors surfaced to `execute` callers.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No matching response arrived within the configured window on any
    /// attempt. The engine has returned to idle; subsequent requests are
    /// not blocked.
    #[error("transaction timed out after {attempts} attempt(s)")]
    TransactionTimeout { attempts: u32 },

    /// Open/transmit/receive failure at the OS or driver boundary. Fatal to
    /// this operation only; the link stays open for retry by the caller.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The device acknowledged the transaction with a non-zero status word
    /// on every attempt.
    #[error("device status {status:#010x} for register {name} @ {address:#010x}")]
    Status {
        name: String,
        address: u32,
        status: u32,
    },

    /// The register's framed size exceeds the link's frame budget.
    #[error("register {name} of {words} words exceeds the frame budget of {max} words")]
    RegisterTooLarge {
        name: String,
        words: usize,
        max: usize,
    },

    /// The link is not in the `Open` state.
    #[error("link is not open")]
    NotOpen,

    /// The pump tasks went away while the transaction was waiting.
    #[error("link closed while a transaction was in flight")]
    Closed,
}

enum TxTarget<'a> {
    Register { register: &'a mut Register, write: bool },
    Command(Command),
    Data(Bytes),
}

/// One register, command or data-send request against a link.
///
/// Borrows the caller's [`Register`] for its duration; the engine mutates
/// it in place when the response lands. Defaults: wait for completion, use
/// the link's configured timeout.
pub struct Transaction<'a> {
    target: TxTarget<'a>,
    routing: Routing,
    wait: bool,
    timeout: Option<Duration>,
}

impl<'a> Transaction<'a> {
    fn new(target: TxTarget<'a>, routing: Routing) -> Self {
        Self {
            target,
            routing,
            wait: true,
            timeout: None,
        }
    }

    pub fn read(register: &'a mut Register, routing: Routing) -> Self {
        Self::new(TxTarget::Register { register, write: false }, routing)
    }

    pub fn write(register: &'a mut Register, routing: Routing) -> Self {
        Self::new(TxTarget::Register { register, write: true }, routing)
    }

    pub fn command(command: &Command, routing: Routing) -> Self {
        Self::new(TxTarget::Command(command.clone()), routing)
    }

    pub fn data_send(payload: Bytes, routing: Routing) -> Self {
        Self::new(TxTarget::Data(payload), routing)
    }

    /// Fire the request without blocking on completion.
    #[must_use]
    pub fn no_wait(mut self) -> Self {
        self.wait = false;
        self
    }

    /// Overrides the link's default response timeout for this transaction.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn kind(&self) -> TxKind {
        match &self.target {
            TxTarget::Register { write: false, .. } => TxKind::RegisterRead,
            TxTarget::Register { write: true, .. } => TxKind::RegisterWrite,
            TxTarget::Command(_) => TxKind::Command,
            TxTarget::Data(_) => TxKind::Data,
        }
    }

    fn name(&self) -> &str {
        match &self.target {
            TxTarget::Register { register, .. } => register.name(),
            TxTarget::Command(cmd) => cmd.name(),
            TxTarget::Data(_) => "data",
        }
    }

    fn address(&self) -> u32 {
        match &self.target {
            TxTarget::Register { register, .. } => register.address(),
            _ => 0,
        }
    }

    fn payload(&self, context: u32) -> TxPayload {
        match &self.target {
            TxTarget::Register { register, write: false } => {
                TxPayload::Register(RegisterRequest::Read {
                    context,
                    address: register.address(),
                    count: register.size(),
                })
            }
            TxTarget::Register { register, write: true } => {
                TxPayload::Register(RegisterRequest::Write {
                    context,
                    address: register.address(),
                    data: register.data().to_vec(),
                })
            }
            TxTarget::Command(cmd) => TxPayload::Command(CommandFrame {
                context,
                opcode: cmd.opcode(),
            }),
            TxTarget::Data(data) => TxPayload::Data(data.clone()),
        }
    }
}

/// The shared transaction slot.
pub(crate) enum TxState {
    Idle,
    Pending(PendingTx),
    Completed(Completion),
}

pub(crate) struct PendingTx {
    kind: TxKind,
    address: u32,
    context: u32,
    notifier: Notifier,
}

pub(crate) enum Completion {
    /// A register-class frame matched the outstanding request.
    Register(RegisterReply),
    /// A command or data-send left the wire.
    Sent,
    /// The transmit path failed outright.
    Fault(TransportError),
}

/// One queued unit of outbound work for the I/O task.
pub(crate) struct TxRequest {
    pub(crate) frame: TxFrame,
    /// Whether the transaction slot is watching this request.
    pub(crate) tracked: bool,
}

pub(crate) struct EngineConfig {
    pub(crate) timeout: Duration,
    pub(crate) attempts: u32,
    pub(crate) max_frame: usize,
}

pub(crate) struct TransactionEngine {
    /// Serializes callers; enforces the single-flight invariant.
    serial: async_mutex::Mutex<()>,
    slot: Mutex<TxState>,
    outbound: Arc<BoundedQueue<TxRequest>>,
    dests: Arc<DestinationSet>,
    stats: Arc<LinkStats>,
    timeout: AtomicDuration,
    timeouts_disabled: AtomicBool,
    attempts: u32,
    max_frame: usize,
    request_count: AtomicU32,
    response_count: AtomicU32,
}

impl TransactionEngine {
    pub(crate) fn new(
        dests: Arc<DestinationSet>,
        outbound: Arc<BoundedQueue<TxRequest>>,
        stats: Arc<LinkStats>,
        config: EngineConfig,
    ) -> Self {
        Self {
            serial: async_mutex::Mutex::new(()),
            slot: Mutex::new(TxState::Idle),
            outbound,
            dests,
            stats,
            timeout: AtomicDuration::new(config.timeout),
            timeouts_disabled: AtomicBool::new(false),
            attempts: config.attempts.max(1),
            max_frame: config.max_frame,
            request_count: AtomicU32::new(0),
            response_count: AtomicU32::new(0),
        }
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        self.timeout.store(timeout, Ordering::Relaxed);
    }

    /// Disables response timeouts (waits become effectively unbounded).
    /// Bring-up aid for debugger-stalled devices.
    pub(crate) fn disable_timeouts(&self, disable: bool) {
        self.timeouts_disabled.store(disable, Ordering::Relaxed);
    }

    pub(crate) fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub(crate) fn response_count(&self) -> u32 {
        self.response_count.load(Ordering::Relaxed)
    }

    fn set_slot(&self, state: TxState) -> TxState {
        std::mem::replace(&mut *self.slot.lock().expect("transaction slot lock"), state)
    }

    fn check_budget(&self, tx: &Transaction<'_>) -> Result<(), LinkError> {
        match &tx.target {
            TxTarget::Register { register, .. } => {
                let max = max_register_words(self.max_frame);
                if register.size() > max {
                    return Err(LinkError::RegisterTooLarge {
                        name: register.name().to_string(),
                        words: register.size(),
                        max,
                    });
                }
            }
            TxTarget::Data(data) => {
                if data.len() > self.max_frame {
                    return Err(LinkError::Transport(TransportError::FrameTooLarge {
                        got: data.len(),
                        max: self.max_frame,
                    }));
                }
            }
            TxTarget::Command(_) => {}
        }
        Ok(())
    }

    /// Runs one transaction to completion (or failure), retrying timeouts
    /// and status errors up to the configured attempt limit.
    pub(crate) async fn execute(&self, mut tx: Transaction<'_>) -> Result<(), LinkError> {
        let _guard = self.serial.lock().await;

        self.check_budget(&tx)?;

        let synchronous = self.dests.get(tx.routing.index())?.is_synchronous();
        let timeout = if self.timeouts_disabled.load(Ordering::Relaxed) {
            NO_TIMEOUT
        } else {
            tx.timeout
                .unwrap_or_else(|| self.timeout.load(Ordering::Relaxed))
        };

        let kind = tx.kind();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let context = self
                .request_count
                .fetch_add(1, Ordering::AcqRel)
                .wrapping_add(1);
            let frame = TxFrame::new(tx.payload(context), tx.routing);

            let completion = if synchronous {
                // Synchronous destinations skip the queue entirely; the
                // register access happens right here in the caller.
                let result = self.dests.transmit(frame).await?;
                match result.reply {
                    Some(reply) => Completion::Register(reply),
                    None => Completion::Sent,
                }
            } else {
                let (notifier, waiter) = event::new();
                self.set_slot(TxState::Pending(PendingTx {
                    kind,
                    address: tx.address(),
                    context,
                    notifier,
                }));

                let request = TxRequest { frame, tracked: true };
                if self.outbound.push(request, timeout).await.is_err() {
                    self.set_slot(TxState::Idle);
                    LinkStats::bump(&self.stats.timeouts);
                    return Err(LinkError::TransactionTimeout { attempts: attempt });
                }

                if !tx.wait {
                    // Fire and forget: a late response still completes the
                    // slot, nobody observes it.
                    return Ok(());
                }

                match tokio::time::timeout(timeout, waiter.wait()).await {
                    Ok(Ok(())) => match self.set_slot(TxState::Idle) {
                        TxState::Completed(completion) => completion,
                        // Woken without a completion; count it against the
                        // attempt budget like a timeout.
                        _ => {
                            LinkStats::bump(&self.stats.timeouts);
                            if attempt >= self.attempts {
                                return Err(LinkError::TransactionTimeout { attempts: attempt });
                            }
                            continue;
                        }
                    },
                    Ok(Err(_)) => {
                        self.set_slot(TxState::Idle);
                        return Err(LinkError::Closed);
                    }
                    Err(_) => {
                        self.set_slot(TxState::Idle);
                        LinkStats::bump(&self.stats.timeouts);
                        tracing::warn!(
                            name = tx.name(),
                            address = %format_args!("{:#010x}", tx.address()),
                            attempt,
                            "transaction timeout, trying again"
                        );
                        if attempt >= self.attempts {
                            return Err(LinkError::TransactionTimeout { attempts: attempt });
                        }
                        continue;
                    }
                }
            };

            match completion {
                Completion::Register(reply) => {
                    LinkStats::bump(&self.stats.reg_rx);
                    self.response_count.fetch_add(1, Ordering::AcqRel);

                    let status = reply.status;
                    if let TxTarget::Register { register, write } = &mut tx.target {
                        if !*write {
                            if status == 0 {
                                let n = register.size().min(reply.data.len());
                                register.data_mut()[..n].copy_from_slice(&reply.data[..n]);
                            } else {
                                // Poison the shadow so a failed read is
                                // never mistaken for device data.
                                register.data_mut().fill(0xFFFF_FFFF);
                            }
                        }
                        register.set_status(status);
                    }

                    if status != 0 {
                        tracing::warn!(
                            name = tx.name(),
                            status = %format_args!("{status:#010x}"),
                            attempt,
                            "status error, trying again"
                        );
                        if attempt >= self.attempts {
                            return Err(LinkError::Status {
                                name: tx.name().to_string(),
                                address: tx.address(),
                                status,
                            });
                        }
                        continue;
                    }

                    if let TxTarget::Register { register, .. } = &mut tx.target {
                        register.clear_stale();
                    }
                    return Ok(());
                }
                Completion::Sent => {
                    self.response_count.fetch_add(1, Ordering::AcqRel);
                    return Ok(());
                }
                Completion::Fault(e) => return Err(LinkError::Transport(e)),
            }
        }
    }

    /// Fire-and-forget enqueue; mirrors the run-command queue. Completion
    /// is never tracked, ordering is still guaranteed by the queue.
    pub(crate) async fn execute_async(&self, tx: Transaction<'_>) -> Result<(), LinkError> {
        let _guard = self.serial.lock().await;

        self.check_budget(&tx)?;

        let context = self
            .request_count
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);
        let frame = TxFrame::new(tx.payload(context), tx.routing);

        if self.dests.get(tx.routing.index())?.is_synchronous() {
            self.dests.transmit(frame).await?;
            return Ok(());
        }

        let timeout = self.timeout.load(Ordering::Relaxed);
        let request = TxRequest { frame, tracked: false };
        if self.outbound.push(request, timeout).await.is_err() {
            LinkStats::bump(&self.stats.timeouts);
            return Err(LinkError::TransactionTimeout { attempts: 1 });
        }
        Ok(())
    }

    // --- completion paths, driven by the pump tasks ---

    /// Register-class frame from the receive task. Completes the slot when
    /// it matches the outstanding request, otherwise counts it as
    /// unexpected. The context echo is diagnostics only and never gates
    /// completion.
    pub(crate) fn complete_register(&self, reply: RegisterReply) {
        let mut slot = self.slot.lock().expect("transaction slot lock");
        let matches = matches!(
            &*slot,
            TxState::Pending(p)
                if matches!(p.kind, TxKind::RegisterRead | TxKind::RegisterWrite)
                    && p.address == reply.address
        );

        if !matches {
            LinkStats::bump(&self.stats.unexpected);
            tracing::debug!(
                address = %format_args!("{:#010x}", reply.address),
                context = reply.context,
                "unexpected register frame"
            );
            return;
        }

        if let TxState::Pending(p) = &*slot {
            if p.context != reply.context {
                tracing::debug!(
                    expected = p.context,
                    got = reply.context,
                    "context echo mismatch on matching register reply"
                );
            }
        }

        if let TxState::Pending(pending) =
            std::mem::replace(&mut *slot, TxState::Completed(Completion::Register(reply)))
        {
            let _ = pending.notifier.notify();
        }
    }

    /// Transmit acknowledgement from the I/O task for command/data-send
    /// requests.
    pub(crate) fn complete_sent(&self) {
        let mut slot = self.slot.lock().expect("transaction slot lock");
        if matches!(&*slot, TxState::Pending(p) if matches!(p.kind, TxKind::Command | TxKind::Data))
        {
            if let TxState::Pending(pending) =
                std::mem::replace(&mut *slot, TxState::Completed(Completion::Sent))
            {
                let _ = pending.notifier.notify();
            }
        }
    }

    /// Transport failure from the I/O task; fails whatever is pending.
    pub(crate) fn complete_fault(&self, error: TransportError) {
        let mut slot = self.slot.lock().expect("transaction slot lock");
        if matches!(&*slot, TxState::Pending(_)) {
            if let TxState::Pending(pending) =
                std::mem::replace(&mut *slot, TxState::Completed(Completion::Fault(error)))
            {
                let _ = pending.notifier.notify();
            }
        }
    }
}
