//! Per-request completion.
//!
//! [`create`] returns a handle and a controller sharing one completion cell.
//! Only the controller moves the cell through its lifecycle:
//!
//! ```text
//! Created ──► Queued ──► Sent ──► Succeeded | Faulted | Canceled ──► Consumed
//!    └──────────────────────┘ (a write may skip Queued)
//! ```
//!
//! Terminal transitions are first-wins. The handle consumes the outcome
//! exactly once, either by blocking on a condition variable ([`wait`]) or by
//! being awaited.
//!
//! Each thread keeps one retired cell for reuse, so steady pipelining
//! allocates almost nothing per request.
//!
//! [`wait`]: OperationHandle::wait

use crate::command::{CommandFlags, ReplyParser};
use crate::error::{ClientError, UsageError};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use resplex_protocol::Frame;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Lifecycle phase of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Queued,
    Sent,
    Succeeded,
    Faulted,
    Canceled,
    Consumed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Faulted | Phase::Canceled)
    }
}

struct Slot {
    phase: Phase,
    /// Whether the command reached the transport at least once.
    sent: bool,
    outcome: Option<Result<Frame, ClientError>>,
    waker: Option<Waker>,
}

impl Slot {
    fn fresh() -> Self {
        Self {
            phase: Phase::Created,
            sent: false,
            outcome: None,
            waker: None,
        }
    }
}

pub(crate) struct CompletionCell {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl CompletionCell {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::fresh()),
            ready: Condvar::new(),
        }
    }
}

thread_local! {
    static SPARE_CELL: RefCell<Option<Arc<CompletionCell>>> = const { RefCell::new(None) };
}

fn rent_cell() -> Arc<CompletionCell> {
    SPARE_CELL
        .with(|spare| spare.borrow_mut().take())
        .unwrap_or_else(|| Arc::new(CompletionCell::new()))
}

fn retire_cell(mut cell: Arc<CompletionCell>) {
    // Reusable only once the controller side is gone too.
    let Some(inner) = Arc::get_mut(&mut cell) else {
        return;
    };
    *inner.slot.get_mut() = Slot::fresh();
    let _ = SPARE_CELL.try_with(|spare| {
        let mut spare = spare.borrow_mut();
        if spare.is_none() {
            *spare = Some(cell);
        }
    });
}

/// Creates a linked handle and controller.
pub fn create<T>(parser: impl ReplyParser<T> + 'static) -> (OperationHandle<T>, OperationController) {
    let cell = rent_cell();
    let handle = OperationHandle {
        cell: Some(cell.clone()),
        parser: Box::new(parser),
    };
    (handle, OperationController { cell })
}

/// The completing side of an operation.
pub struct OperationController {
    cell: Arc<CompletionCell>,
}

impl OperationController {
    /// Another controller for the same operation.
    pub(crate) fn share(&self) -> OperationController {
        OperationController {
            cell: self.cell.clone(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.cell.slot.lock().phase
    }

    /// Whether the command reached the transport at least once.
    pub fn was_sent(&self) -> bool {
        self.cell.slot.lock().sent
    }

    pub fn is_canceled(&self) -> bool {
        self.phase() == Phase::Canceled
    }

    /// Marks the operation accepted by a connection or the retry queue.
    ///
    /// Also used when a failed operation is requeued for retry.
    pub fn on_queued(&self) -> bool {
        let mut slot = self.cell.slot.lock();
        match slot.phase {
            Phase::Created | Phase::Sent => {
                slot.phase = Phase::Queued;
                true
            }
            _ => false,
        }
    }

    /// Marks the command bytes as handed to the transport.
    pub fn on_sent(&self) -> bool {
        let mut slot = self.cell.slot.lock();
        match slot.phase {
            Phase::Created | Phase::Queued => {
                slot.phase = Phase::Sent;
                slot.sent = true;
                true
            }
            _ => false,
        }
    }

    fn complete(&self, phase: Phase, outcome: Result<Frame, ClientError>) -> bool {
        let waker = {
            let mut slot = self.cell.slot.lock();
            if slot.phase.is_terminal() || slot.phase == Phase::Consumed {
                return false;
            }
            slot.phase = phase;
            slot.outcome = Some(outcome);
            slot.waker.take()
        };
        self.cell.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Completes with a reply. Error frames fault the operation.
    pub fn try_set_result(&self, frame: Frame) -> bool {
        match frame {
            Frame::Error(message) => {
                self.complete(Phase::Faulted, Err(ClientError::server(&message)))
            }
            frame => self.complete(Phase::Succeeded, Ok(frame)),
        }
    }

    pub fn try_set_exception(&self, err: ClientError) -> bool {
        self.complete(Phase::Faulted, Err(err))
    }

    pub fn try_cancel(&self) -> bool {
        self.complete(Phase::Canceled, Err(ClientError::Canceled))
    }
}

impl fmt::Debug for OperationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationController")
            .field("phase", &self.phase())
            .finish()
    }
}

/// The consuming side of an operation.
///
/// Await it, or call [`OperationHandle::wait`] from a thread outside the
/// async runtime.
pub struct OperationHandle<T> {
    cell: Option<Arc<CompletionCell>>,
    parser: Box<dyn ReplyParser<T>>,
}

impl<T> OperationHandle<T> {
    fn cell(&self) -> &CompletionCell {
        self.cell
            .as_deref()
            .expect("operation handle used after its result was consumed")
    }

    pub fn phase(&self) -> Phase {
        match &self.cell {
            Some(cell) => cell.slot.lock().phase,
            None => Phase::Consumed,
        }
    }

    /// Cancels the operation.
    ///
    /// Before the command is sent this suppresses transmission; afterwards
    /// only this handle observes the cancellation.
    pub fn cancel(&self) -> bool {
        OperationController {
            cell: match &self.cell {
                Some(cell) => cell.clone(),
                None => return false,
            },
        }
        .try_cancel()
    }

    fn take_outcome(slot: &mut Slot) -> Result<Frame, ClientError> {
        slot.phase = Phase::Consumed;
        slot.waker = None;
        slot.outcome
            .take()
            .unwrap_or(Err(ClientError::Usage(UsageError::AlreadyConsumed)))
    }

    fn finish(&mut self, outcome: Result<Frame, ClientError>) -> Result<T, ClientError> {
        if let Some(cell) = self.cell.take() {
            retire_cell(cell);
        }
        self.parser.parse(outcome?)
    }

    /// Takes the result if the operation has completed.
    pub fn try_result(&mut self) -> Option<Result<T, ClientError>> {
        let Some(cell) = self.cell.as_ref() else {
            return Some(Err(UsageError::AlreadyConsumed.into()));
        };
        let outcome = {
            let mut slot = cell.slot.lock();
            if !slot.phase.is_terminal() {
                return None;
            }
            Self::take_outcome(&mut slot)
        };
        Some(self.finish(outcome))
    }

    /// Blocks the current thread until the operation completes.
    ///
    /// Fails with [`UsageError::NotYetSent`] when the operation was never
    /// handed to a connection (for example, it sits in an unflushed batch).
    /// On timeout the result is abandoned.
    pub fn wait(mut self, timeout: Duration) -> Result<T, ClientError> {
        let deadline = Instant::now() + timeout;
        let outcome = {
            let cell = self.cell();
            let mut slot = cell.slot.lock();
            loop {
                match slot.phase {
                    Phase::Created => {
                        slot.phase = Phase::Consumed;
                        return Err(UsageError::NotYetSent.into());
                    }
                    Phase::Consumed => return Err(UsageError::AlreadyConsumed.into()),
                    phase if phase.is_terminal() => break Self::take_outcome(&mut slot),
                    _ => {}
                }
                if cell.ready.wait_until(&mut slot, deadline).timed_out()
                    && !slot.phase.is_terminal()
                {
                    slot.phase = Phase::Consumed;
                    return Err(ClientError::Timeout);
                }
            }
        };
        self.finish(outcome)
    }
}

impl<T> Future for OperationHandle<T> {
    type Output = Result<T, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = {
            let cell = this.cell();
            let mut slot = cell.slot.lock();
            match slot.phase {
                Phase::Created => {
                    slot.phase = Phase::Consumed;
                    Err(UsageError::NotYetSent.into())
                }
                Phase::Consumed => Err(UsageError::AlreadyConsumed.into()),
                phase if phase.is_terminal() => Self::take_outcome(&mut slot),
                _ => {
                    match &mut slot.waker {
                        Some(waker) if waker.will_wake(cx.waker()) => {}
                        waker => *waker = Some(cx.waker().clone()),
                    }
                    return Poll::Pending;
                }
            }
        };
        Poll::Ready(this.finish(outcome))
    }
}

impl<T> Drop for OperationHandle<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            let done = {
                let slot = cell.slot.lock();
                slot.phase.is_terminal() || slot.phase == Phase::Consumed
            };
            if done {
                retire_cell(cell);
            }
        }
    }
}

impl<T> fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("phase", &self.phase())
            .finish()
    }
}

/// One outstanding request as seen by connections and the retry queue.
pub(crate) struct Message {
    pub payload: Bytes,
    pub flags: CommandFlags,
    pub slot: Option<u16>,
    /// Endpoint that must serve this message, bypassing slot routing.
    pub pinned: Option<Arc<str>>,
    pub controller: OperationController,
    pub created_at: Instant,
}

impl Message {
    pub fn new(payload: Bytes, flags: CommandFlags, controller: OperationController) -> Self {
        Self {
            payload,
            flags,
            slot: None,
            pinned: None,
            controller,
            created_at: Instant::now(),
        }
    }

    pub fn fail(self, err: ClientError) {
        self.controller.try_set_exception(err);
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        // No effect once the operation completed.
        self.controller.try_cancel();
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.payload.len())
            .field("flags", &self.flags)
            .field("slot", &self.slot)
            .field("phase", &self.controller.phase())
            .finish()
    }
}
