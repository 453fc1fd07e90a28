//! Task broker bridging runtime callbacks to awaitable completions.
//!
//! Every asynchronous conversion registers a pending task and receives a
//! [`TaskHandle`]. The runtime is given the handle's token together with the
//! callback; when it reports completion the broker looks the handle up,
//! removes it, and resolves the waiting call through a oneshot channel.
//!
//! Handles are generation-tagged slot indices into a dense table. A slot is
//! only reused after its task was removed, and reuse bumps the generation, so
//! a stale or repeated completion never reaches another call's task. It is
//! reported as [`Error::ProtocolViolation`] instead.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::foreign::Ptr;

const INDEX_BITS: u32 = 16;

/// Maximum number of tasks in flight at once.
pub const MAX_PENDING_TASKS: usize = 1 << INDEX_BITS;

/// Opaque identifier of one in-flight asynchronous task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle {
    index: u16,
    generation: u16,
}

impl TaskHandle {
    /// Pack into the 32-bit token passed across the ABI.
    pub fn token(self) -> u32 {
        (u32::from(self.generation) << INDEX_BITS) | u32::from(self.index)
    }

    /// Unpack a token received from the runtime.
    pub fn from_token(token: u32) -> Self {
        Self {
            index: (token & 0xFFFF) as u16,
            generation: (token >> INDEX_BITS) as u16,
        }
    }

    pub fn index(self) -> u16 {
        self.index
    }

    pub fn generation(self) -> u16 {
        self.generation
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}.{}", self.index, self.generation)
    }
}

/// How a pending task was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The runtime produced an output buffer.
    Converted(Ptr),
    /// The runtime returned the null sentinel; the message is in the
    /// caller's error slot.
    Failed,
    /// The session was destroyed before the runtime completed the task.
    Destroyed,
}

/// Receiving side of a pending task.
#[derive(Debug)]
pub struct PendingTask {
    handle: TaskHandle,
    receiver: oneshot::Receiver<TaskOutcome>,
}

impl PendingTask {
    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    /// Wait for the broker to settle this task.
    pub async fn wait(self) -> Result<TaskOutcome> {
        self.receiver
            .await
            .map_err(|_| Error::Aborted(format!("{} was dropped unresolved", self.handle)))
    }
}

struct Slot {
    generation: u16,
    sender: Option<oneshot::Sender<TaskOutcome>>,
}

#[derive(Default)]
struct TaskTable {
    slots: Vec<Slot>,
    free: Vec<u16>,
    pending: usize,
    closed: bool,
}

impl TaskTable {
    /// Remove the task for `handle`, recycling its slot.
    fn take(&mut self, handle: TaskHandle) -> Option<oneshot::Sender<TaskOutcome>> {
        let slot = self.slots.get_mut(usize::from(handle.index))?;
        if slot.generation != handle.generation {
            return None;
        }
        let sender = slot.sender.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.pending -= 1;
        Some(sender)
    }
}

/// Table of pending asynchronous tasks.
#[derive(Default)]
pub struct TaskBroker {
    table: Mutex<TaskTable>,
}

impl TaskBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, TaskTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a new pending task.
    pub fn issue(&self) -> Result<PendingTask> {
        let mut table = self.table();
        if table.closed {
            return Err(Error::Destroyed);
        }

        let index = match table.free.pop() {
            Some(index) => index,
            None if table.slots.len() < MAX_PENDING_TASKS => {
                table.slots.push(Slot {
                    generation: 0,
                    sender: None,
                });
                (table.slots.len() - 1) as u16
            }
            None => return Err(Error::TaskCreation),
        };

        let (sender, receiver) = oneshot::channel();
        let slot = &mut table.slots[usize::from(index)];
        slot.sender = Some(sender);
        let handle = TaskHandle {
            index,
            generation: slot.generation,
        };
        table.pending += 1;

        debug!(%handle, "issued conversion task");
        Ok(PendingTask { handle, receiver })
    }

    /// Bind `handle` to a callback the runtime can invoke.
    pub fn callback(self: &Arc<Self>, handle: TaskHandle) -> TaskCallback {
        TaskCallback {
            handle,
            broker: Arc::clone(self),
        }
    }

    /// Settle the task for `handle` with the runtime's output pointer.
    ///
    /// A null `output` settles the task as [`TaskOutcome::Failed`].
    pub fn complete(&self, handle: TaskHandle, output: Ptr) -> Result<()> {
        let sender = self.table().take(handle);
        let Some(sender) = sender else {
            error!(%handle, "completion for unknown or already resolved task");
            return Err(Error::ProtocolViolation { handle });
        };

        let outcome = if output.is_null() {
            TaskOutcome::Failed
        } else {
            TaskOutcome::Converted(output)
        };
        debug!(%handle, ?outcome, "task completed");
        if sender.send(outcome).is_err() {
            debug!(%handle, "task completed after its waiter went away");
        }
        Ok(())
    }

    /// Drop the task for `handle` without settling it.
    ///
    /// Used when the runtime refuses to schedule the task. Returns whether a
    /// task was removed.
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        self.table().take(handle).is_some()
    }

    /// Reject every pending task with [`TaskOutcome::Destroyed`] and refuse
    /// new ones. Returns the number of tasks rejected.
    pub fn drain(&self) -> usize {
        let senders: Vec<_> = {
            let mut table = self.table();
            table.closed = true;
            table.free.clear();
            table.pending = 0;
            let senders = table
                .slots
                .drain(..)
                .filter_map(|slot| slot.sender)
                .collect();
            senders
        };

        let drained = senders.len();
        for sender in senders {
            let _ = sender.send(TaskOutcome::Destroyed);
        }
        if drained > 0 {
            debug!(drained, "rejected pending tasks on destroy");
        }
        drained
    }

    /// Number of tasks issued but not yet settled.
    pub fn pending(&self) -> usize {
        self.table().pending
    }
}

impl fmt::Debug for TaskBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table();
        f.debug_struct("TaskBroker")
            .field("pending", &table.pending)
            .field("closed", &table.closed)
            .finish()
    }
}

/// The completion callback handed to a runtime for one task.
#[derive(Clone)]
pub struct TaskCallback {
    handle: TaskHandle,
    broker: Arc<TaskBroker>,
}

impl TaskCallback {
    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    /// The 32-bit token identifying this callback across the ABI.
    pub fn token(&self) -> u32 {
        self.handle.token()
    }

    /// Report completion: `callback(errorPtrPtr, outputPtr)`.
    ///
    /// The error slot belongs to the caller's arena and is decoded there.
    pub fn invoke(&self, error_slot: Ptr, output: Ptr) -> Result<()> {
        debug!(handle = %self.handle, %error_slot, "runtime callback");
        self.broker.complete(self.handle, output)
    }
}

impl fmt::Debug for TaskCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCallback")
            .field("handle", &self.handle)
            .finish()
    }
}
