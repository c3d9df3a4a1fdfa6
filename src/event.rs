/*!
 * Task Events
 * Seam to the external task manager for destroy notifications
 */

use std::any::Any;
use std::fmt;

/// Event class reserved for the memory core in the external event-number
/// registry.
const EVENTCLASS_MEM: u32 = 0x0004_0000;

/// Conventional event number for context-destroyed notifications.
///
/// Callers registering with [`MemoryContext::on_destroy`](crate::MemoryContext::on_destroy)
/// may use any number from the registry; this is the one the memory core
/// suggests for its own notifications.
pub const EVENT_MCTX_DESTROYED: u32 = EVENTCLASS_MEM + 1;

/// A notification queued for delivery to a task.
pub struct Event {
    event_type: u32,
    arg: Box<dyn Any + Send>,
}

impl Event {
    pub fn new(event_type: u32, arg: Box<dyn Any + Send>) -> Self {
        Self { event_type, arg }
    }

    pub fn event_type(&self) -> u32 {
        self.event_type
    }

    /// Recover the payload supplied at construction.
    pub fn into_arg(self) -> Box<dyn Any + Send> {
        self.arg
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// Receiver half of the task manager contract.
///
/// `send` is called during context teardown with no context lock held; it
/// must enqueue the event for later dispatch rather than block.
pub trait Task: Send + Sync {
    fn send(&self, event: Event);
}
