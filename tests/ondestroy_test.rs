/*!
 * Destroy Notification Tests
 * FIFO delivery of (task, event) pairs at final teardown
 */

use dnsmem::{Event, MemoryContext, Task, EVENT_MCTX_DESTROYED};
use pretty_assertions::assert_eq;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};

/// Test task that forwards deliveries to an mpsc channel.
struct QueueTask {
    name: &'static str,
    tx: Mutex<Sender<(&'static str, u32)>>,
}

impl QueueTask {
    fn new(name: &'static str, tx: Sender<(&'static str, u32)>) -> Arc<Self> {
        Arc::new(Self {
            name,
            tx: Mutex::new(tx),
        })
    }
}

impl Task for QueueTask {
    fn send(&self, event: Event) {
        assert_eq!(event.event_type(), EVENT_MCTX_DESTROYED);
        let tag = *event.into_arg().downcast::<u32>().unwrap();
        self.tx.lock().unwrap().send((self.name, tag)).unwrap();
    }
}

#[test]
fn notifications_arrive_in_registration_order() {
    let (tx, rx) = channel();
    let ctx = MemoryContext::create(0, 0).unwrap();
    let task_a = QueueTask::new("a", tx.clone());
    let task_b = QueueTask::new("b", tx);

    ctx.on_destroy(task_a, Event::new(EVENT_MCTX_DESTROYED, Box::new(1u32)))
        .unwrap();
    ctx.on_destroy(task_b, Event::new(EVENT_MCTX_DESTROYED, Box::new(2u32)))
        .unwrap();

    let held = ctx.attach().unwrap();
    drop(ctx);
    // a handle remains, so teardown has not happened yet
    assert!(rx.try_recv().is_err());

    drop(held);
    assert_eq!(rx.try_recv().unwrap(), ("a", 1));
    assert_eq!(rx.try_recv().unwrap(), ("b", 2));
    assert!(rx.try_recv().is_err());
}

#[test]
fn registration_on_terminal_context_returns_the_event() {
    let (tx, _rx) = channel();
    let ctx = MemoryContext::create(0, 0).unwrap();
    let held = ctx.attach().unwrap();
    ctx.destroy();

    let task = QueueTask::new("late", tx);
    let rejected = held
        .on_destroy(task, Event::new(EVENT_MCTX_DESTROYED, Box::new(9u32)))
        .unwrap_err();
    assert_eq!(rejected.0.event_type(), EVENT_MCTX_DESTROYED);
    assert_eq!(*rejected.0.into_arg().downcast::<u32>().unwrap(), 9);
}

#[test]
fn destroy_delivers_once_the_last_handle_detaches() {
    let (tx, rx) = channel();
    let ctx = MemoryContext::create(0, 0).unwrap();
    let task = QueueTask::new("only", tx);
    ctx.on_destroy(task, Event::new(EVENT_MCTX_DESTROYED, Box::new(7u32)))
        .unwrap();

    ctx.destroy();
    assert_eq!(rx.try_recv().unwrap(), ("only", 7));
    assert!(rx.try_recv().is_err());
}
