use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::thread;
use std::thread::JoinHandle;

use parking_lot::Mutex;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Shutdown,
}

struct Buffer {
    ready: bool,
    pending: VecDeque<Task>,
}

/// Serializes all datastore operations onto one worker thread, in
/// submission order.
///
/// Until the datastore has loaded, pushed tasks are parked in a buffer;
/// [Executor::process_buffer] releases them in order once loading
/// succeeds. The load task itself bypasses the buffer with
/// `force_queuing`.
///
/// A panicking task (usually a user callback) is caught and logged, and
/// the worker moves on to the next task. One misbehaving callback never
/// stalls the queue.
pub(crate) struct Executor {
    sender: Mutex<Sender<Message>>,
    buffer: Mutex<Buffer>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    pub fn new() -> Self {
        let (sender, receiver) = channel::<Message>();
        let worker = thread::Builder::new()
            .name("plume-executor".to_string())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        Message::Run(task) => {
                            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                                log::error!("Task panicked: {}", panic_message(&payload));
                            }
                        }
                        Message::Shutdown => break,
                    }
                }
            });
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                log::error!("Failed to spawn executor worker: {}", err);
                None
            }
        };

        Executor {
            sender: Mutex::new(sender),
            buffer: Mutex::new(Buffer {
                ready: false,
                pending: VecDeque::new(),
            }),
            worker: Mutex::new(worker),
        }
    }

    /// Submits a task. Before the executor is ready, tasks are buffered
    /// unless `force_queuing` is set.
    pub fn push(&self, task: Task, force_queuing: bool) {
        let mut buffer = self.buffer.lock();
        if buffer.ready || force_queuing {
            self.send(Message::Run(task));
        } else {
            buffer.pending.push_back(task);
        }
    }

    /// Marks the executor ready and releases every buffered task in
    /// submission order.
    pub fn process_buffer(&self) {
        let mut buffer = self.buffer.lock();
        buffer.ready = true;
        while let Some(task) = buffer.pending.pop_front() {
            self.send(Message::Run(task));
        }
    }

    fn send(&self, message: Message) {
        // a send failure means the worker is gone; tasks are dropped
        // rather than run on the caller's thread
        if self.sender.lock().send(message).is_err() {
            log::error!("Executor worker is no longer running, task dropped");
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.send(Message::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            // the last handle may be dropped by a task on the worker
            // itself; joining there would never return
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("Executor worker terminated abnormally");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
