// Task scheduler
//
// Per-service registry of named periodic/one-shot jobs. A firing task
// pushes its message template straight into the owning service's inbox;
// once enqueued it is indistinguishable from a message sent by any other
// caller. Repeating tasks re-arm with a fresh copy (cleared hop history)
// after each firing: a fixed-interval timer whose firing time drifts by
// execution latency, not a fixed-rate one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::mailbox::MailboxHandle;
use crate::message::Message;

struct TaskHandle {
    /// Gate consulted under lock right before each firing, so that
    /// `purge_task` returning guarantees no further firing.
    cancelled: Arc<Mutex<bool>>,
    join: JoinHandle<()>,
}

/// Named tasks owned by a single service. Tasks are independent of each
/// other; there is no ordering guarantee across task names.
pub struct TaskScheduler {
    owner: String,
    inbox: MailboxHandle,
    tasks: Mutex<HashMap<String, TaskHandle>>,
}

impl TaskScheduler {
    pub fn new(owner: &str, inbox: MailboxHandle) -> Self {
        Self {
            owner: owner.to_string(),
            inbox,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Arm a task to fire after `interval`. Zero means one-shot: fire
    /// immediately, once. An existing task under the same name is
    /// cancelled and replaced.
    pub fn add_task(&self, name: &str, interval: Duration, template: Message) {
        let cancelled = Arc::new(Mutex::new(false));
        let gate = Arc::clone(&cancelled);
        let inbox = self.inbox.clone();

        debug!("{}: arming task '{}' every {:?}", self.owner, name, interval);
        let join = tokio::spawn(async move {
            loop {
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                {
                    let fired = gate.lock();
                    if *fired {
                        break;
                    }
                    inbox.add(template.fresh_copy());
                }
                if interval.is_zero() {
                    break;
                }
            }
        });

        let mut tasks = self.tasks.lock();
        if let Some(previous) = tasks.insert(name.to_string(), TaskHandle { cancelled, join }) {
            warn!("{}: task '{}' already armed - replacing", self.owner, name);
            cancel(previous);
        }
    }

    /// Cancel and remove one named task. Once this returns the task will
    /// not fire again.
    pub fn purge_task(&self, name: &str) {
        match self.tasks.lock().remove(name) {
            Some(handle) => cancel(handle),
            None => warn!("purgeTask - task '{}' does not exist", name),
        }
    }

    /// Cancel and remove all tasks.
    pub fn purge_tasks(&self) {
        let drained: Vec<TaskHandle> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        for handle in drained {
            cancel(handle);
        }
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.lock().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

fn cancel(handle: TaskHandle) {
    *handle.cancelled.lock() = true;
    handle.join.abort();
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.purge_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::mailbox::Inbox;

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once() {
        let mut inbox = Inbox::new("s");
        let scheduler = TaskScheduler::new("s", inbox.handle());
        scheduler.add_task("once", Duration::ZERO, Message::new("s", "poke", ()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(inbox.try_take().is_some());
        assert!(inbox.try_take().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_task_rearms_with_cleared_history() {
        let mut inbox = Inbox::new("s");
        let scheduler = TaskScheduler::new("s", inbox.handle());
        let mut template = Message::new("s", "checkSensor", args![1]);
        template.history.push("stale-hop".to_string());
        scheduler.add_task("poll", Duration::from_millis(100), template);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let first = inbox.try_take().expect("first firing");
        let second = inbox.try_take().expect("second firing");
        assert!(first.history.is_empty());
        assert_ne!(first.msg_id, second.msg_id);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_before_firing_prevents_it() {
        let mut inbox = Inbox::new("s");
        let scheduler = TaskScheduler::new("s", inbox.handle());
        scheduler.add_task("poll", Duration::from_millis(100), Message::new("s", "tick", ()));
        scheduler.purge_task("poll");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(inbox.try_take().is_none());
        assert!(scheduler.is_empty());
    }
}
