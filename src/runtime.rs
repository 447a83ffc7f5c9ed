//! Typed task queues connecting the roles a link's work is split into. Each role (e.g. a
//!  publisher link's control loop or its sending loop) owns its state exclusively and is fed
//!  through a [TaskQueue]. The role type fixes the task type, so a component holding a handle
//!  for one role cannot post work meant for another.

use std::marker::PhantomData;

use anyhow::bail;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

pub trait Role: Send + Sync + 'static {
    const NAME: &'static str;
    type Task: Send + 'static;
}

enum Envelope<T> {
    Task(T),
    Barrier(oneshot::Sender<()>),
}

pub struct TaskQueue<R: Role> {
    sender: mpsc::UnboundedSender<Envelope<R::Task>>,
    _role: PhantomData<R>,
}

impl<R: Role> Clone for TaskQueue<R> {
    fn clone(&self) -> Self {
        TaskQueue {
            sender: self.sender.clone(),
            _role: PhantomData,
        }
    }
}

impl<R: Role> TaskQueue<R> {
    /// Posts a task, returning `false` if the role's loop has terminated
    pub fn run(&self, task: R::Task) -> bool {
        if self.sender.send(Envelope::Task(task)).is_err() {
            trace!("{} task queue is closed - dropping task", R::NAME);
            return false;
        }
        true
    }

    /// Posts a task carrying a reply channel and waits for the reply
    pub async fn invoke<T>(&self, task: impl FnOnce(oneshot::Sender<T>) -> R::Task) -> anyhow::Result<T> {
        let (reply, receiver) = oneshot::channel();
        if !self.run(task(reply)) {
            bail!("{} task queue is closed", R::NAME);
        }
        Ok(receiver.await?)
    }

    /// Posts a sentinel, returning a future that completes once the role's loop has processed
    ///  every task posted before it.
    ///
    /// NB: The returned future must not be awaited from the role's own loop, which would never
    ///      get to the sentinel.
    pub fn drain(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let (done, receiver) = oneshot::channel();
        let posted = self.sender.send(Envelope::Barrier(done)).is_ok();

        async move {
            if posted {
                // a dropped sender means the loop terminated, which drains just as well
                let _ = receiver.await;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

pub struct TaskReceiver<R: Role> {
    receiver: mpsc::UnboundedReceiver<Envelope<R::Task>>,
}

impl<R: Role> TaskReceiver<R> {
    /// The next task, completing drain barriers transparently. Since a loop asks for the next
    ///  task only after it finished processing the previous one, reaching a barrier means all
    ///  tasks before it were processed.
    ///
    /// This is cancellation safe and can be used in `select!`.
    pub async fn next(&mut self) -> Option<R::Task> {
        loop {
            match self.receiver.recv().await? {
                Envelope::Task(task) => return Some(task),
                Envelope::Barrier(done) => {
                    trace!("{}: drain barrier reached", R::NAME);
                    let _ = done.send(());
                }
            }
        }
    }
}

pub fn task_queue<R: Role>() -> (TaskQueue<R>, TaskReceiver<R>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        TaskQueue { sender, _role: PhantomData },
        TaskReceiver { receiver },
    )
}
