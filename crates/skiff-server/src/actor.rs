use async_trait::async_trait;
use log::{error, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const ACTOR_CHANNEL_SIZE: usize = 8;

/// A unit of state driven by a single task that receives messages
/// from a mailbox. All state mutation happens inside `receive`, so
/// no further synchronization is needed for the actor's fields.
#[async_trait]
pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;
    type Options;

    fn new(options: Self::Options) -> Self;
    async fn start(&mut self, ctx: &mut ActorContext<Self>);
    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: Self::Message) -> ActorAction;
    async fn stop(self, ctx: &mut ActorContext<Self>);
}

pub enum ActorAction {
    Continue,
    /// Log a warning and continue processing messages.
    Warn(String),
    /// Log an error and stop the actor.
    Fail(String),
    Stop,
}

impl ActorAction {
    pub fn warn(message: impl ToString) -> Self {
        Self::Warn(message.to_string())
    }

    pub fn fail(message: impl ToString) -> Self {
        Self::Fail(message.to_string())
    }
}

pub struct ActorHandle<T>
where
    T: Actor,
{
    sender: mpsc::Sender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T> Clone for ActorHandle<T>
where
    T: Actor,
{
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    pub async fn send(&self, message: T::Message) -> Result<(), mpsc::error::SendError<T::Message>> {
        self.sender.send(message).await
    }

    pub async fn wait_for_stop(mut self) {
        // The receiver error means the sender has been dropped,
        // which implies the actor has stopped.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}

pub struct ActorContext<T>
where
    T: Actor,
{
    handle: ActorHandle<T>,
}

impl<T: Actor> ActorContext<T> {
    pub fn handle(&self) -> &ActorHandle<T> {
        &self.handle
    }

    pub fn spawn<F>(&mut self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(future)
    }

    /// Sends a message to the actor's own mailbox without blocking the
    /// message loop. The send happens on a separate task since the mailbox
    /// may be full while the actor is inside `receive`.
    pub fn send(&mut self, message: T::Message) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let _ = handle.send(message).await;
        });
    }
}

pub struct ActorSystem {
    tasks: Vec<JoinHandle<()>>,
}

impl Default for ActorSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorSystem {
    pub fn new() -> Self {
        Self { tasks: vec![] }
    }

    pub fn spawn<T: Actor>(&mut self, options: T::Options) -> ActorHandle<T> {
        let (tx, mut rx) = mpsc::channel(ACTOR_CHANNEL_SIZE);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let mut actor = T::new(options);
        let handle = ActorHandle {
            sender: tx,
            stopped: stopped_rx,
        };
        let mut ctx = ActorContext {
            handle: handle.clone(),
        };
        let task = tokio::spawn(async move {
            actor.start(&mut ctx).await;
            while let Some(message) = rx.recv().await {
                match actor.receive(&mut ctx, message) {
                    ActorAction::Continue => {}
                    ActorAction::Warn(message) => {
                        warn!("{message}");
                    }
                    ActorAction::Fail(message) => {
                        error!("{message}");
                        break;
                    }
                    ActorAction::Stop => break,
                }
            }
            actor.stop(&mut ctx).await;
            let _ = stopped_tx.send(true);
        });
        self.tasks.push(task);
        handle
    }

    /// Waits for all actors spawned in this system to stop.
    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
