//! Dispatch worker task
//!
//! Owns a [`Dispatcher`] and its transport on a dedicated task behind a
//! bounded channel, so the host loop enqueues without ever waiting on the
//! network. A periodic tick drives the time-based flush trigger; shutdown
//! flushes whatever is still queued. In-flight retries always run to
//! completion; there is no hard cancellation.

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

use super::{Command, Dispatcher, Transport};

/// Bound of the handle-to-worker channel. Commands beyond this are dropped
/// with a warning rather than blocking the host.
const CHANNEL_CAPACITY: usize = 1024;

enum WorkerMsg {
    Enqueue(Command),
    Flush(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

/// Cheap, clonable handle to the dispatch worker.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<WorkerMsg>,
}

impl DispatchHandle {
    /// Hand a command to the worker without blocking.
    ///
    /// A full channel drops the command with a warning (best-effort,
    /// at-most-once); a closed channel means the worker already shut down
    /// and the command is dropped silently at debug level.
    pub fn try_enqueue(&self, command: Command) {
        match self.tx.try_send(WorkerMsg::Enqueue(command)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("dispatch channel full, dropping command");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("dispatch worker gone, dropping command");
            }
        }
    }

    /// Flush the queue now and wait for the attempt to finish.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelClosed`] when the worker has shut down;
    /// [`Error::ExperimentStopped`] propagated from the flush.
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WorkerMsg::Flush(ack))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        done.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Flush the residue and stop the worker.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelClosed`] when the worker is already gone;
    /// [`Error::ExperimentStopped`] propagated from the final flush.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WorkerMsg::Shutdown(ack))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        done.await.map_err(|_| Error::ChannelClosed)?
    }
}

/// Spawn the worker task servicing `dispatcher` over `transport`.
///
/// Returns the host-facing handle and the task's join handle.
#[must_use]
pub fn spawn_dispatcher<T: Transport + 'static>(
    mut dispatcher: Dispatcher,
    transport: T,
) -> (DispatchHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let interval = dispatcher.flush_interval();

    let task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut keep_alive = tokio::time::interval(dispatcher.keep_alive_interval());
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(WorkerMsg::Enqueue(command)) => {
                        dispatcher.enqueue(command);
                        if dispatcher.should_flush(Instant::now()) {
                            log_stop(dispatcher.flush(&transport).await);
                        }
                    }
                    Some(WorkerMsg::Flush(ack)) => {
                        dispatcher.request_flush();
                        let result = dispatcher.flush(&transport).await;
                        let _ = ack.send(result);
                    }
                    Some(WorkerMsg::Shutdown(ack)) => {
                        let result = dispatcher.flush(&transport).await;
                        let _ = ack.send(result);
                        break;
                    }
                    None => {
                        // All handles dropped: flush the residue and exit.
                        log_stop(dispatcher.flush(&transport).await);
                        break;
                    }
                },
                _ = tick.tick() => {
                    if dispatcher.should_flush(Instant::now()) {
                        log_stop(dispatcher.flush(&transport).await);
                    }
                }
                _ = keep_alive.tick() => {
                    if dispatcher.keep_alive_due(Instant::now()) {
                        log_stop(dispatcher.keep_alive(&transport).await);
                    }
                }
            }
        }
    });

    (DispatchHandle { tx }, task)
}

/// A stop raised by a background flush has no caller to return to; the
/// registered stop callback is the signal path, this only records it.
fn log_stop(result: Result<()>) {
    if let Err(Error::ExperimentStopped) = result {
        tracing::debug!("stop signal observed by background flush");
    }
}
