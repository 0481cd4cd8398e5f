//! Time-windowed batching of triggered events
//!
//! The first event after a quiet period opens a window; everything added before
//! the window expires is handed to the [`BatchHandler`] as one [`EventBatch`].
//! A zero window disables coalescing and dispatches every event on its own.

use crate::error::StoreError;
use crate::events::{EventBatch, TriggeredEvent};
use log::{debug, error};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

/// Receiver of flushed batches
///
/// Only persistence failures are returned; they are fatal for the pipeline and
/// surface from the next `add` or `flush` call.
pub trait BatchHandler: Send + 'static {
    fn handle_batch<'a>(
        &'a mut self,
        batch: EventBatch,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;
}

#[derive(Default)]
struct PendingState {
    events: Vec<TriggeredEvent>,
    timer_active: bool,
    failure: Option<StoreError>,
}

struct WindowTimer {
    handle: JoinHandle<()>,
    cancel: Arc<Notify>,
}

/// Groups temporally correlated events into batches
///
/// The handler sits behind an async mutex, so callbacks never overlap even
/// though the window timer runs as its own task.
pub struct EventBatcher<H: BatchHandler> {
    window: Duration,
    handler: Arc<AsyncMutex<H>>,
    state: Arc<Mutex<PendingState>>,
    timer: Option<WindowTimer>,
}

fn lock(state: &Mutex<PendingState>) -> MutexGuard<'_, PendingState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn dispatch<H: BatchHandler>(
    handler: &AsyncMutex<H>,
    events: Vec<TriggeredEvent>,
) -> Result<(), StoreError> {
    debug!("Flushing batch of {} event(s)", events.len());
    let mut guard = handler.lock().await;
    guard.handle_batch(EventBatch::new(events)).await
}

async fn run_window<H: BatchHandler>(
    window: Duration,
    state: Arc<Mutex<PendingState>>,
    handler: Arc<AsyncMutex<H>>,
    cancel: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(window) => {}
            _ = cancel.notified() => return,
        }

        let events = {
            let mut guard = lock(&state);
            if guard.events.is_empty() {
                guard.timer_active = false;
                return;
            }
            std::mem::take(&mut guard.events)
        };

        if let Err(e) = dispatch(&handler, events).await {
            error!("Batch handler failed: {}", e);
            let mut guard = lock(&state);
            guard.failure = Some(e);
            guard.timer_active = false;
            return;
        }

        // Events that arrived during the callback open the next window
        let idle = {
            let mut guard = lock(&state);
            if guard.events.is_empty() {
                guard.timer_active = false;
                true
            } else {
                false
            }
        };
        if idle {
            return;
        }
    }
}

impl<H: BatchHandler> EventBatcher<H> {
    /// Create a batcher with the given quiet window
    pub fn new(window: Duration, handler: H) -> Self {
        Self {
            window,
            handler: Arc::new(AsyncMutex::new(handler)),
            state: Arc::new(Mutex::new(PendingState::default())),
            timer: None,
        }
    }

    /// Number of events waiting for the window to close
    pub fn pending_len(&self) -> usize {
        lock(&self.state).events.len()
    }

    /// Enqueue a triggered event
    ///
    /// With a zero window the event is dispatched before this returns.
    ///
    /// # Errors
    ///
    /// Returns the persistence failure of an earlier background flush, if any.
    pub async fn add(&mut self, event: TriggeredEvent) -> Result<(), StoreError> {
        self.take_failure()?;

        if self.window.is_zero() {
            return dispatch(&self.handler, vec![event]).await;
        }

        let start_timer = {
            let mut state = lock(&self.state);
            state.events.push(event);
            if state.timer_active {
                false
            } else {
                state.timer_active = true;
                true
            }
        };

        if start_timer {
            self.spawn_timer();
        }
        Ok(())
    }

    /// Dispatch pending events now and wait for any in-flight callback
    ///
    /// # Errors
    ///
    /// Returns the first persistence failure from this or an earlier flush.
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        if let Some(timer) = self.timer.take() {
            timer.cancel.notify_one();
            if let Err(e) = timer.handle.await {
                error!("Batch window task ended abnormally: {}", e);
            }
        }

        let events = {
            let mut state = lock(&self.state);
            state.timer_active = false;
            std::mem::take(&mut state.events)
        };

        self.take_failure()?;

        if !events.is_empty() {
            dispatch(&self.handler, events).await?;
        }
        Ok(())
    }

    fn spawn_timer(&mut self) {
        let cancel = Arc::new(Notify::new());
        let handle = tokio::spawn(run_window(
            self.window,
            Arc::clone(&self.state),
            Arc::clone(&self.handler),
            Arc::clone(&cancel),
        ));
        self.timer = Some(WindowTimer { handle, cancel });
    }

    fn take_failure(&self) -> Result<(), StoreError> {
        match lock(&self.state).failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<H: BatchHandler> Drop for EventBatcher<H> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}
