//! Bounded scheduler for metadata queries.
//!
//! A single control loop owns the in-flight count. It admits queued requests
//! while below the limit, and otherwise only listens for completions and the
//! close signal. Each admitted query runs in its own task and reports
//! completion back to the loop before its callback fires.

use crate::config::Options;
use crate::error::{MetadataError, TimeoutKind};
use crate::metadata::Metadata;
use crate::query::{OnError, OnSuccess, Query};
use crate::request::Request;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::timeout;

struct Handlers {
    on_success: OnSuccess,
    on_error: OnError,
}

pub struct Collector {
    options: Options,
    requests: mpsc::Sender<Query>,
    close_tx: watch::Sender<bool>,
    closed: AtomicBool,
    in_flight: watch::Receiver<usize>,
    handlers: RwLock<Handlers>,
}

impl Collector {
    /// Starts the control loop on the current tokio runtime.
    pub fn new(options: Options) -> Self {
        let options = options.normalized();
        let (requests_tx, requests_rx) = mpsc::channel(options.queue_capacity);
        let (completed_tx, completed_rx) = mpsc::channel(options.max_in_flight);
        let (close_tx, close_rx) = watch::channel(false);
        let (in_flight_tx, in_flight_rx) = watch::channel(0usize);

        let control = ControlLoop {
            requests: requests_rx,
            completed_rx,
            completed_tx,
            close_rx,
            in_flight_tx,
            max_in_flight: options.max_in_flight,
            in_flight: 0,
        };
        tokio::spawn(control.run());

        tracing::debug!(
            max_in_flight = options.max_in_flight,
            queue_capacity = options.queue_capacity,
            "collector: started"
        );

        Self {
            options,
            requests: requests_tx,
            close_tx,
            closed: AtomicBool::new(false),
            in_flight: in_flight_rx,
            handlers: RwLock::new(Handlers {
                on_success: default_on_success(),
                on_error: default_on_error(),
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Queues a request and returns immediately. The outcome is delivered to
    /// the collector-wide handlers.
    pub fn get(&self, request: Request) -> Result<(), MetadataError> {
        if self.is_closed() {
            return Err(MetadataError::Closed);
        }
        let (query, _done) = self.query(request, None, None);
        match self.requests.try_send(query) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(MetadataError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(MetadataError::Closed),
        }
    }

    /// Queues a request and waits until it has reached a terminal state and
    /// its callback has run. `None` callbacks fall back to the collector-wide
    /// handlers. Waiting for queue space is bounded by the enqueue timeout.
    pub async fn get_sync(
        &self,
        request: Request,
        on_success: Option<OnSuccess>,
        on_error: Option<OnError>,
    ) -> Result<(), MetadataError> {
        if self.is_closed() {
            return Err(MetadataError::Closed);
        }
        let (query, done) = self.query(request, on_success, on_error);
        match timeout(self.options.enqueue_timeout, self.requests.send(query)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(MetadataError::Closed),
            Err(_) => return Err(MetadataError::Timeout(TimeoutKind::Enqueue)),
        }
        done.await.map_err(|_| MetadataError::Closed)
    }

    /// Replaces the default success handler.
    pub fn on_finish<F>(&self, handler: F)
    where
        F: Fn(&Request, &Metadata) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .on_success = Arc::new(handler);
    }

    /// Replaces the default error handler.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Request, &MetadataError) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .on_error = Arc::new(handler);
    }

    /// Stops admitting work. Running queries finish on their own; queued ones
    /// are failed with [`MetadataError::Closed`]. Later calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close_tx.send(true);
        tracing::debug!("collector: closing");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queries currently running, as last published by the control loop.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    fn query(
        &self,
        request: Request,
        on_success: Option<OnSuccess>,
        on_error: Option<OnError>,
    ) -> (Query, tokio::sync::oneshot::Receiver<()>) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let on_success = on_success.unwrap_or_else(|| handlers.on_success.clone());
        let on_error = on_error.unwrap_or_else(|| handlers.on_error.clone());
        Query::new(request, &self.options, on_success, on_error)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.close();
    }
}

fn default_on_success() -> OnSuccess {
    Arc::new(|req: &Request, meta: &Metadata| {
        tracing::info!(magnet = %req.magnet_link(), name = %meta.name(), "collector: metadata");
    })
}

fn default_on_error() -> OnError {
    Arc::new(|req: &Request, err: &MetadataError| {
        tracing::debug!(hash = %req.hash_info, peer = %req.remote_addr(), %err, "collector: query failed");
    })
}

struct ControlLoop {
    requests: mpsc::Receiver<Query>,
    completed_rx: mpsc::Receiver<()>,
    completed_tx: mpsc::Sender<()>,
    close_rx: watch::Receiver<bool>,
    in_flight_tx: watch::Sender<usize>,
    max_in_flight: usize,
    in_flight: usize,
}

impl ControlLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                // Also fires when the collector is dropped.
                _ = self.close_rx.changed() => break,
                Some(()) = self.completed_rx.recv() => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    self.publish();
                }
                next = self.requests.recv(), if self.in_flight < self.max_in_flight => {
                    let Some(query) = next else { break };
                    self.in_flight += 1;
                    self.publish();
                    tracing::trace!(hash = %query.request().hash_info, in_flight = self.in_flight, "collector: admitted");
                    tokio::spawn(query.run(self.completed_tx.clone()));
                }
            }
        }

        // Nothing queued will start now; give each one its error callback.
        self.requests.close();
        let mut dropped = 0usize;
        while let Ok(query) = self.requests.try_recv() {
            query.fail(MetadataError::Closed);
            dropped += 1;
        }
        tracing::debug!(in_flight = self.in_flight, dropped, "collector: stopped");
    }

    fn publish(&self) {
        self.in_flight_tx.send_replace(self.in_flight);
    }
}
