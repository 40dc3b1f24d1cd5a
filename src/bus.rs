// ===============================
// src/bus.rs
// ===============================
//
// Fan-out ke daftar konsumen yang tetap (didaftarkan saat startup).
// Setiap sink diisolasi: Err atau panic dari satu sink di-log lalu
// dilewati, sink berikutnya tetap menerima event dan publisher tidak ikut gagal.
//
// Dua jenis sink:
// - handler sinkron  : Fn(&T) -> Result<(), SinkError>
// - channel mpsc     : try_send (tidak pernah menunggu konsumen yang lambat)
//
use std::panic::{self, AssertUnwindSafe};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, warn};

use crate::metrics::SINK_FAILURES;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("consumer channel full")]
    Full,
    #[error("consumer channel closed")]
    Closed,
    #[error("consumer failed: {0}")]
    Failed(String),
}

type Handler<T> = Box<dyn Fn(&T) -> Result<(), SinkError> + Send + Sync>;

struct Sink<T> {
    name: String,
    handler: Handler<T>,
}

pub struct Fanout<T> {
    topic: &'static str,
    sinks: RwLock<Vec<Sink<T>>>,
}

impl<T: Clone + Send + 'static> Fanout<T> {
    pub fn new(topic: &'static str) -> Self {
        Self { topic, sinks: RwLock::new(Vec::new()) }
    }

    /// Register a synchronous consumer. Must not register from inside a handler.
    pub fn subscribe_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&T) -> Result<(), SinkError> + Send + Sync + 'static,
    {
        self.sinks.write().push(Sink { name: name.into(), handler: Box::new(f) });
    }

    pub fn subscribe_channel(&self, name: impl Into<String>, tx: mpsc::Sender<T>) {
        self.subscribe_fn(name, move |item: &T| match tx.try_send(item.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::Full),
            Err(TrySendError::Closed(_)) => Err(SinkError::Closed),
        });
    }

    /// Deliver to every sink; returns how many accepted the item.
    pub fn publish(&self, item: &T) -> usize {
        let sinks = self.sinks.read();
        let mut delivered = 0;
        for sink in sinks.iter() {
            match panic::catch_unwind(AssertUnwindSafe(|| (sink.handler)(item))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(topic = self.topic, sink = %sink.name, error = %e, "sink rejected event");
                    SINK_FAILURES.with_label_values(&[self.topic, &sink.name]).inc();
                }
                Err(_) => {
                    error!(topic = self.topic, sink = %sink.name, "sink panicked, skipped");
                    SINK_FAILURES.with_label_values(&[self.topic, &sink.name]).inc();
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize { self.sinks.read().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
