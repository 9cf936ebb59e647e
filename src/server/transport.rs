//! The outbound transport seam.
//!
//! The broker only needs two primitives from the wire layer: fire-and-forget
//! publish (deliveries) and request/reply with a timeout (heartbeats,
//! duplicate-client probes). [`InMemoryTransport`] is a process-local
//! implementation used by the test suite.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("transport closed")]
    Closed,
}

pub trait Transport: Send + Sync {
    fn publish(&self, subject: &str, data: Bytes) -> Result<(), TransportError>;

    fn request(
        &self,
        subject: &str,
        data: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;
}

enum Responder {
    Reply(Bytes),
    /// Swallow the request so the caller times out, like a dead peer.
    Ignore,
}

#[derive(Default)]
struct TransportInner {
    inboxes: HashMap<String, Sender<Bytes>>,
    responders: HashMap<String, Responder>,
}

/// Crossbeam-channel backed bus for tests and embedded use.
#[derive(Default)]
pub struct InMemoryTransport {
    inner: Mutex<TransportInner>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inbox and get its receiving end. Re-registering a subject
    /// replaces the previous receiver.
    pub fn subscribe(&self, subject: &str) -> Receiver<Bytes> {
        let (tx, rx) = unbounded();
        self.lock().inboxes.insert(subject.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, subject: &str) {
        self.lock().inboxes.remove(subject);
    }

    /// Make `request(subject, ..)` succeed with the given reply.
    pub fn respond_with(&self, subject: &str, reply: Bytes) {
        self.lock()
            .responders
            .insert(subject.to_string(), Responder::Reply(reply));
    }

    /// Make `request(subject, ..)` hang until the caller's timeout, as a
    /// crashed peer would.
    pub fn drop_requests(&self, subject: &str) {
        self.lock()
            .responders
            .insert(subject.to_string(), Responder::Ignore);
    }

    pub fn remove_responder(&self, subject: &str) {
        self.lock().responders.remove(subject);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TransportInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Transport for InMemoryTransport {
    fn publish(&self, subject: &str, data: Bytes) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if let Some(tx) = inner.inboxes.get(subject) {
            if tx.send(data).is_err() {
                // Receiver dropped; forget the inbox.
                inner.inboxes.remove(subject);
            }
        }
        // No subscriber is not an error on a pub/sub bus.
        Ok(())
    }

    fn request(
        &self,
        subject: &str,
        _data: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        let reply = {
            let inner = self.lock();
            match inner.responders.get(subject) {
                Some(Responder::Reply(reply)) => Some(reply.clone()),
                Some(Responder::Ignore) | None => None,
            }
        };
        match reply {
            Some(reply) => Ok(reply),
            None => {
                std::thread::sleep(timeout);
                Err(TransportError::Timeout)
            }
        }
    }
}
