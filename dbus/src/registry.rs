//! Correlation of outstanding calls with their replies.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::wire::Message;
use crate::{Error, Result};

/// Lock a mutex, ignoring poisoning.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot completion for a pending call.
pub(crate) type ReplyHandler = Box<dyn FnOnce(Result<Message>) + Send>;

struct Inner {
    pending: HashMap<u32, ReplyHandler>,
    next_serial: u32,
    closed: bool,
}

/// Maps the serial of every outstanding call to its completion.
///
/// Serials are allocated here so that a serial is never handed out while a
/// call using it is still pending. Handlers always run outside the lock.
pub(crate) struct ReplyRegistry {
    inner: Mutex<Inner>,
}

impl ReplyRegistry {
    pub(crate) fn new() -> Self {
        ReplyRegistry {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                next_serial: 1,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    fn allocate(inner: &mut Inner) -> u32 {
        loop {
            let serial = inner.next_serial;
            inner.next_serial = inner.next_serial.wrapping_add(1);
            if serial != 0 && !inner.pending.contains_key(&serial) {
                return serial;
            }
        }
    }

    /// A fresh serial for a message that expects no reply.
    pub(crate) fn next_serial(&self) -> Result<u32> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(Self::allocate(&mut inner))
    }

    /// Allocate a serial and register `handler` under it.
    pub(crate) fn register(&self, handler: ReplyHandler) -> Result<u32> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::ConnectionClosed);
        }
        let serial = Self::allocate(&mut inner);
        inner.pending.insert(serial, handler);
        trace!("Registered serial {}", serial);
        Ok(serial)
    }

    /// Complete the call registered under `serial`.
    ///
    /// Returns false if no call is pending under that serial, in which case
    /// `result` is dropped.
    pub(crate) fn complete(&self, serial: u32, result: Result<Message>) -> bool {
        let handler = self.lock().pending.remove(&serial);
        match handler {
            Some(handler) => {
                handler(result);
                true
            }
            None => false,
        }
    }

    /// Forget the call registered under `serial` without completing it.
    pub(crate) fn cancel(&self, serial: u32) -> bool {
        self.lock().pending.remove(&serial).is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, serial: u32) -> bool {
        self.lock().pending.contains_key(&serial)
    }

    /// Refuse new registrations and fail every pending call.
    pub(crate) fn close(&self, error: impl Fn() -> Error) {
        let pending: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.pending.drain().collect()
        };
        trace!("Failing {} pending calls", pending.len());
        for (_, handler) in pending {
            handler(Err(error()));
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().pending.len()
    }
}
