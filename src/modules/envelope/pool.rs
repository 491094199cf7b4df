// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::envelope::Envelope;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::raise_error;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded free-list of reusable envelopes. A semaphore caps the number
/// of envelopes out on loan; returned envelopes are reset and kept for
/// the next borrower.
pub struct EnvelopePool {
    free: Arc<Mutex<Vec<Envelope>>>,
    permits: Arc<Semaphore>,
}

/// A borrowed envelope. Dropping the lease returns the (reset)
/// allocation to the pool and releases the permit.
pub struct EnvelopeLease {
    envelope: Option<Envelope>,
    free: Arc<Mutex<Vec<Envelope>>>,
    _permit: OwnedSemaphorePermit,
}

impl EnvelopePool {
    pub fn new(capacity: usize) -> Self {
        EnvelopePool {
            free: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Borrow an envelope, waiting if the pool is fully loaned out.
    pub async fn borrow(&self) -> MailVaultResult<EnvelopeLease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
        let envelope = self.free.lock().unwrap().pop().unwrap_or_default();
        Ok(EnvelopeLease {
            envelope: Some(envelope),
            free: Arc::clone(&self.free),
            _permit: permit,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl EnvelopeLease {
    pub fn envelope(&self) -> &Envelope {
        self.envelope.as_ref().unwrap()
    }

    pub fn envelope_mut(&mut self) -> &mut Envelope {
        self.envelope.as_mut().unwrap()
    }
}

impl Drop for EnvelopeLease {
    fn drop(&mut self) {
        if let Some(mut envelope) = self.envelope.take() {
            envelope.reset();
            self.free.lock().unwrap().push(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn borrow_and_return() {
        let pool = EnvelopePool::new(2);
        {
            let mut lease = pool.borrow().await.unwrap();
            lease.envelope_mut().helo = "mail.example".into();
            assert_eq!(pool.available(), 1);
        }
        assert_eq!(pool.available(), 2);
        // the returned envelope comes back reset
        let lease = pool.borrow().await.unwrap();
        assert!(lease.envelope().helo.is_empty());
    }

    #[tokio::test]
    async fn pool_is_bounded() {
        let pool = Arc::new(EnvelopePool::new(1));
        let first = pool.borrow().await.unwrap();
        assert_eq!(pool.available(), 0);
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.borrow().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(first);
        waiter.await.unwrap().unwrap();
    }
}
