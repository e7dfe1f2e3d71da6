//! Credit flow control
//!
//! Each request spends credits when it is sent; every response hands back
//! whatever the server granted. Senders wait on a semaphore, so no message
//! leaves with more credits charged than the window currently holds.

use crate::error::{Error, Result};
use crate::protocol::smb2_constants::CREDIT_UNIT;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// Credits the client holds for one connection.
#[derive(Debug)]
pub struct CreditWindow {
    available: Semaphore,
}

impl CreditWindow {
    /// Before negotiation the client may send exactly one request.
    pub const INITIAL: usize = 1;

    pub fn new(initial: usize) -> Self {
        Self {
            available: Semaphore::new(initial),
        }
    }

    /// Credit charge of a request moving `payload_size` bytes.
    ///
    /// Without multi-credit support every request costs one credit and
    /// payloads are capped at one credit unit by the caller.
    pub fn charge_for(payload_size: usize, multi_credit: bool) -> u16 {
        if !multi_credit || payload_size == 0 {
            return 1;
        }
        let charge = 1 + (payload_size - 1) / CREDIT_UNIT;
        u16::try_from(charge).unwrap_or(u16::MAX)
    }

    /// Spend `charge` credits, waiting up to `timeout` for the server to
    /// grant enough.
    pub async fn acquire(&self, charge: u16, timeout: Duration) -> Result<()> {
        let permits = u32::from(charge.max(1));
        match tokio::time::timeout(timeout, self.available.acquire_many(permits)).await {
            Ok(Ok(permit)) => {
                permit.forget();
                trace!("Spent {} credit(s), {} left", permits, self.available());
                Ok(())
            }
            Ok(Err(_)) => Err(Error::ConnectionLost(
                "connection failed while waiting for credits".into(),
            )),
            Err(_) => {
                debug!(
                    "Credit wait timed out: need {}, have {}",
                    permits,
                    self.available()
                );
                Err(Error::CreditTimeout { needed: charge })
            }
        }
    }

    /// Return credits spent on a request that never reached the wire.
    pub fn refund(&self, charge: u16) {
        self.grant(charge.max(1));
    }

    /// Add credits granted by a response.
    pub fn grant(&self, credits: u16) {
        if credits > 0 && !self.available.is_closed() {
            self.available.add_permits(usize::from(credits));
        }
    }

    /// Credits to ask for in a request header: enough to refill toward
    /// `desired`, and never zero.
    pub fn request_amount(&self, desired: u16) -> u16 {
        let available = u16::try_from(self.available()).unwrap_or(u16::MAX);
        desired.saturating_sub(available).max(1)
    }

    pub fn available(&self) -> usize {
        self.available.available_permits()
    }

    /// Wake every waiter with a connection failure.
    pub fn close(&self) {
        self.available.close();
    }

    pub fn is_closed(&self) -> bool {
        self.available.is_closed()
    }
}
