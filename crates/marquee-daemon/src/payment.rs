//! Payment capability surface.
//!
//! The wallet and its on-chain interactions are external collaborators; the
//! core only sees pool-allocated receiving accounts and a payout sink. The
//! in-memory implementations back tests and standalone runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use marquee_core::amount::Amount;
use marquee_core::event::Event;
use tracing::info;

/// Errors from the payment subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("payment subsystem unavailable: {0}")]
    Unavailable(String),
}

/// An incoming payment on a watched account.
#[derive(Debug, Clone)]
pub struct PaymentReceived {
    pub amount: Amount,
    pub sender: String,
}

/// A pool-allocated account watched for incoming payments.
pub struct PaymentReceiver {
    address: String,
    payment_received: Event<PaymentReceived>,
}

impl PaymentReceiver {
    pub fn new(address: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            payment_received: Event::new(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn payment_received(&self) -> &Event<PaymentReceived> {
        &self.payment_received
    }
}

/// Allocates receiving accounts from the wallet's account pool.
#[async_trait]
pub trait PaymentAccountPool: Send + Sync {
    async fn receive_payment(&self) -> Result<Arc<PaymentReceiver>, PaymentError>;
}

/// Sink for outgoing payouts (reward distribution, refunds).
#[async_trait]
pub trait RewardsBackend: Send + Sync {
    /// Enqueue a payout; returns an opaque transaction reference.
    async fn send(&self, destination: &str, amount: Amount) -> Result<String, PaymentError>;
}

/// In-memory pool; payments are injected with [`InMemoryPaymentPool::simulate_payment`].
#[derive(Default)]
pub struct InMemoryPaymentPool {
    next_account: AtomicU64,
    receivers: Mutex<HashMap<String, Arc<PaymentReceiver>>>,
}

impl InMemoryPaymentPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver a payment to a previously allocated account. Returns `false`
    /// when the account is unknown.
    pub fn simulate_payment(&self, address: &str, amount: Amount, sender: &str) -> bool {
        let receiver = self
            .receivers
            .lock()
            .expect("payment pool poisoned")
            .get(address)
            .cloned();
        match receiver {
            Some(receiver) => {
                receiver.payment_received().notify(PaymentReceived {
                    amount,
                    sender: sender.to_string(),
                });
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PaymentAccountPool for InMemoryPaymentPool {
    async fn receive_payment(&self) -> Result<Arc<PaymentReceiver>, PaymentError> {
        let index = self.next_account.fetch_add(1, Ordering::Relaxed);
        let body = format!("{index:060}");
        let receiver = PaymentReceiver::new(format!("ban_{body}"));
        self.receivers
            .lock()
            .expect("payment pool poisoned")
            .insert(receiver.address().to_string(), Arc::clone(&receiver));
        Ok(receiver)
    }
}

/// Records payouts instead of performing them; the standalone default and
/// the test double.
#[derive(Default)]
pub struct RecordingRewardsBackend {
    sends: Mutex<Vec<(String, Amount)>>,
    next_reference: AtomicU64,
}

impl RecordingRewardsBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sends(&self) -> Vec<(String, Amount)> {
        self.sends.lock().expect("rewards backend poisoned").clone()
    }

    pub fn total_sent_to(&self, destination: &str) -> Amount {
        self.sends
            .lock()
            .expect("rewards backend poisoned")
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, a)| *a)
            .sum()
    }
}

#[async_trait]
impl RewardsBackend for RecordingRewardsBackend {
    async fn send(&self, destination: &str, amount: Amount) -> Result<String, PaymentError> {
        info!(destination, amount = %amount, "Payout enqueued");
        self.sends
            .lock()
            .expect("rewards backend poisoned")
            .push((destination.to_string(), amount));
        let reference = self.next_reference.fetch_add(1, Ordering::Relaxed);
        Ok(format!("payout-{reference}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marquee_core::event::BufferingGuarantee;

    #[tokio::test]
    async fn pool_allocates_distinct_accounts() {
        let pool = InMemoryPaymentPool::new();
        let a = pool.receive_payment().await.unwrap();
        let b = pool.receive_payment().await.unwrap();
        assert_ne!(a.address(), b.address());
    }

    #[tokio::test]
    async fn simulated_payments_reach_the_receiver() {
        let pool = InMemoryPaymentPool::new();
        let receiver = pool.receive_payment().await.unwrap();
        let mut payments = receiver
            .payment_received()
            .subscribe(BufferingGuarantee::BufferAll);

        assert!(pool.simulate_payment(receiver.address(), Amount::from_raw(5), "ban_x"));
        let payment = payments.recv().await.unwrap();
        assert_eq!(payment.amount, Amount::from_raw(5));

        assert!(!pool.simulate_payment("ban_unknown", Amount::from_raw(5), "ban_x"));
    }
}
