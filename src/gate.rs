//! Credit and rate-limit admission in one step.
//!
//! [`AdmissionGate::admit`] takes the request's credits first and then
//! consults the rate limiter. When the limiter rejects, the credits go back
//! before the call returns, so a request never keeps a debit it did not get
//! to spend and never gets a refund twice.

use std::sync::Arc;

use tracing::debug;

use crate::Result;
use crate::credits::{CreditReservation, SharedCreditLedger};
use crate::limiter::FixedWindowRateLimiter;

/// Result of [`AdmissionGate::admit`].
#[derive(Debug)]
pub enum Admission {
    /// Admitted. Commit the reservation once the work is done, or refund it
    /// if the work fails.
    Admitted(CreditReservation),
    /// Today's credit pool cannot cover the cost.
    QuotaExhausted,
    /// The subject exceeded its attempts for the current window. No credits
    /// were kept.
    RateLimited,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Composes the shared credit ledger with a per-subject rate limiter.
#[derive(Clone)]
pub struct AdmissionGate {
    ledger: Arc<SharedCreditLedger>,
    limiter: Arc<FixedWindowRateLimiter>,
}

impl AdmissionGate {
    pub fn new(ledger: Arc<SharedCreditLedger>, limiter: Arc<FixedWindowRateLimiter>) -> Self {
        Self { ledger, limiter }
    }

    pub fn ledger(&self) -> &SharedCreditLedger {
        &self.ledger
    }

    pub fn limiter(&self) -> &FixedWindowRateLimiter {
        &self.limiter
    }

    /// Admit a request from `subject` costing `cost` credits.
    ///
    /// Store failures are returned as `Err`; if the refund after a
    /// rate-limit rejection fails, that error is returned too.
    pub async fn admit(&self, subject: &str, cost: u32) -> Result<Admission> {
        let Some(reservation) = self.ledger.reserve(cost).await? else {
            debug!(subject, cost, "admission refused, quota exhausted");
            return Ok(Admission::QuotaExhausted);
        };
        if !self.limiter.attempt(subject) {
            let balance = reservation.refund().await?;
            debug!(subject, cost, balance, "admission refused, rate limited");
            return Ok(Admission::RateLimited);
        }
        Ok(Admission::Admitted(reservation))
    }
}
