/// Idempotency guard around the anchoring pipeline.
///
/// Acquisition is a single conditional write on the record store; whichever
/// invocation wins it runs the pipeline, every other one skips. The lease
/// carries an owner token and an expiry so a crashed holder does not wedge
/// the record: a later acquire reclaims an expired lease, and [`reconcile`]
/// sweeps the ones nobody came back for.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AnchorError, Result};
use crate::state::models::{AcquireIntent, Lease, PendingReport};
use crate::state::ReportStore;

/// Default lease lifetime.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);

/// A lease held on one record.
#[derive(Debug, Clone)]
pub struct HeldLease {
    pub report_id: String,
    pub owner: Uuid,
    /// The record as written by the acquire.
    pub report: PendingReport,
}

pub struct IdempotencyGuard {
    store: Arc<dyn ReportStore>,
    ttl: chrono::Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn ReportStore>, ttl: Duration) -> Result<Self> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| AnchorError::InvalidConfig(format!("lease TTL out of range: {e}")))?;
        Ok(Self { store, ttl })
    }

    /// Take the lease for `id`, or `None` if the record does not admit `intent`.
    pub async fn acquire(&self, id: &str, intent: AcquireIntent) -> Result<Option<HeldLease>> {
        let now = Utc::now();
        let lease = Lease {
            owner: Uuid::new_v4(),
            expires_at: now + self.ttl,
        };

        let acquired = self.store.try_acquire(id, &lease, intent, now).await?;
        Ok(acquired.map(|report| {
            info!(report_id = %id, owner = %lease.owner, "Lease acquired");
            HeldLease {
                report_id: id.to_string(),
                owner: lease.owner,
                report,
            }
        }))
    }

    /// Extend a held lease by a full TTL from now.
    ///
    /// Fails with [`AnchorError::LeaseLost`] when the lease already expired or
    /// another invocation took it over; the caller must stop writing.
    pub async fn renew(&self, held: &HeldLease) -> Result<()> {
        let now = Utc::now();
        let renewed = self
            .store
            .renew_lease(&held.report_id, held.owner, now + self.ttl, now)
            .await?;
        if !renewed {
            warn!(report_id = %held.report_id, owner = %held.owner, "Lease lost");
            return Err(AnchorError::LeaseLost(held.report_id.clone()));
        }
        debug!(report_id = %held.report_id, owner = %held.owner, "Lease renewed");
        Ok(())
    }

    /// Release a held lease. A failed release is logged; the lease then
    /// expires on its own.
    pub async fn release(&self, held: &HeldLease) {
        match self.store.release(&held.report_id, held.owner).await {
            Ok(()) => info!(report_id = %held.report_id, owner = %held.owner, "Lease released"),
            Err(e) => warn!(
                report_id = %held.report_id,
                owner = %held.owner,
                error = %e,
                "Lease release failed, leaving it to expire"
            ),
        }
    }
}

/// Clear every expired lease that is still flagged in progress.
/// Returns the ids that were cleared.
pub async fn reconcile(store: &dyn ReportStore) -> Result<Vec<String>> {
    let now = Utc::now();
    let mut cleared = Vec::new();

    for id in store.expired_leases(now).await? {
        if store.clear_expired_lease(&id, now).await? {
            warn!(report_id = %id, "Cleared expired lease");
            cleared.push(id);
        }
    }

    info!(cleared = cleared.len(), "Reconciliation sweep complete");
    Ok(cleared)
}
