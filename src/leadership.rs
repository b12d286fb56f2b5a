use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use sqlx::PgPool;
use tokio::time;

use crate::audit::{self, AuditOutcome, NewAuditEvent};
use crate::config::{self, GovernanceSettings};
use crate::{approvals, jobs};

/// Advisory lock key shared by every replica for schema changes.
const MIGRATION_LOCK_KEY: i64 = 0x6f76_6572_6e61;

const SWEEP_INTERVAL_SECS: u64 = 60;
const RETENTION_INTERVAL_SECS: u64 = 3600;

/// Serializes schema migrations across replicas via a Postgres advisory
/// lock. A locker without a store degrades to running the closure directly.
pub struct MigrationLocker {
    pool: Option<PgPool>,
}

impl MigrationLocker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Some(pool) }
    }

    pub fn noop() -> Self {
        Self { pool: None }
    }

    pub async fn with_lock<F, Fut, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let Some(pool) = self.pool.as_ref() else {
            return f().await;
        };
        let mut conn = pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;
        let result = f().await;
        if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
        {
            tracing::warn!(?err, "failed to release migration lock");
        }
        result
    }
}

type LeaderCallback = Box<dyn Fn() + Send + Sync>;

/// Tracks leadership and fires registered callbacks on transitions. Election
/// against an external coordinator is out of scope; single-replica
/// deployments start leading immediately.
#[derive(Default)]
pub struct LeaderElector {
    leading: AtomicBool,
    on_start: Mutex<Vec<LeaderCallback>>,
    on_stop: Mutex<Vec<LeaderCallback>>,
}

impl LeaderElector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    pub fn on_start_leading(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.on_start.lock().unwrap().push(Box::new(callback));
    }

    pub fn on_stop_leading(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.on_stop.lock().unwrap().push(Box::new(callback));
    }

    pub fn start_leading(&self) {
        if !self.leading.swap(true, Ordering::SeqCst) {
            for callback in self.on_start.lock().unwrap().iter() {
                callback();
            }
        }
    }

    pub fn stop_leading(&self) {
        if self.leading.swap(false, Ordering::SeqCst) {
            for callback in self.on_stop.lock().unwrap().iter() {
                callback();
            }
        }
    }
}

/// Leader-only background sweeps: approval expiry, stuck-job recovery, and
/// audit retention.
pub fn spawn_sweepers(pool: PgPool, settings: Arc<GovernanceSettings>, leader: Arc<LeaderElector>) {
    let expiry_pool = pool.clone();
    let expiry_leader = leader.clone();
    tokio::spawn(async move {
        let mut ticker = time::interval(StdDuration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if !expiry_leader.is_leader() {
                continue;
            }
            match approvals::store::expire_due(&expiry_pool, Utc::now()).await {
                Ok(expired) => {
                    for request in expired {
                        tracing::info!(request_id = %request.id, "approval request expired");
                        let mut event = NewAuditEvent::new(
                            &request.namespace,
                            audit::EVENT_APPROVAL_EXPIRED,
                            "system",
                            AuditOutcome::Canceled,
                        );
                        event.correlation_id = Some(request.id.to_string());
                        event.asset_uid = Some(request.asset_uid.clone());
                        event.action = Some(request.action.clone());
                        audit::append_best_effort(&expiry_pool, &event).await;
                    }
                }
                Err(err) => tracing::warn!(?err, "approval expiry sweep failed"),
            }
        }
    });

    let stuck_pool = pool.clone();
    let stuck_leader = leader.clone();
    tokio::spawn(async move {
        let mut ticker = time::interval(StdDuration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if !stuck_leader.is_leader() {
                continue;
            }
            let ttl = Duration::seconds(*config::REFRESH_JOB_TTL_SECS);
            match jobs::cleanup_stuck(&stuck_pool, ttl).await {
                Ok(0) => {}
                Ok(recovered) => {
                    tracing::info!(recovered, "requeued stuck refresh jobs");
                }
                Err(err) => tracing::warn!(?err, "stuck-job recovery sweep failed"),
            }
        }
    });

    tokio::spawn(async move {
        let mut ticker = time::interval(StdDuration::from_secs(RETENTION_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if !leader.is_leader() {
                continue;
            }
            let cutoff = Utc::now() - Duration::days(settings.audit_retention.days);
            match audit::delete_older_than(&pool, cutoff).await {
                Ok(0) => {}
                Ok(pruned) => {
                    tracing::info!(pruned, "pruned audit events past retention");
                }
                Err(err) => tracing::warn!(?err, "audit retention sweep failed"),
            }
        }
    });
}
