use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use diesel::connection::{AnsiTransactionManager, TransactionManager};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel_migrations::MigrationHarness;
use uuid::Uuid;

use crate::context::Context;
use crate::db::{DbConnection, DbPool};
use crate::domain::errors::{OutboxError, OutboxResult};
use crate::domain::outbox::{
    truncate_error_message, Message, OutboxRecord, OutboxStats, OutboxStatus, StoreOptions,
};
use crate::domain::ports::{EventStore, Transaction};
use crate::retry::RetryPolicy;
use crate::schema::outbox;

use super::models::{NewOutboxRow, OutboxRow, PendingRow};

type PgTransactionManager = AnsiTransactionManager;

// ── Transaction ──────────────────────────────────────────────────────────────

/// An open Postgres transaction on a pooled connection.
///
/// Business writes go through [`PgTransaction::connection`] so they commit or
/// roll back together with the outbox insert.
pub struct PgTransaction {
    conn: DbConnection,
    finished: bool,
}

impl PgTransaction {
    pub fn begin(mut conn: DbConnection) -> OutboxResult<Self> {
        <PgTransactionManager as TransactionManager<PgConnection>>::begin_transaction(&mut *conn)?;
        Ok(Self {
            conn,
            finished: false,
        })
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut *self.conn
    }
}

impl Transaction for PgTransaction {
    fn commit(mut self) -> OutboxResult<()> {
        self.finished = true;
        <PgTransactionManager as TransactionManager<PgConnection>>::commit_transaction(
            &mut *self.conn,
        )?;
        Ok(())
    }

    fn rollback(mut self) -> OutboxResult<()> {
        self.finished = true;
        <PgTransactionManager as TransactionManager<PgConnection>>::rollback_transaction(
            &mut *self.conn,
        )?;
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = <PgTransactionManager as TransactionManager<PgConnection>>::rollback_transaction(
            &mut *self.conn,
        ) {
            log::warn!("failed to roll back abandoned outbox transaction: {}", e);
        }
    }
}

/// Run one statement attempt under a savepoint.
///
/// Postgres aborts the whole transaction on a failed statement, so a retry
/// issued without rolling back to the savepoint always fails with
/// "current transaction is aborted".
pub(crate) fn savepoint<T>(
    conn: &mut PgConnection,
    op: impl FnOnce(&mut PgConnection) -> QueryResult<T>,
) -> QueryResult<T> {
    conn.transaction(op)
}

// ── Store ────────────────────────────────────────────────────────────────────

pub struct PgEventStore {
    pool: DbPool,
    policy: RetryPolicy<diesel::result::Error>,
    options: StoreOptions,
    ready: AtomicBool,
    init_lock: Mutex<()>,
}

impl PgEventStore {
    pub fn new(pool: DbPool, policy: RetryPolicy<diesel::result::Error>) -> Self {
        Self::with_options(pool, policy, StoreOptions::default())
    }

    pub fn with_options(
        pool: DbPool,
        policy: RetryPolicy<diesel::result::Error>,
        options: StoreOptions,
    ) -> Self {
        Self {
            pool,
            policy,
            options,
            ready: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    fn ensure_ready(&self) -> OutboxResult<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(OutboxError::NotInitialized)
        }
    }

    /// Run `op` in the caller's transaction, or in a fresh one committed on success.
    fn in_transaction<T>(
        &self,
        ctx: &Context,
        tx: Option<&mut PgTransaction>,
        op: impl FnOnce(&mut PgConnection) -> OutboxResult<T>,
    ) -> OutboxResult<T> {
        self.ensure_ready()?;
        ctx.check()?;
        match tx {
            Some(tx) => op(tx.connection()),
            None => {
                let mut own = self.create_transaction(ctx)?;
                let value = op(own.connection())?;
                own.commit()?;
                Ok(value)
            }
        }
    }
}

impl EventStore for PgEventStore {
    type Tx = PgTransaction;

    fn init(&self) -> OutboxResult<()> {
        let _guard = self
            .init_lock
            .lock()
            .map_err(|_| OutboxError::Internal("outbox init lock poisoned".to_string()))?;
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut conn = self.pool.get()?;
        conn.run_pending_migrations(crate::MIGRATIONS)
            .map_err(|e| OutboxError::Migration(e.to_string()))?;

        self.ready.store(true, Ordering::Release);
        log::info!("Outbox store initialized");
        Ok(())
    }

    fn create_transaction(&self, ctx: &Context) -> OutboxResult<PgTransaction> {
        self.ensure_ready()?;
        ctx.check()?;
        let conn = self.pool.get()?;
        PgTransaction::begin(conn)
    }

    fn add_event(
        &self,
        ctx: &Context,
        tx: Option<&mut PgTransaction>,
        topic: &str,
        event_name: &str,
        payload: String,
    ) -> OutboxResult<Uuid> {
        self.in_transaction(ctx, tx, |conn| {
            let row = NewOutboxRow {
                id: Uuid::new_v4(),
                topic,
                event_name,
                payload: &payload,
                status: OutboxStatus::Unpublished.as_str(),
                created_at: Utc::now(),
                error_count: 0,
            };

            let inserted = self.policy.query_row(ctx, || {
                savepoint(conn, |c| {
                    diesel::insert_into(outbox::table)
                        .values(&row)
                        .returning(outbox::id)
                        .get_result::<Uuid>(c)
                })
            })?;

            inserted.ok_or_else(|| {
                OutboxError::UnexpectedState(format!("insert of outbox event {} returned no row", row.id))
            })
        })
    }

    fn get_pending_messages(
        &self,
        ctx: &Context,
        tx: Option<&mut PgTransaction>,
    ) -> OutboxResult<Vec<Message>> {
        let StoreOptions {
            batch_size,
            error_ceiling,
        } = self.options;

        self.in_transaction(ctx, tx, |conn| {
            let rows = self.policy.query(ctx, || {
                savepoint(conn, |c| {
                    outbox::table
                        .filter(outbox::published_at.is_null())
                        .filter(outbox::error_count.lt(error_ceiling))
                        .order(outbox::created_at.asc())
                        .limit(batch_size)
                        .select(PendingRow::as_select())
                        .load(c)
                })
            })?;
            Ok(rows.into_iter().map(Message::from).collect())
        })
    }

    fn clear_event(&self, ctx: &Context, tx: Option<&mut PgTransaction>, id: Uuid) -> OutboxResult<()> {
        self.in_transaction(ctx, tx, |conn| {
            let published_at = Utc::now();
            let updated = self.policy.exec(ctx, || {
                savepoint(conn, |c| {
                    diesel::update(
                        outbox::table
                            .filter(outbox::id.eq(id))
                            .filter(outbox::published_at.is_null()),
                    )
                    .set((
                        outbox::status.eq(OutboxStatus::Published.as_str()),
                        outbox::published_at.eq(Some(published_at)),
                        outbox::error_count.eq(0),
                    ))
                    .execute(c)
                })
            })?;

            if updated == 0 {
                return Err(OutboxError::EventNotFound(id));
            }
            Ok(())
        })
    }

    fn errored_event(
        &self,
        ctx: &Context,
        tx: Option<&mut PgTransaction>,
        id: Uuid,
        reason: &str,
    ) -> OutboxResult<i32> {
        let reason = truncate_error_message(reason);
        self.in_transaction(ctx, tx, |conn| {
            let error_count = self.policy.query_row(ctx, || {
                savepoint(conn, |c| {
                    diesel::update(
                        outbox::table
                            .filter(outbox::id.eq(id))
                            .filter(outbox::published_at.is_null()),
                    )
                    .set((
                        outbox::status.eq(OutboxStatus::Error.as_str()),
                        outbox::error_message.eq(Some(reason.as_str())),
                        outbox::error_count.eq(outbox::error_count + 1),
                    ))
                    .returning(outbox::error_count)
                    .get_result::<i32>(c)
                })
            })?;

            error_count.ok_or(OutboxError::EventNotFound(id))
        })
    }

    fn get_record(&self, ctx: &Context, id: Uuid) -> OutboxResult<Option<OutboxRecord>> {
        self.ensure_ready()?;
        let mut conn = self.pool.get()?;
        let row = self.policy.query_row(ctx, || {
            outbox::table
                .find(id)
                .select(OutboxRow::as_select())
                .first(&mut conn)
        })?;
        row.map(OutboxRecord::try_from).transpose()
    }

    fn get_stuck_messages(&self, ctx: &Context, limit: i64) -> OutboxResult<Vec<OutboxRecord>> {
        self.ensure_ready()?;
        let mut conn = self.pool.get()?;
        let rows = self.policy.query(ctx, || {
            outbox::table
                .filter(outbox::published_at.is_null())
                .filter(outbox::error_count.ge(self.options.error_ceiling))
                .order(outbox::created_at.asc())
                .limit(limit)
                .select(OutboxRow::as_select())
                .load(&mut conn)
        })?;
        rows.into_iter().map(OutboxRecord::try_from).collect()
    }

    fn stats(&self, ctx: &Context) -> OutboxResult<OutboxStats> {
        self.ensure_ready()?;
        let mut conn = self.pool.get()?;

        let by_status: Vec<(String, i64)> = self.policy.query(ctx, || {
            outbox::table
                .group_by(outbox::status)
                .select((outbox::status, diesel::dsl::count(outbox::id)))
                .load(&mut conn)
        })?;

        let stuck: i64 = self
            .policy
            .query_row(ctx, || {
                outbox::table
                    .filter(outbox::published_at.is_null())
                    .filter(outbox::error_count.ge(self.options.error_ceiling))
                    .count()
                    .get_result::<i64>(&mut conn)
            })?
            .unwrap_or(0);

        let mut stats = OutboxStats {
            stuck,
            ..OutboxStats::default()
        };
        for (status, count) in by_status {
            match status.parse::<OutboxStatus>().map_err(OutboxError::UnexpectedState)? {
                OutboxStatus::Unpublished => stats.unpublished = count,
                OutboxStatus::Published => stats.published = count,
                OutboxStatus::Error => stats.errored = count,
            }
        }
        Ok(stats)
    }

    fn error_ceiling(&self) -> i32 {
        self.options.error_ceiling
    }
}
