use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use uuid::Uuid;

use crate::context::Context;
use crate::domain::errors::{OutboxError, OutboxResult};
use crate::domain::outbox::{
    truncate_error_message, Message, OutboxRecord, OutboxStats, OutboxStatus, StoreOptions,
};
use crate::domain::ports::{EventStore, Transaction};

type Rows = Vec<OutboxRecord>;

#[derive(Debug, Clone)]
enum Change {
    Insert(OutboxRecord),
    Clear(Uuid),
    Errored(Uuid, String),
}

/// Apply one change to a row set, enforcing the same rules as the SQL store.
fn apply(rows: &mut Rows, change: &Change) -> OutboxResult<Option<i32>> {
    match change {
        Change::Insert(record) => {
            rows.push(record.clone());
            Ok(None)
        }
        Change::Clear(id) => {
            let row = pending_row(rows, *id)?;
            row.status = OutboxStatus::Published;
            row.published_at = Some(Utc::now());
            row.error_count = 0;
            Ok(None)
        }
        Change::Errored(id, reason) => {
            let row = pending_row(rows, *id)?;
            row.status = OutboxStatus::Error;
            row.error_message = Some(reason.clone());
            row.error_count += 1;
            Ok(Some(row.error_count))
        }
    }
}

fn pending_row(rows: &mut Rows, id: Uuid) -> OutboxResult<&mut OutboxRecord> {
    rows.iter_mut()
        .find(|r| {
            r.id == id
                && r.published_at.is_none()
                && r.status.can_transition_to(OutboxStatus::Published)
        })
        .ok_or(OutboxError::EventNotFound(id))
}

/// Transaction over a [`MemoryEventStore`].
///
/// Changes are staged against a private snapshot and only reach the shared
/// rows on commit.
pub struct MemoryTransaction {
    shared: Arc<Mutex<Rows>>,
    snapshot: Rows,
    changes: Vec<Change>,
}

impl MemoryTransaction {
    fn stage(&mut self, change: Change) -> OutboxResult<Option<i32>> {
        let result = apply(&mut self.snapshot, &change)?;
        self.changes.push(change);
        Ok(result)
    }
}

impl Transaction for MemoryTransaction {
    fn commit(self) -> OutboxResult<()> {
        let mut rows = lock(&self.shared)?;
        let mut next = rows.clone();
        for change in &self.changes {
            apply(&mut next, change)?;
        }
        *rows = next;
        Ok(())
    }

    fn rollback(self) -> OutboxResult<()> {
        Ok(())
    }
}

/// Process-local outbox with the same selection and transition rules as the
/// Postgres store. Nothing survives a restart.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    rows: Arc<Mutex<Rows>>,
    options: StoreOptions,
}

fn lock(rows: &Mutex<Rows>) -> OutboxResult<MutexGuard<'_, Rows>> {
    rows.lock()
        .map_err(|_| OutboxError::Internal("memory outbox lock poisoned".to_string()))
}

impl MemoryEventStore {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            rows: Arc::default(),
            options,
        }
    }

    /// Every committed record, in insertion order.
    pub fn records(&self) -> OutboxResult<Vec<OutboxRecord>> {
        Ok(lock(&self.rows)?.clone())
    }

    fn write(&self, ctx: &Context, tx: Option<&mut MemoryTransaction>, change: Change) -> OutboxResult<Option<i32>> {
        ctx.check()?;
        match tx {
            Some(tx) => tx.stage(change),
            None => apply(&mut *lock(&self.rows)?, &change),
        }
    }

    fn pending_in(&self, rows: &Rows) -> Vec<Message> {
        let mut pending: Vec<&OutboxRecord> = rows
            .iter()
            .filter(|r| r.published_at.is_none() && r.error_count < self.options.error_ceiling)
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
            .into_iter()
            .take(usize::try_from(self.options.batch_size).unwrap_or(0))
            .map(OutboxRecord::to_message)
            .collect()
    }
}

impl EventStore for MemoryEventStore {
    type Tx = MemoryTransaction;

    fn init(&self) -> OutboxResult<()> {
        Ok(())
    }

    fn create_transaction(&self, ctx: &Context) -> OutboxResult<MemoryTransaction> {
        ctx.check()?;
        let snapshot = lock(&self.rows)?.clone();
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.rows),
            snapshot,
            changes: Vec::new(),
        })
    }

    fn add_event(
        &self,
        ctx: &Context,
        tx: Option<&mut MemoryTransaction>,
        topic: &str,
        event_name: &str,
        payload: String,
    ) -> OutboxResult<Uuid> {
        let id = Uuid::new_v4();
        let record = OutboxRecord {
            id,
            topic: topic.to_string(),
            event_name: event_name.to_string(),
            payload,
            status: OutboxStatus::Unpublished,
            created_at: Utc::now(),
            published_at: None,
            error_count: 0,
            error_message: None,
        };
        self.write(ctx, tx, Change::Insert(record))?;
        Ok(id)
    }

    fn get_pending_messages(
        &self,
        ctx: &Context,
        tx: Option<&mut MemoryTransaction>,
    ) -> OutboxResult<Vec<Message>> {
        ctx.check()?;
        match tx {
            Some(tx) => Ok(self.pending_in(&tx.snapshot)),
            None => Ok(self.pending_in(&*lock(&self.rows)?)),
        }
    }

    fn clear_event(&self, ctx: &Context, tx: Option<&mut MemoryTransaction>, id: Uuid) -> OutboxResult<()> {
        self.write(ctx, tx, Change::Clear(id))?;
        Ok(())
    }

    fn errored_event(
        &self,
        ctx: &Context,
        tx: Option<&mut MemoryTransaction>,
        id: Uuid,
        reason: &str,
    ) -> OutboxResult<i32> {
        let change = Change::Errored(id, truncate_error_message(reason));
        self.write(ctx, tx, change)?
            .ok_or_else(|| OutboxError::UnexpectedState(format!("no error count for {}", id)))
    }

    fn get_record(&self, ctx: &Context, id: Uuid) -> OutboxResult<Option<OutboxRecord>> {
        ctx.check()?;
        Ok(lock(&self.rows)?.iter().find(|r| r.id == id).cloned())
    }

    fn get_stuck_messages(&self, ctx: &Context, limit: i64) -> OutboxResult<Vec<OutboxRecord>> {
        ctx.check()?;
        let ceiling = self.options.error_ceiling;
        let mut stuck: Vec<OutboxRecord> = lock(&self.rows)?
            .iter()
            .filter(|r| r.is_stuck(ceiling))
            .cloned()
            .collect();
        stuck.sort_by_key(|r| r.created_at);
        stuck.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stuck)
    }

    fn stats(&self, ctx: &Context) -> OutboxResult<OutboxStats> {
        ctx.check()?;
        let ceiling = self.options.error_ceiling;
        let rows = lock(&self.rows)?;
        let mut stats = OutboxStats::default();
        for row in rows.iter() {
            match row.status {
                OutboxStatus::Unpublished => stats.unpublished += 1,
                OutboxStatus::Published => stats.published += 1,
                OutboxStatus::Error => stats.errored += 1,
            }
            if row.is_stuck(ceiling) {
                stats.stuck += 1;
            }
        }
        Ok(stats)
    }

    fn error_ceiling(&self) -> i32 {
        self.options.error_ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryEventStore {
        MemoryEventStore::new(StoreOptions::default())
    }

    fn add(store: &MemoryEventStore, name: &str) -> Uuid {
        store
            .add_event(&Context::background(), None, "PersonTopic", name, "{}".to_string())
            .expect("insert failed")
    }

    #[test]
    fn rolled_back_insert_is_never_visible() {
        let store = store();
        let ctx = Context::background();

        let mut tx = store.create_transaction(&ctx).expect("begin failed");
        store
            .add_event(&ctx, Some(&mut tx), "PersonTopic", "PersonAdded", "{}".to_string())
            .expect("insert failed");
        assert_eq!(
            store
                .get_pending_messages(&ctx, Some(&mut tx))
                .expect("poll failed")
                .len(),
            1,
            "the transaction sees its own insert"
        );
        assert!(store.get_pending_messages(&ctx, None).expect("poll failed").is_empty());

        tx.rollback().expect("rollback failed");
        assert!(store.records().expect("records failed").is_empty());
    }

    #[test]
    fn committed_insert_becomes_pending() {
        let store = store();
        let ctx = Context::background();

        let mut tx = store.create_transaction(&ctx).expect("begin failed");
        let id = store
            .add_event(&ctx, Some(&mut tx), "PersonTopic", "PersonAdded", "{}".to_string())
            .expect("insert failed");
        tx.commit().expect("commit failed");

        let pending = store.get_pending_messages(&ctx, None).expect("poll failed");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
    }

    #[test]
    fn dropped_transaction_discards_changes() {
        let store = store();
        let id = add(&store, "PersonAdded");
        let ctx = Context::background();

        {
            let mut tx = store.create_transaction(&ctx).expect("begin failed");
            store.clear_event(&ctx, Some(&mut tx), id).expect("clear failed");
        }

        let record = store.get_record(&ctx, id).expect("lookup failed").expect("exists");
        assert_eq!(record.status, OutboxStatus::Unpublished);
    }

    #[test]
    fn pending_is_oldest_first_and_bounded() {
        let store = MemoryEventStore::new(StoreOptions {
            batch_size: 2,
            error_ceiling: 10,
        });
        let first = add(&store, "E0");
        let second = add(&store, "E1");
        add(&store, "E2");

        let ids: Vec<Uuid> = store
            .get_pending_messages(&Context::background(), None)
            .expect("poll failed")
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn clear_resets_error_count_and_is_terminal() {
        let store = store();
        let ctx = Context::background();
        let id = add(&store, "PersonAdded");

        assert_eq!(store.errored_event(&ctx, None, id, "nack").expect("errored"), 1);
        store.clear_event(&ctx, None, id).expect("clear failed");

        let record = store.get_record(&ctx, id).expect("lookup failed").expect("exists");
        assert_eq!(record.status, OutboxStatus::Published);
        assert_eq!(record.error_count, 0);
        assert!(record.published_at.is_some());

        assert!(matches!(
            store.errored_event(&ctx, None, id, "late"),
            Err(OutboxError::EventNotFound(_))
        ));
        assert!(matches!(
            store.clear_event(&ctx, None, id),
            Err(OutboxError::EventNotFound(_))
        ));
    }

    #[test]
    fn record_at_ceiling_is_excluded_and_reported_stuck() {
        let store = store();
        let ctx = Context::background();
        let id = add(&store, "PersonAdded");

        for _ in 0..10 {
            store.errored_event(&ctx, None, id, "broker down").expect("errored");
        }

        let record = store.get_record(&ctx, id).expect("lookup failed").expect("exists");
        assert_eq!(record.error_count, 10);
        assert!(record.published_at.is_none());
        assert!(store.get_pending_messages(&ctx, None).expect("poll failed").is_empty());

        let stuck = store.get_stuck_messages(&ctx, 5).expect("stuck failed");
        assert_eq!(stuck.len(), 1);
        let stats = store.stats(&ctx).expect("stats failed");
        assert_eq!(
            stats,
            OutboxStats {
                unpublished: 0,
                published: 0,
                errored: 1,
                stuck: 1,
            }
        );
    }

    #[test]
    fn error_messages_are_truncated() {
        let store = store();
        let ctx = Context::background();
        let id = add(&store, "PersonAdded");

        store
            .errored_event(&ctx, None, id, &"x".repeat(1000))
            .expect("errored failed");

        let record = store.get_record(&ctx, id).expect("lookup failed").expect("exists");
        assert_eq!(record.error_message.map(|m| m.len()), Some(255));
    }

    #[test]
    fn cancelled_context_rejects_writes() {
        let store = store();
        let ctx = Context::background();
        ctx.cancel();

        let result = store.add_event(&ctx, None, "PersonTopic", "PersonAdded", "{}".to_string());
        assert!(matches!(result, Err(ref e) if e.is_cancellation()));
        assert!(store.records().expect("records failed").is_empty());
    }
}
