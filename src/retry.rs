use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use diesel::result::{DatabaseErrorKind, Error as DieselError};

use crate::context::{Context, ContextError};

pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(5);

/// Errors that can report a "no rows" outcome, which is never retried.
pub trait RetryableError {
    fn is_not_found(&self) -> bool;
}

impl RetryableError for DieselError {
    fn is_not_found(&self) -> bool {
        matches!(self, DieselError::NotFound)
    }
}

/// Decides whether a failed attempt may be repeated.
///
/// Returning `false` means permanent; a classifier with no opinion must
/// return `false` as well.
pub trait ErrorClassifier<E>: Send + Sync {
    fn is_transient(&self, err: &E) -> bool;
}

impl<E, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn is_transient(&self, err: &E) -> bool {
        self(err)
    }
}

/// Server messages for deadlocks (SQLSTATE 40P01) and `NOWAIT` lock misses
/// (55P03). diesel reports both as `DatabaseErrorKind::Unknown` and does not
/// expose the SQLSTATE, so the message text is the only signal. These are the
/// untranslated server texts: with a non-English `lc_messages` the match
/// fails and such errors are treated as permanent.
const PG_LOCK_MESSAGES: [&str; 2] = ["deadlock detected", "could not obtain lock"];

/// Licenses only Postgres lock contention: deadlocks, serialization
/// failures and `NOWAIT` lock misses. Timeouts stay permanent because the
/// statement may already have been applied.
///
/// Serialization failures are matched by kind. Deadlocks and lock misses are
/// matched by message and need the server to report in English.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgLockClassifier;

impl ErrorClassifier<DieselError> for PgLockClassifier {
    fn is_transient(&self, err: &DieselError) -> bool {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => true,
            DieselError::DatabaseError(DatabaseErrorKind::Unknown, info) => {
                let message = info.message();
                PG_LOCK_MESSAGES.iter().any(|m| message.contains(*m))
            }
            _ => false,
        }
    }
}

/// Outcome of a policy run that did not produce a value.
#[derive(Debug)]
pub enum RetryError<E> {
    Context(ContextError),
    Failed(E),
}

impl<E> From<ContextError> for RetryError<E> {
    fn from(e: ContextError) -> Self {
        RetryError::Context(e)
    }
}

/// Bounded, fixed-delay retry around a single database call.
///
/// The call is made once and repeated up to `retries` more times while the
/// classifier calls the failure transient. Exhaustion hands the last error
/// back unchanged.
pub struct RetryPolicy<E> {
    retries: u32,
    delay: Duration,
    classifier: Arc<dyn ErrorClassifier<E>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            retries: self.retries,
            delay: self.delay,
            classifier: Arc::clone(&self.classifier),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retries", &self.retries)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl<E> RetryPolicy<E>
where
    E: RetryableError + fmt::Display,
{
    pub fn new(classifier: impl ErrorClassifier<E> + 'static) -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            delay: DEFAULT_DELAY,
            classifier: Arc::new(classifier),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Single-row read. "No rows" comes back as `Ok(None)`.
    pub fn query_row<T>(
        &self,
        ctx: &Context,
        op: impl FnMut() -> Result<T, E>,
    ) -> Result<Option<T>, RetryError<E>> {
        self.run(ctx, op)
    }

    /// Multi-row read. "No rows" comes back as an empty batch.
    pub fn query<T>(
        &self,
        ctx: &Context,
        op: impl FnMut() -> Result<Vec<T>, E>,
    ) -> Result<Vec<T>, RetryError<E>> {
        Ok(self.run(ctx, op)?.unwrap_or_default())
    }

    /// Statement returning the affected row count.
    pub fn exec(
        &self,
        ctx: &Context,
        op: impl FnMut() -> Result<usize, E>,
    ) -> Result<usize, RetryError<E>> {
        Ok(self.run(ctx, op)?.unwrap_or(0))
    }

    fn run<T>(
        &self,
        ctx: &Context,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<Option<T>, RetryError<E>> {
        let mut attempt = 0;
        loop {
            ctx.check()?;
            match op() {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => {
                    if attempt >= self.retries || !self.classifier.is_transient(&e) {
                        return Err(RetryError::Failed(e));
                    }
                    attempt += 1;
                    log::debug!(
                        "transient database error, retry {}/{} in {:?}: {}",
                        attempt,
                        self.retries,
                        self.delay,
                        e
                    );
                    ctx.check()?;
                    std::thread::sleep(self.delay);
                }
            }
        }
    }
}
