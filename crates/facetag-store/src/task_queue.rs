//! At-least-once task queue on SQLite.
//!
//! Messages are leased, not popped: `receive` hides a message for the lease
//! duration and hands out a receipt. The consumer either acks the receipt
//! (message deleted), releases it with a retry delay, or dead-letters it.
//! A lease that expires without an ack makes the message visible again, so
//! a crashed consumer never loses work. Once a message has been delivered
//! `max_attempts` times, a further release moves it to the dead-letter
//! state instead of back to the ready set.

use crate::db;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS task_queue (
    message_id  TEXT PRIMARY KEY,
    queue       TEXT NOT NULL,
    body        TEXT NOT NULL,
    state       TEXT NOT NULL DEFAULT 'ready',
    attempts    INTEGER NOT NULL DEFAULT 0,
    visible_at  INTEGER NOT NULL,
    receipt     TEXT,
    last_error  TEXT,
    enqueued_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_queue_ready ON task_queue(queue, state, visible_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_task_queue_receipt ON task_queue(receipt);
";

const STATE_READY: &str = "ready";
const STATE_DEAD: &str = "dead";

/// Longest `last_error` kept on a row.
const MAX_ERROR_LEN: usize = 512;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("receipt {0} is stale (lease expired or message already settled)")]
    StaleReceipt(String),
    #[error("task queue lock poisoned")]
    Poisoned,
}

impl QueueError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(e) => db::is_busy(e),
            _ => false,
        }
    }
}

/// A leased message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Handle for settling this delivery; invalid once the lease expires.
    pub receipt: String,
    pub body: String,
    /// Number of deliveries so far, including this one.
    pub attempts: u32,
}

/// Outcome of releasing a message after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Visible again after the requested delay.
    Retrying,
    /// Out of attempts; parked in the dead-letter state.
    DeadLettered,
}

/// A message that exhausted its attempts or was rejected outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: String,
    pub body: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Queue depth for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Ready or leased messages.
    pub pending: u64,
    pub dead: u64,
}

/// Producer/consumer interface between the detector and the cropper.
pub trait TaskQueue: Send + Sync {
    fn send(&self, body: &str) -> Result<String, QueueError>;
    fn receive(&self, max: usize, lease: Duration) -> Result<Vec<ReceivedMessage>, QueueError>;
    fn ack(&self, receipt: &str) -> Result<(), QueueError>;
    fn release(&self, receipt: &str, delay: Duration, error: &str) -> Result<Release, QueueError>;
    fn dead_letter(&self, receipt: &str, error: &str) -> Result<(), QueueError>;
}

/// SQLite-backed [`TaskQueue`]. Several named queues may share one file.
pub struct SqliteTaskQueue {
    conn: Mutex<Connection>,
    queue: String,
    max_attempts: u32,
}

impl SqliteTaskQueue {
    pub fn open(path: &Path, queue: &str, max_attempts: u32) -> Result<Self, QueueError> {
        db::ensure_parent(path)?;
        let q = Self::with_connection(db::open_file(path)?, queue, max_attempts)?;
        tracing::info!(path = %path.display(), queue, max_attempts, "task queue opened");
        Ok(q)
    }

    pub fn open_in_memory(queue: &str, max_attempts: u32) -> Result<Self, QueueError> {
        Self::with_connection(Connection::open_in_memory()?, queue, max_attempts)
    }

    fn with_connection(
        conn: Connection,
        queue: &str,
        max_attempts: u32,
    ) -> Result<Self, QueueError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            queue: queue.to_string(),
            max_attempts: max_attempts.max(1),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn.lock().map_err(|_| QueueError::Poisoned)
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let (pending, dead) = self.conn()?.query_row(
            "SELECT COALESCE(SUM(state = ?2), 0), COALESCE(SUM(state = ?3), 0)
             FROM task_queue WHERE queue = ?1",
            params![self.queue, STATE_READY, STATE_DEAD],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(QueueStats {
            pending: pending as u64,
            dead: dead as u64,
        })
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, body, attempts, last_error FROM task_queue
             WHERE queue = ?1 AND state = ?2 ORDER BY enqueued_at",
        )?;
        let rows = stmt
            .query_map(params![self.queue, STATE_DEAD], |row| {
                Ok(DeadLetter {
                    message_id: row.get(0)?,
                    body: row.get(1)?,
                    attempts: row.get(2)?,
                    last_error: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Move every dead letter back to the ready set with a fresh attempt budget.
    pub fn redrive(&self) -> Result<usize, QueueError> {
        let moved = self.conn()?.execute(
            "UPDATE task_queue SET state = ?2, attempts = 0, visible_at = ?3, receipt = NULL
             WHERE queue = ?1 AND state = ?4",
            params![self.queue, STATE_READY, db::now_millis(), STATE_DEAD],
        )?;
        if moved > 0 {
            tracing::info!(queue = %self.queue, moved, "dead letters redriven");
        }
        Ok(moved)
    }
}

fn truncate_error(error: &str) -> &str {
    if error.len() <= MAX_ERROR_LEN {
        return error;
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl TaskQueue for SqliteTaskQueue {
    fn send(&self, body: &str) -> Result<String, QueueError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let now = db::now_millis();
        self.conn()?.execute(
            "INSERT INTO task_queue (message_id, queue, body, state, visible_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![message_id, self.queue, body, STATE_READY, now],
        )?;
        tracing::debug!(queue = %self.queue, message_id = %message_id, "message enqueued");
        Ok(message_id)
    }

    fn receive(&self, max: usize, lease: Duration) -> Result<Vec<ReceivedMessage>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = db::now_millis();

        let candidates = {
            let mut stmt = tx.prepare(
                "SELECT message_id, body, attempts FROM task_queue
                 WHERE queue = ?1 AND state = ?2 AND visible_at <= ?3
                 ORDER BY visible_at, enqueued_at LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(
                    params![self.queue, STATE_READY, now, max as i64],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                        ))
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let visible_at = now.saturating_add(millis(lease));
        let mut leased = Vec::with_capacity(candidates.len());
        for (message_id, body, attempts) in candidates {
            let receipt = uuid::Uuid::new_v4().to_string();
            tx.execute(
                "UPDATE task_queue SET attempts = attempts + 1, visible_at = ?2, receipt = ?3
                 WHERE message_id = ?1",
                params![message_id, visible_at, receipt],
            )?;
            leased.push(ReceivedMessage {
                message_id,
                receipt,
                body,
                attempts: attempts + 1,
            });
        }
        tx.commit()?;

        if !leased.is_empty() {
            tracing::debug!(queue = %self.queue, count = leased.len(), "messages leased");
        }
        Ok(leased)
    }

    fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        let deleted = self.conn()?.execute(
            "DELETE FROM task_queue WHERE queue = ?1 AND receipt = ?2 AND state = ?3",
            params![self.queue, receipt, STATE_READY],
        )?;
        if deleted == 0 {
            return Err(QueueError::StaleReceipt(receipt.to_string()));
        }
        Ok(())
    }

    fn release(&self, receipt: &str, delay: Duration, error: &str) -> Result<Release, QueueError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let attempts: Option<u32> = tx
            .query_row(
                "SELECT attempts FROM task_queue WHERE queue = ?1 AND receipt = ?2 AND state = ?3",
                params![self.queue, receipt, STATE_READY],
                |row| row.get(0),
            )
            .optional()?;
        let Some(attempts) = attempts else {
            return Err(QueueError::StaleReceipt(receipt.to_string()));
        };

        let error = truncate_error(error);
        let outcome = if attempts >= self.max_attempts {
            tx.execute(
                "UPDATE task_queue SET state = ?2, receipt = NULL, last_error = ?3
                 WHERE receipt = ?1",
                params![receipt, STATE_DEAD, error],
            )?;
            Release::DeadLettered
        } else {
            let visible_at = db::now_millis().saturating_add(millis(delay));
            tx.execute(
                "UPDATE task_queue SET visible_at = ?2, receipt = NULL, last_error = ?3
                 WHERE receipt = ?1",
                params![receipt, visible_at, error],
            )?;
            Release::Retrying
        };
        tx.commit()?;

        if outcome == Release::DeadLettered {
            tracing::error!(
                queue = %self.queue,
                attempts,
                error,
                "message dead-lettered after max attempts"
            );
        }
        Ok(outcome)
    }

    fn dead_letter(&self, receipt: &str, error: &str) -> Result<(), QueueError> {
        let changed = self.conn()?.execute(
            "UPDATE task_queue SET state = ?3, receipt = NULL, last_error = ?4
             WHERE queue = ?1 AND receipt = ?2 AND state = ?5",
            params![self.queue, receipt, STATE_DEAD, truncate_error(error), STATE_READY],
        )?;
        if changed == 0 {
            return Err(QueueError::StaleReceipt(receipt.to_string()));
        }
        tracing::warn!(queue = %self.queue, error, "message dead-lettered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_LEASE: Duration = Duration::from_secs(60);

    fn queue(max_attempts: u32) -> SqliteTaskQueue {
        SqliteTaskQueue::open_in_memory("crop-tasks", max_attempts).unwrap()
    }

    #[test]
    fn test_send_receive_ack() {
        let q = queue(3);
        let id = q.send("hello").unwrap();
        let got = q.receive(10, LONG_LEASE).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message_id, id);
        assert_eq!(got[0].body, "hello");
        assert_eq!(got[0].attempts, 1);

        q.ack(&got[0].receipt).unwrap();
        assert_eq!(q.stats().unwrap(), QueueStats { pending: 0, dead: 0 });
    }

    #[test]
    fn test_leased_message_is_hidden() {
        let q = queue(3);
        q.send("a").unwrap();
        assert_eq!(q.receive(10, LONG_LEASE).unwrap().len(), 1);
        assert!(q.receive(10, LONG_LEASE).unwrap().is_empty());
        assert_eq!(q.stats().unwrap().pending, 1);
    }

    #[test]
    fn test_expired_lease_redelivers() {
        let q = queue(3);
        q.send("a").unwrap();
        let first = q.receive(10, Duration::ZERO).unwrap();
        let second = q.receive(10, LONG_LEASE).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].attempts, 2);
        assert_ne!(second[0].receipt, first[0].receipt);

        // The first consumer's receipt no longer settles anything.
        assert!(matches!(q.ack(&first[0].receipt), Err(QueueError::StaleReceipt(_))));
        q.ack(&second[0].receipt).unwrap();
    }

    #[test]
    fn test_receive_respects_batch_size() {
        let q = queue(3);
        for i in 0..5 {
            q.send(&format!("m{i}")).unwrap();
        }
        assert_eq!(q.receive(2, LONG_LEASE).unwrap().len(), 2);
        assert_eq!(q.receive(10, LONG_LEASE).unwrap().len(), 3);
        assert!(q.receive(0, LONG_LEASE).unwrap().is_empty());
    }

    #[test]
    fn test_release_retries_then_dead_letters() {
        let q = queue(2);
        q.send("flaky").unwrap();

        let m = q.receive(1, LONG_LEASE).unwrap().remove(0);
        assert_eq!(q.release(&m.receipt, Duration::ZERO, "boom 1").unwrap(), Release::Retrying);

        let m = q.receive(1, LONG_LEASE).unwrap().remove(0);
        assert_eq!(m.attempts, 2);
        assert_eq!(
            q.release(&m.receipt, Duration::ZERO, "boom 2").unwrap(),
            Release::DeadLettered
        );

        assert!(q.receive(1, LONG_LEASE).unwrap().is_empty());
        let dead = q.dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, "flaky");
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].last_error.as_deref(), Some("boom 2"));
        assert_eq!(q.stats().unwrap(), QueueStats { pending: 0, dead: 1 });
    }

    #[test]
    fn test_release_delay_hides_message() {
        let q = queue(5);
        q.send("later").unwrap();
        let m = q.receive(1, LONG_LEASE).unwrap().remove(0);
        q.release(&m.receipt, LONG_LEASE, "wait").unwrap();
        assert!(q.receive(1, LONG_LEASE).unwrap().is_empty());
    }

    #[test]
    fn test_dead_letter_immediately() {
        let q = queue(5);
        q.send("garbage").unwrap();
        let m = q.receive(1, LONG_LEASE).unwrap().remove(0);
        q.dead_letter(&m.receipt, "malformed").unwrap();
        assert_eq!(q.stats().unwrap(), QueueStats { pending: 0, dead: 1 });
        assert!(matches!(q.ack(&m.receipt), Err(QueueError::StaleReceipt(_))));
    }

    #[test]
    fn test_redrive() {
        let q = queue(1);
        q.send("x").unwrap();
        let m = q.receive(1, LONG_LEASE).unwrap().remove(0);
        q.release(&m.receipt, Duration::ZERO, "e").unwrap();
        assert_eq!(q.redrive().unwrap(), 1);
        let m = q.receive(1, LONG_LEASE).unwrap().remove(0);
        assert_eq!(m.attempts, 1);
        assert_eq!(m.body, "x");
    }

    #[test]
    fn test_queues_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let crops = SqliteTaskQueue::open(&path, "crop-tasks", 3).unwrap();
        let other = SqliteTaskQueue::open(&path, "other", 3).unwrap();
        crops.send("c").unwrap();
        assert!(other.receive(10, LONG_LEASE).unwrap().is_empty());
        assert_eq!(crops.receive(10, LONG_LEASE).unwrap().len(), 1);
    }

    #[test]
    fn test_truncate_error_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_LEN);
        let cut = truncate_error(&long);
        assert!(cut.len() <= MAX_ERROR_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
