use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rusqlite::Connection;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mercato_core::config::{BURST_WINDOW_SECS, FLUSH_DELAY_SECS};
use mercato_core::types::{ConversationId, TenantId};

use crate::db::init_db;
use crate::error::{HarmonizerError, Result};
use crate::types::{LogicalTurn, QueueEntry, QueueStatus};

/// Buffers rapid inbound messages per conversation and emits one
/// [`LogicalTurn`] once the burst settles.
///
/// On each enqueue a flush timer is (re)armed for `flush_delay` after the
/// *latest* message. When it fires, queued entries older than the burst
/// window are atomically claimed into `processing`, concatenated in arrival
/// order and sent on the turn channel. At most one batch per conversation is
/// in `processing` at any time, enforced by a per-conversation exclusive
/// lock plus a claim predicate.
pub struct BurstBuffer {
    db: Mutex<Connection>,
    turn_tx: mpsc::Sender<LogicalTurn>,
    /// Generation per conversation: a newer enqueue invalidates the older
    /// pending timer without cancelling its task.
    generations: DashMap<String, u64>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    generation_seq: AtomicU64,
    burst_window_secs: i64,
    flush_delay: Duration,
}

impl BurstBuffer {
    pub fn new(conn: Connection, turn_tx: mpsc::Sender<LogicalTurn>) -> Result<Arc<Self>> {
        Self::with_timing(
            conn,
            turn_tx,
            BURST_WINDOW_SECS,
            Duration::from_secs(FLUSH_DELAY_SECS),
        )
    }

    /// Timing-injectable constructor used by tests.
    pub fn with_timing(
        conn: Connection,
        turn_tx: mpsc::Sender<LogicalTurn>,
        burst_window_secs: i64,
        flush_delay: Duration,
    ) -> Result<Arc<Self>> {
        init_db(&conn)?;
        Ok(Arc::new(Self {
            db: Mutex::new(conn),
            turn_tx,
            generations: DashMap::new(),
            locks: DashMap::new(),
            generation_seq: AtomicU64::new(1),
            burst_window_secs,
            flush_delay,
        }))
    }

    /// Buffer one inbound message and (re)arm the conversation's flush timer.
    pub fn enqueue(
        self: &Arc<Self>,
        tenant_id: &TenantId,
        conversation_id: &ConversationId,
        message_id: &str,
        text: &str,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let entry_id = {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO message_queue
                 (tenant_id, conversation_id, message_id, text, status, queued_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5)",
                rusqlite::params![
                    tenant_id.as_str(),
                    conversation_id.as_str(),
                    message_id,
                    text,
                    now
                ],
            )?;
            db.last_insert_rowid()
        };
        debug!(conversation_id = %conversation_id, entry_id, "message buffered");

        // Rearm: bump the generation and schedule a flush for this one.
        let generation = self.generation_seq.fetch_add(1, Ordering::Relaxed);
        self.generations
            .insert(conversation_id.as_str().to_string(), generation);

        let buffer = Arc::clone(self);
        let conversation = conversation_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(buffer.flush_delay).await;
            let current = buffer
                .generations
                .get(conversation.as_str())
                .map(|g| *g)
                .unwrap_or(0);
            if current != generation {
                // A newer message rearmed the timer; that one will flush.
                return;
            }
            if let Err(e) = buffer.flush(&conversation).await {
                warn!(conversation_id = %conversation, error = %e, "burst flush failed");
            }
        });

        Ok(entry_id)
    }

    /// Claim ready entries for a conversation and emit the combined turn.
    pub async fn flush(self: &Arc<Self>, conversation_id: &ConversationId) -> Result<()> {
        let lock = self
            .locks
            .entry(conversation_id.as_str().to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let turn = {
            let db = self.db.lock().unwrap();

            // An unfinished batch means a turn is mid-flight; its completion
            // (or failure) will release the entries.
            let in_flight: i64 = db.query_row(
                "SELECT COUNT(*) FROM message_queue
                 WHERE conversation_id = ?1 AND status = 'processing'",
                [conversation_id.as_str()],
                |row| row.get(0),
            )?;
            if in_flight > 0 {
                debug!(conversation_id = %conversation_id, "batch already processing, skipping flush");
                return Ok(());
            }

            let cutoff = (Utc::now() - chrono::Duration::seconds(self.burst_window_secs))
                .to_rfc3339();
            let claimed = db.execute(
                "UPDATE message_queue SET status = 'processing'
                 WHERE conversation_id = ?1 AND status = 'queued' AND queued_at <= ?2",
                rusqlite::params![conversation_id.as_str(), cutoff],
            )?;
            if claimed == 0 {
                return Ok(());
            }

            let mut stmt = db.prepare(
                "SELECT id, tenant_id, message_id, text FROM message_queue
                 WHERE conversation_id = ?1 AND status = 'processing'
                 ORDER BY queued_at, id",
            )?;
            let rows: Vec<(i64, String, String, String)> = stmt
                .query_map([conversation_id.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .filter_map(|r| r.ok())
                .collect();

            let tenant_id = TenantId::from(rows[0].1.clone());
            let combined_text = rows
                .iter()
                .map(|(_, _, _, text)| text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            LogicalTurn {
                tenant_id,
                conversation_id: conversation_id.clone(),
                combined_text,
                message_ids: rows.iter().map(|(_, _, m, _)| m.clone()).collect(),
                entry_ids: rows.iter().map(|(id, _, _, _)| *id).collect(),
            }
        };

        info!(
            conversation_id = %conversation_id,
            messages = turn.message_ids.len(),
            "burst harmonized into one turn"
        );
        self.turn_tx
            .send(turn)
            .await
            .map_err(|_| HarmonizerError::ChannelClosed)
    }

    /// Mark a completed batch `processed`.
    pub fn mark_processed(&self, entry_ids: &[i64]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        for id in entry_ids {
            db.execute(
                "UPDATE message_queue SET status = 'processed', processed_at = ?2
                 WHERE id = ?1 AND status = 'processing'",
                rusqlite::params![id, now],
            )?;
        }
        Ok(())
    }

    /// Mark a failed batch with its error string.
    pub fn mark_failed(&self, entry_ids: &[i64], error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        for id in entry_ids {
            db.execute(
                "UPDATE message_queue SET status = 'failed', processed_at = ?2, error = ?3
                 WHERE id = ?1 AND status = 'processing'",
                rusqlite::params![id, now, error],
            )?;
        }
        Ok(())
    }

    pub fn entry(&self, id: i64) -> Result<QueueEntry> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, tenant_id, conversation_id, message_id, text, status,
                    queued_at, processed_at, error
             FROM message_queue WHERE id = ?1",
            [id],
            |row| {
                let status: String = row.get(5)?;
                Ok(QueueEntry {
                    id: row.get(0)?,
                    tenant_id: TenantId::from(row.get::<_, String>(1)?),
                    conversation_id: ConversationId::from(row.get::<_, String>(2)?),
                    message_id: row.get(3)?,
                    text: row.get(4)?,
                    status: status.parse().unwrap_or(QueueStatus::Queued),
                    queued_at: row.get(6)?,
                    processed_at: row.get(7)?,
                    error: row.get(8)?,
                })
            },
        )
        .map_err(HarmonizerError::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(
        turn_tx: mpsc::Sender<LogicalTurn>,
        flush_delay: Duration,
    ) -> Arc<BurstBuffer> {
        // Burst window 0: everything queued is immediately claimable, so
        // tests don't sleep through the real 3 s window.
        BurstBuffer::with_timing(
            Connection::open_in_memory().unwrap(),
            turn_tx,
            0,
            flush_delay,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn burst_of_three_yields_one_turn() {
        let (tx, mut rx) = mpsc::channel(4);
        let buffer = buffer(tx, Duration::from_millis(50));
        let tenant = TenantId::new();
        let conversation = ConversationId::new();

        for (i, text) in ["I want to book", "a haircut", "tomorrow 10am"]
            .iter()
            .enumerate()
        {
            buffer
                .enqueue(&tenant, &conversation, &format!("m-{i}"), text)
                .unwrap();
        }

        let turn = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("flush timer should fire")
            .expect("turn expected");
        assert_eq!(turn.combined_text, "I want to book\na haircut\ntomorrow 10am");
        assert_eq!(turn.message_ids.len(), 3);

        // No second turn for the same burst.
        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn rearmed_timer_defers_flush() {
        let (tx, mut rx) = mpsc::channel(4);
        let buffer = buffer(tx, Duration::from_millis(100));
        let tenant = TenantId::new();
        let conversation = ConversationId::new();

        buffer
            .enqueue(&tenant, &conversation, "m-0", "first")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        buffer
            .enqueue(&tenant, &conversation, "m-1", "second")
            .unwrap();

        // The first timer (at ~100ms) must not fire a partial turn; the
        // rearmed one (at ~150ms) emits both messages at once.
        let turn = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(turn.combined_text, "first\nsecond");
    }

    #[tokio::test]
    async fn processed_and_failed_transitions() {
        let (tx, mut rx) = mpsc::channel(4);
        let buffer = buffer(tx, Duration::from_millis(30));
        let tenant = TenantId::new();
        let conversation = ConversationId::new();

        buffer.enqueue(&tenant, &conversation, "m-0", "hi").unwrap();
        let turn = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        buffer.mark_processed(&turn.entry_ids).unwrap();
        let entry = buffer.entry(turn.entry_ids[0]).unwrap();
        assert_eq!(entry.status, QueueStatus::Processed);
        assert!(entry.processed_at.is_some());

        // A fresh burst can be failed.
        buffer.enqueue(&tenant, &conversation, "m-1", "hm").unwrap();
        let turn = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        buffer.mark_failed(&turn.entry_ids, "provider down").unwrap();
        let entry = buffer.entry(turn.entry_ids[0]).unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("provider down"));
    }

    #[tokio::test]
    async fn at_most_one_processing_batch_per_conversation() {
        let (tx, mut rx) = mpsc::channel(4);
        let buffer = buffer(tx, Duration::from_millis(30));
        let tenant = TenantId::new();
        let conversation = ConversationId::new();

        buffer.enqueue(&tenant, &conversation, "m-0", "one").unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        // While the first batch is still processing, a new message's flush
        // must not claim a second batch.
        buffer.enqueue(&tenant, &conversation, "m-1", "two").unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );

        // Completing the first batch lets the next flush claim the rest.
        buffer.mark_processed(&first.entry_ids).unwrap();
        buffer.flush(&conversation).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.combined_text, "two");
    }
}
