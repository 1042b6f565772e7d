//! Database queries for messages, chunks and chats

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::types::{
    Chat, ChatType, Chunk, DeleteChatResult, InsertOutcome, Message, PendingStats, Stats,
};

/// Parse a message from a database row
pub fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        chat_id: row.get("chat_id")?,
        message_id: row.get("message_id")?,
        ts: row.get("ts")?,
        sender: row.get("sender")?,
        text: row.get("text")?,
    })
}

/// Parse a chunk from a database row
pub fn chunk_from_row(row: &Row) -> rusqlite::Result<Chunk> {
    let participants_json: String = row.get("participants")?;
    Ok(Chunk {
        chunk_id: row.get("chunk_id")?,
        chat_id: row.get("chat_id")?,
        text: row.get("text")?,
        content_hash: row.get("content_hash")?,
        chat_name: row.get("chat_name")?,
        participants: serde_json::from_str(&participants_json).unwrap_or_default(),
        start_ts: row.get("start_ts")?,
        end_ts: row.get("end_ts")?,
        embedded: row.get::<_, i32>("embedded")? != 0,
        version: row.get("version")?,
    })
}

/// Parse a chat from a database row
pub fn chat_from_row(row: &Row) -> rusqlite::Result<Chat> {
    let type_str: String = row.get("chat_type")?;
    Ok(Chat {
        chat_id: row.get("chat_id")?,
        title: row.get("title")?,
        chat_type: type_str.parse().unwrap_or_default(),
        message_count: row.get("message_count")?,
        included: row.get::<_, i32>("included")? != 0,
    })
}

/// Insert a message. Duplicate `(chat_id, message_id)` is a silent skip.
pub fn insert_message(conn: &Connection, msg: &Message) -> Result<InsertOutcome> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO messages (chat_id, message_id, ts, sender, text)
         VALUES (?, ?, ?, ?, ?)",
        params![msg.chat_id, msg.message_id, msg.ts, msg.sender, msg.text],
    )?;
    Ok(if changed > 0 {
        InsertOutcome::Inserted
    } else {
        InsertOutcome::Duplicate
    })
}

/// List messages of a chat ordered by timestamp ascending.
///
/// `after_ts` is exclusive; ties break on `message_id` so the order is
/// total and chunking stays deterministic.
pub fn list_messages(
    conn: &Connection,
    chat_id: &str,
    after_ts: Option<i64>,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT chat_id, message_id, ts, sender, text FROM messages
         WHERE chat_id = ? AND ts > ?
         ORDER BY ts ASC, message_id ASC",
    )?;
    let rows = stmt.query_map(params![chat_id, after_ts.unwrap_or(i64::MIN)], message_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// List messages of a chat with `from_ts <= ts <= to_ts`
pub fn list_messages_between(
    conn: &Connection,
    chat_id: &str,
    from_ts: i64,
    to_ts: i64,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT chat_id, message_id, ts, sender, text FROM messages
         WHERE chat_id = ? AND ts >= ? AND ts <= ?
         ORDER BY ts ASC, message_id ASC",
    )?;
    let rows = stmt.query_map(params![chat_id, from_ts, to_ts], message_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Insert a chunk. A duplicate `content_hash` is a silent skip.
pub fn insert_chunk(conn: &Connection, chunk: &Chunk) -> Result<InsertOutcome> {
    let participants_json = serde_json::to_string(&chunk.participants)?;
    let changed = conn.execute(
        "INSERT OR IGNORE INTO chunks
         (chunk_id, chat_id, text, content_hash, chat_name, participants,
          start_ts, end_ts, embedded, version)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            chunk.chunk_id,
            chunk.chat_id,
            chunk.text,
            chunk.content_hash,
            chunk.chat_name,
            participants_json,
            chunk.start_ts,
            chunk.end_ts,
            chunk.embedded as i32,
            chunk.version,
        ],
    )?;
    Ok(if changed > 0 {
        InsertOutcome::Inserted
    } else {
        InsertOutcome::Duplicate
    })
}

/// Content hashes of all live chunks in a chat
pub fn known_hashes(conn: &Connection, chat_id: &str) -> Result<std::collections::HashSet<String>> {
    let mut stmt = conn.prepare("SELECT content_hash FROM chunks WHERE chat_id = ?")?;
    let rows = stmt.query_map([chat_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Flip `embedded` on for the given chunk ids
pub fn mark_embedded(conn: &Connection, chunk_ids: &[String]) -> Result<()> {
    let mut stmt = conn.prepare("UPDATE chunks SET embedded = 1 WHERE chunk_id = ?")?;
    for id in chunk_ids {
        stmt.execute([id])?;
    }
    Ok(())
}

/// Chunks with `embedded = false`, oldest window first
pub fn list_pending_chunks(conn: &Connection, limit: Option<usize>) -> Result<Vec<Chunk>> {
    let mut stmt = conn.prepare(
        "SELECT chunk_id, chat_id, text, content_hash, chat_name, participants,
                start_ts, end_ts, embedded, version
         FROM chunks WHERE embedded = 0
         ORDER BY start_ts ASC, chunk_id ASC
         LIMIT ?",
    )?;
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let rows = stmt.query_map([limit], chunk_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// All chunks, oldest window first (reindex walks this in batches)
pub fn list_chunks(conn: &Connection, offset: usize, limit: usize) -> Result<Vec<Chunk>> {
    let mut stmt = conn.prepare(
        "SELECT chunk_id, chat_id, text, content_hash, chat_name, participants,
                start_ts, end_ts, embedded, version
         FROM chunks
         ORDER BY start_ts ASC, chunk_id ASC
         LIMIT ? OFFSET ?",
    )?;
    let rows = stmt.query_map(params![limit as i64, offset as i64], chunk_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// The chat's most recent chunk by window end
pub fn last_chunk(conn: &Connection, chat_id: &str) -> Result<Option<Chunk>> {
    let chunk = conn
        .query_row(
            "SELECT chunk_id, chat_id, text, content_hash, chat_name, participants,
                    start_ts, end_ts, embedded, version
             FROM chunks WHERE chat_id = ?
             ORDER BY end_ts DESC, start_ts DESC LIMIT 1",
            [chat_id],
            chunk_from_row,
        )
        .optional()?;
    Ok(chunk)
}

/// End of the chat's chunked window, if any
pub fn last_chunk_end_ts(conn: &Connection, chat_id: &str) -> Result<Option<i64>> {
    let ts = conn
        .query_row(
            "SELECT MAX(end_ts) FROM chunks WHERE chat_id = ?",
            [chat_id],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()?
        .flatten();
    Ok(ts)
}

/// Delete a chunk by id
pub fn delete_chunk(conn: &Connection, chunk_id: &str) -> Result<()> {
    conn.execute("DELETE FROM chunks WHERE chunk_id = ?", [chunk_id])?;
    Ok(())
}

/// Included chats whose messages extend past their chunked window
pub fn chats_with_new_messages(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT c.chat_id FROM chats c
         JOIN messages m ON m.chat_id = c.chat_id
         WHERE c.included = 1
         GROUP BY c.chat_id
         HAVING MAX(m.ts) > COALESCE(
             (SELECT MAX(k.end_ts) FROM chunks k WHERE k.chat_id = c.chat_id),
             -9223372036854775808)
         ORDER BY c.chat_id",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Insert or refresh a chat row, preserving the inclusion flag
pub fn upsert_chat(
    conn: &Connection,
    chat_id: &str,
    title: Option<&str>,
    chat_type: Option<ChatType>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO chats (chat_id, title, chat_type, message_count, included, updated_at)
         VALUES (?, COALESCE(?, ''), COALESCE(?, 'one_to_one'), 0, 1, datetime('now'))
         ON CONFLICT(chat_id) DO UPDATE SET
             title = COALESCE(excluded.title, chats.title),
             chat_type = COALESCE(?, chats.chat_type),
             updated_at = datetime('now')",
        params![
            chat_id,
            title,
            chat_type.map(|t| t.to_string()),
            chat_type.map(|t| t.to_string()),
        ],
    )?;
    Ok(())
}

/// Recompute a chat's message count from the messages table
pub fn refresh_chat_message_count(conn: &Connection, chat_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE chats SET message_count =
             (SELECT COUNT(*) FROM messages WHERE chat_id = ?)
         WHERE chat_id = ?",
        params![chat_id, chat_id],
    )?;
    Ok(())
}

/// List all chats, most recently updated first
pub fn list_chats(conn: &Connection) -> Result<Vec<Chat>> {
    let mut stmt = conn.prepare(
        "SELECT chat_id, title, chat_type, message_count, included
         FROM chats ORDER BY updated_at DESC, chat_id ASC",
    )?;
    let rows = stmt.query_map([], chat_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Fetch one chat
pub fn get_chat(conn: &Connection, chat_id: &str) -> Result<Option<Chat>> {
    let chat = conn
        .query_row(
            "SELECT chat_id, title, chat_type, message_count, included
             FROM chats WHERE chat_id = ?",
            [chat_id],
            chat_from_row,
        )
        .optional()?;
    Ok(chat)
}

/// Toggle a chat's inclusion in retrieval. Idempotent.
pub fn set_included(conn: &Connection, chat_id: &str, included: bool) -> Result<()> {
    let changed = conn.execute(
        "UPDATE chats SET included = ?, updated_at = datetime('now') WHERE chat_id = ?",
        params![included as i32, chat_id],
    )?;
    if changed == 0 {
        return Err(crate::error::LifeQueryError::NotFound(format!(
            "chat {}",
            chat_id
        )));
    }
    Ok(())
}

/// Chat ids with `included = true`
pub fn included_chat_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT chat_id FROM chats WHERE included = 1")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Delete a chat with its messages and chunks. Returns the deleted chunk
/// ids so the caller can evict the corresponding vectors.
pub fn delete_chat(conn: &Connection, chat_id: &str) -> Result<DeleteChatResult> {
    let mut stmt = conn.prepare("SELECT chunk_id FROM chunks WHERE chat_id = ?")?;
    let chunk_ids: Vec<String> = stmt
        .query_map([chat_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let messages_deleted = conn.execute("DELETE FROM messages WHERE chat_id = ?", [chat_id])?;
    let chunks_deleted = conn.execute("DELETE FROM chunks WHERE chat_id = ?", [chat_id])?;
    conn.execute("DELETE FROM chats WHERE chat_id = ?", [chat_id])?;

    Ok(DeleteChatResult {
        messages_deleted: messages_deleted as i64,
        chunks_deleted: chunks_deleted as i64,
        chunk_ids,
    })
}

/// Corpus statistics
pub fn stats(conn: &Connection) -> Result<Stats> {
    let message_count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
    let chunk_count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
    let embedded_count: i64 =
        conn.query_row("SELECT COUNT(*) FROM chunks WHERE embedded = 1", [], |r| {
            r.get(0)
        })?;
    let chat_count: i64 = conn.query_row("SELECT COUNT(*) FROM chats", [], |r| r.get(0))?;
    let included_chat_count: i64 =
        conn.query_row("SELECT COUNT(*) FROM chats WHERE included = 1", [], |r| {
            r.get(0)
        })?;
    let last_sync: Option<String> = conn
        .query_row(
            "SELECT MAX(finished_at) FROM sync_log
             WHERE operation = 'sync' AND status = 'success'",
            [],
            |r| r.get(0),
        )
        .optional()?
        .flatten();

    Ok(Stats {
        message_count,
        chunk_count,
        embedded_count,
        chat_count,
        included_chat_count,
        last_sync,
    })
}

/// Work waiting for the next process run
pub fn pending_stats(conn: &Connection) -> Result<PendingStats> {
    let pending_chunks: i64 =
        conn.query_row("SELECT COUNT(*) FROM chunks WHERE embedded = 0", [], |r| {
            r.get(0)
        })?;
    let chats_with_new = chats_with_new_messages(conn)?.len() as i64;

    Ok(PendingStats {
        pending_chunks,
        chats_with_new_messages: chats_with_new,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn test_message(chat_id: &str, message_id: i64, ts: i64, text: &str) -> Message {
        Message {
            chat_id: chat_id.to_string(),
            message_id,
            ts,
            sender: Some("alice".to_string()),
            text: text.to_string(),
        }
    }

    fn test_chunk(chat_id: &str, hash: &str, start_ts: i64, end_ts: i64) -> Chunk {
        Chunk {
            chunk_id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            text: "some text".to_string(),
            content_hash: hash.to_string(),
            chat_name: "Test Chat".to_string(),
            participants: vec!["alice".to_string()],
            start_ts,
            end_ts,
            embedded: false,
            version: 1,
        }
    }

    #[test]
    fn test_insert_message_idempotent() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let msg = test_message("a", 1, 100, "hi");
                assert_eq!(insert_message(conn, &msg)?, InsertOutcome::Inserted);
                assert_eq!(insert_message(conn, &msg)?, InsertOutcome::Duplicate);

                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
                assert_eq!(count, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_list_messages_ordering() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                insert_message(conn, &test_message("a", 2, 200, "second"))?;
                insert_message(conn, &test_message("a", 1, 100, "first"))?;
                insert_message(conn, &test_message("b", 3, 50, "other chat"))?;

                let messages = list_messages(conn, "a", None)?;
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].text, "first");
                assert_eq!(messages[1].text, "second");

                let after = list_messages(conn, "a", Some(100))?;
                assert_eq!(after.len(), 1);
                assert_eq!(after[0].text, "second");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_insert_chunk_hash_dedup() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let c1 = test_chunk("a", "hash1", 0, 10);
                let c2 = test_chunk("a", "hash1", 0, 10);
                assert_eq!(insert_chunk(conn, &c1)?, InsertOutcome::Inserted);
                assert_eq!(insert_chunk(conn, &c2)?, InsertOutcome::Duplicate);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_pending_and_mark_embedded() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let c1 = test_chunk("a", "h1", 0, 10);
                let c2 = test_chunk("a", "h2", 20, 30);
                insert_chunk(conn, &c1)?;
                insert_chunk(conn, &c2)?;

                let pending = list_pending_chunks(conn, None)?;
                assert_eq!(pending.len(), 2);

                mark_embedded(conn, &[c1.chunk_id.clone()])?;
                let pending = list_pending_chunks(conn, None)?;
                assert_eq!(pending.len(), 1);
                assert_eq!(pending[0].chunk_id, c2.chunk_id);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_chats_with_new_messages() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                upsert_chat(conn, "a", Some("A"), None)?;
                upsert_chat(conn, "b", Some("B"), None)?;
                insert_message(conn, &test_message("a", 1, 0, "hi"))?;
                insert_message(conn, &test_message("b", 1, 100, "yo"))?;

                // Chat a fully chunked, chat b not chunked at all
                insert_chunk(conn, &test_chunk("a", "h1", 0, 0))?;

                let pending = chats_with_new_messages(conn)?;
                assert_eq!(pending, vec!["b".to_string()]);

                // Excluded chats never show up
                set_included(conn, "b", false)?;
                assert!(chats_with_new_messages(conn)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_upsert_chat_preserves_inclusion() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                upsert_chat(conn, "a", Some("A"), Some(ChatType::Group))?;
                set_included(conn, "a", false)?;
                upsert_chat(conn, "a", Some("A renamed"), None)?;

                let chat = get_chat(conn, "a")?.unwrap();
                assert_eq!(chat.title, "A renamed");
                assert_eq!(chat.chat_type, ChatType::Group);
                assert!(!chat.included);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_delete_chat_cascade() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                upsert_chat(conn, "a", Some("A"), None)?;
                insert_message(conn, &test_message("a", 1, 0, "hi"))?;
                insert_message(conn, &test_message("a", 2, 60, "there"))?;
                let chunk = test_chunk("a", "h1", 0, 60);
                insert_chunk(conn, &chunk)?;

                let result = delete_chat(conn, "a")?;
                assert_eq!(result.messages_deleted, 2);
                assert_eq!(result.chunks_deleted, 1);
                assert_eq!(result.chunk_ids, vec![chunk.chunk_id]);
                assert!(get_chat(conn, "a")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_stats() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                upsert_chat(conn, "a", Some("A"), None)?;
                insert_message(conn, &test_message("a", 1, 0, "hi"))?;
                let mut chunk = test_chunk("a", "h1", 0, 0);
                chunk.embedded = true;
                insert_chunk(conn, &chunk)?;

                let s = stats(conn)?;
                assert_eq!(s.message_count, 1);
                assert_eq!(s.chunk_count, 1);
                assert_eq!(s.embedded_count, 1);
                assert_eq!(s.chat_count, 1);
                assert_eq!(s.included_chat_count, 1);
                assert!(s.last_sync.is_none());
                Ok(())
            })
            .unwrap();
    }
}
