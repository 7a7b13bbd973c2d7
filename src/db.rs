//! The store: conversations, messages, prefix-shared LLM request bodies,
//! and models, behind one write connection and a small round-robin pool
//! of read-only connections.

pub mod migrations;
pub mod schema;

pub use schema::{
    Conversation, ConversationState, ErrorKind, GitInfoContent, ImageData, LlmRequestRecord,
    Message, MessageContent, MessageType, ModelRecord, ToolContent, UsageData, UserContent,
};

use crate::error::StorageError;
use chrono::Utc;
use rand::Rng;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub type DbResult<T> = Result<T, StorageError>;

/// A shared prefix must save at least this many bytes before we bother
/// storing only the suffix.
const PREFIX_SHARE_MIN_SAVINGS: usize = 100;

const DEFAULT_READ_POOL_SIZE: usize = 4;

/// Sqlite-backed store. All methods are synchronous; callers invoke them
/// directly from async contexts (each call is a small, local operation,
/// matching this crate's existing convention of not spawning blocking
/// tasks for sqlite access).
///
/// Cheap to clone: the connections live behind an `Arc`, so handing a
/// `Database` to every conversation task just bumps a refcount.
#[derive(Clone)]
pub struct Database {
    inner: std::sync::Arc<DatabaseInner>,
}

struct DatabaseInner {
    write: Mutex<Connection>,
    read_pool: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        migrations::check_no_duplicate_versions()?;

        let path = path.as_ref();
        let write = Connection::open(path)?;
        write.pragma_update(None, "journal_mode", "WAL")?;
        write.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&write)?;

        let mut read_pool = Vec::with_capacity(DEFAULT_READ_POOL_SIZE);
        for _ in 0..DEFAULT_READ_POOL_SIZE {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
            )?;
            conn.pragma_update(None, "query_only", "ON")?;
            read_pool.push(Mutex::new(conn));
        }

        Ok(Self {
            inner: std::sync::Arc::new(DatabaseInner {
                write: Mutex::new(write),
                read_pool,
                next_reader: AtomicUsize::new(0),
            }),
        })
    }

    /// An in-memory database backed by a shared-cache URI, so the
    /// read-only pool connects to the same database as the writer.
    pub fn open_in_memory() -> DbResult<Self> {
        migrations::check_no_duplicate_versions()?;

        let uri = format!("file:shelley-{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
        let write = Connection::open_with_flags(
            &uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        write.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&write)?;

        let mut read_pool = Vec::with_capacity(DEFAULT_READ_POOL_SIZE);
        for _ in 0..DEFAULT_READ_POOL_SIZE {
            let conn = Connection::open_with_flags(
                &uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI,
            )?;
            conn.pragma_update(None, "query_only", "ON")?;
            read_pool.push(Mutex::new(conn));
        }

        Ok(Self {
            inner: std::sync::Arc::new(DatabaseInner {
                write: Mutex::new(write),
                read_pool,
                next_reader: AtomicUsize::new(0),
            }),
        })
    }

    fn writer(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.inner.write.lock().expect("db write connection poisoned")
    }

    fn reader(&self) -> std::sync::MutexGuard<'_, Connection> {
        if self.inner.read_pool.is_empty() {
            return self.writer();
        }
        let idx = self.inner.next_reader.fetch_add(1, Ordering::Relaxed) % self.inner.read_pool.len();
        self.inner.read_pool[idx].lock().expect("db read connection poisoned")
    }

    // ---- conversations -----------------------------------------------

    /// On a slug conflict among top-level (no-parent) siblings, retries
    /// with `base-1`, `base-2`, ... up to 100 attempts, same as
    /// `get_or_create_subagent` below.
    pub fn create_conversation(
        &self,
        slug: Option<&str>,
        user_initiated: bool,
        cwd: &str,
        model: Option<&str>,
    ) -> DbResult<Conversation> {
        let Some(base_slug) = slug else {
            return self.insert_conversation(generate_conversation_id(), None, None, cwd, user_initiated, model);
        };

        let mut candidate = base_slug.to_string();
        for attempt in 0..100 {
            if attempt > 0 {
                candidate = format!("{base_slug}-{attempt}");
            }
            match self.insert_conversation(
                generate_conversation_id(),
                Some(&candidate),
                None,
                cwd,
                user_initiated,
                model,
            ) {
                Ok(conv) => return Ok(conv),
                Err(StorageError::SlugConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::SlugConflict(base_slug.to_string()))
    }

    /// Resolve-or-create for the subagent orchestrator (C6): if a sibling
    /// with `base_slug` already exists under `parent_id`, returns it
    /// unchanged (`renamed = false`). Otherwise creates one, retrying with
    /// `base-1`, `base-2`, ... on conflict, up to 100 attempts.
    pub fn get_or_create_subagent(
        &self,
        base_slug: &str,
        parent_id: &str,
        cwd: &str,
        model: Option<&str>,
    ) -> DbResult<(Conversation, bool)> {
        if let Some(existing) = self.get_conversation_by_slug_and_parent(base_slug, Some(parent_id))? {
            return Ok((existing, false));
        }

        let mut candidate = base_slug.to_string();
        for attempt in 0..100 {
            if attempt > 0 {
                candidate = format!("{base_slug}-{attempt}");
            }
            match self.insert_conversation(
                generate_conversation_id(),
                Some(&candidate),
                Some(parent_id),
                cwd,
                false,
                model,
            ) {
                Ok(conv) => return Ok((conv, attempt > 0)),
                Err(StorageError::SlugConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::SlugConflict(base_slug.to_string()))
    }

    fn insert_conversation(
        &self,
        id: String,
        slug: Option<&str>,
        parent_id: Option<&str>,
        cwd: &str,
        user_initiated: bool,
        model: Option<&str>,
    ) -> DbResult<Conversation> {
        let conn = self.writer();
        let now = Utc::now();
        let result = conn.execute(
            "INSERT INTO conversations
                (id, slug, parent_conversation_id, cwd, model, pinned, archived,
                 user_initiated, state, state_data, state_updated_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, 'idle', NULL, ?7, ?7, ?7)",
            rusqlite::params![id, slug, parent_id, cwd, model, user_initiated, now.to_rfc3339()],
        );

        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StorageError::SlugConflict(slug.unwrap_or_default().to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        drop(conn);
        self.get_conversation(&id)?.ok_or(StorageError::NotFound)
    }

    pub fn get_conversation(&self, id: &str) -> DbResult<Option<Conversation>> {
        let conn = self.reader();
        conn.query_row(
            "SELECT * FROM conversations WHERE id = ?1",
            [id],
            row_to_conversation,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_conversation_by_slug(&self, slug: &str) -> DbResult<Option<Conversation>> {
        self.get_conversation_by_slug_and_parent(slug, None)
    }

    pub fn get_conversation_by_slug_and_parent(
        &self,
        slug: &str,
        parent_id: Option<&str>,
    ) -> DbResult<Option<Conversation>> {
        let conn = self.reader();
        let sql = "SELECT * FROM conversations WHERE slug = ?1 AND parent_conversation_id IS ?2";
        conn.query_row(sql, rusqlite::params![slug, parent_id], row_to_conversation)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_conversations(&self, include_archived: bool) -> DbResult<Vec<Conversation>> {
        let conn = self.reader();
        let sql = if include_archived {
            "SELECT * FROM conversations WHERE parent_conversation_id IS NULL
             ORDER BY pinned DESC, updated_at DESC"
        } else {
            "SELECT * FROM conversations WHERE parent_conversation_id IS NULL AND archived = 0
             ORDER BY pinned DESC, updated_at DESC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_conversation)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    /// All conversations (top-level and subagents) left in `Working` state,
    /// for the startup recovery scan: any one of these was mid-turn when
    /// the process last stopped.
    pub fn list_working_conversations(&self) -> DbResult<Vec<Conversation>> {
        let conn = self.reader();
        let mut stmt = conn.prepare("SELECT * FROM conversations WHERE state = 'working'")?;
        let rows = stmt.query_map([], row_to_conversation)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    pub fn list_archived_conversations(&self) -> DbResult<Vec<Conversation>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT * FROM conversations WHERE parent_conversation_id IS NULL AND archived = 1
             ORDER BY pinned DESC, updated_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_conversation)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    /// Ordered `created_at ASC`.
    pub fn get_subagents(&self, parent_id: &str) -> DbResult<Vec<Conversation>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT * FROM conversations WHERE parent_conversation_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([parent_id], row_to_conversation)?;
        rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
    }

    pub fn update_conversation_state(
        &self,
        id: &str,
        state: ConversationState,
        state_data: Option<&Value>,
    ) -> DbResult<()> {
        let conn = self.writer();
        let now = Utc::now().to_rfc3339();
        let state_data_json = state_data.map(ToString::to_string);
        conn.execute(
            "UPDATE conversations SET state = ?1, state_data = ?2, state_updated_at = ?3, updated_at = ?3
             WHERE id = ?4",
            rusqlite::params![state.to_string(), state_data_json, now, id],
        )?;
        Ok(())
    }

    pub fn set_pinned(&self, id: &str, pinned: bool) -> DbResult<()> {
        self.touch_bool_field(id, "pinned", pinned)
    }

    pub fn archive_conversation(&self, id: &str) -> DbResult<()> {
        self.touch_bool_field(id, "archived", true)
    }

    pub fn unarchive_conversation(&self, id: &str) -> DbResult<()> {
        self.touch_bool_field(id, "archived", false)
    }

    fn touch_bool_field(&self, id: &str, field: &str, value: bool) -> DbResult<()> {
        let conn = self.writer();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            &format!("UPDATE conversations SET {field} = ?1, updated_at = ?2 WHERE id = ?3"),
            rusqlite::params![value, now, id],
        )?;
        Ok(())
    }

    pub fn rename_conversation(&self, id: &str, new_slug: &str) -> DbResult<()> {
        let existing = self.get_conversation(id)?.ok_or(StorageError::NotFound)?;
        if let Some(other) =
            self.get_conversation_by_slug_and_parent(new_slug, existing.parent_conversation_id.as_deref())?
        {
            if other.id != id {
                return Err(StorageError::SlugConflict(new_slug.to_string()));
            }
        }
        let conn = self.writer();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE conversations SET slug = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![new_slug, now, id],
        )?;
        Ok(())
    }

    pub fn set_cwd(&self, id: &str, cwd: &str) -> DbResult<()> {
        let conn = self.writer();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE conversations SET cwd = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![cwd, now, id],
        )?;
        Ok(())
    }

    /// Sets the model only if the conversation does not already have one,
    /// so the first turn's resolved model sticks for the rest of the
    /// conversation's life.
    pub fn backfill_model(&self, id: &str, model: &str) -> DbResult<()> {
        let conn = self.writer();
        conn.execute(
            "UPDATE conversations SET model = ?1 WHERE id = ?2 AND model IS NULL",
            rusqlite::params![model, id],
        )?;
        Ok(())
    }

    pub fn delete_conversation(&self, id: &str) -> DbResult<()> {
        let conn = self.writer();
        conn.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
        Ok(())
    }

    // ---- messages ------------------------------------------------------

    /// Appends a message, computing the next dense `sequence_id` and
    /// touching `conversations.updated_at`, all within one transaction.
    pub fn append_message(
        &self,
        id: &str,
        conversation_id: &str,
        content: &MessageContent,
        display_data: Option<&Value>,
        usage_data: Option<UsageData>,
    ) -> DbResult<Message> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let next_sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |r| r.get(0),
        )?;

        let content_json = serde_json::to_string(content)
            .map_err(|e| StorageError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(e))))?;
        let usage_json = usage_data
            .map(|u| serde_json::to_string(&u))
            .transpose()
            .map_err(|e| StorageError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(e))))?;
        let display_json = display_data.map(ToString::to_string);
        let excluded = content.default_excluded_from_context();

        tx.execute(
            "INSERT INTO messages
                (id, conversation_id, sequence_id, message_type, content, display_data,
                 usage_data, excluded_from_context, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                id,
                conversation_id,
                next_sequence,
                content.message_type().to_string(),
                content_json,
                display_json,
                usage_json,
                excluded,
                now.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now.to_rfc3339(), conversation_id],
        )?;
        tx.commit()?;

        Ok(Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sequence_id: next_sequence,
            content: content.clone(),
            display_data: display_data.cloned(),
            usage_data,
            excluded_from_context: excluded,
            created_at: now,
        })
    }

    pub fn message_exists(&self, id: &str) -> DbResult<bool> {
        let conn = self.reader();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages WHERE id = ?1", [id], |r| r.get(0))?;
        Ok(count > 0)
    }

    pub fn list_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY sequence_id ASC",
        )?;
        let rows = stmt.query_map([conversation_id], row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    /// Equals `list_messages` filtered by `¬excluded_from_context`.
    pub fn list_messages_for_context(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE conversation_id = ?1 AND excluded_from_context = 0
             ORDER BY sequence_id ASC",
        )?;
        let rows = stmt.query_map([conversation_id], row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn list_messages_after(&self, conversation_id: &str, after_sequence_id: i64) -> DbResult<Vec<Message>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE conversation_id = ?1 AND sequence_id > ?2
             ORDER BY sequence_id ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![conversation_id, after_sequence_id], row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn get_message(&self, id: &str) -> DbResult<Option<Message>> {
        let conn = self.reader();
        conn.query_row("SELECT * FROM messages WHERE id = ?1", [id], row_to_message)
            .optional()
            .map_err(Into::into)
    }

    pub fn get_last_sequence_id(&self, conversation_id: &str) -> DbResult<i64> {
        let conn = self.reader();
        conn.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |r| r.get(0),
        )
        .map_err(Into::into)
    }

    pub fn update_message_display_data(&self, id: &str, display_data: &Value) -> DbResult<()> {
        let conn = self.writer();
        conn.execute(
            "UPDATE messages SET display_data = ?1 WHERE id = ?2",
            rusqlite::params![display_data.to_string(), id],
        )?;
        Ok(())
    }

    // ---- LLM requests (prefix sharing) ---------------------------------

    /// Inserts a new request body, sharing a prefix with the most recent
    /// prior request for `conversation_id` when that saves at least
    /// [`PREFIX_SHARE_MIN_SAVINGS`] bytes.
    pub fn insert_llm_request(
        &self,
        id: &str,
        conversation_id: Option<&str>,
        request_body: &str,
    ) -> DbResult<LlmRequestRecord> {
        let prior = match conversation_id {
            Some(cid) => self.most_recent_llm_request(cid)?,
            None => None,
        };

        let (stored_body, prefix_request_id, prefix_length) = match prior {
            Some(prior) => {
                let prior_full = self.get_full_llm_request_body(&prior.id)?;
                let shared = common_prefix_len(prior_full.as_bytes(), request_body.as_bytes());
                if shared >= PREFIX_SHARE_MIN_SAVINGS {
                    (request_body[shared..].to_string(), Some(prior.id), shared as i64)
                } else {
                    (request_body.to_string(), None, 0)
                }
            }
            None => (request_body.to_string(), None, 0),
        };

        let conn = self.writer();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO llm_requests
                (id, conversation_id, request_body, response_body, prefix_request_id, prefix_length, created_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6)",
            rusqlite::params![id, conversation_id, stored_body, prefix_request_id, prefix_length, now.to_rfc3339()],
        )?;

        Ok(LlmRequestRecord {
            id: id.to_string(),
            conversation_id: conversation_id.map(String::from),
            request_body: stored_body,
            response_body: None,
            prefix_request_id,
            prefix_length,
            created_at: now,
        })
    }

    pub fn record_llm_response(&self, id: &str, response_body: &str) -> DbResult<()> {
        let conn = self.writer();
        conn.execute(
            "UPDATE llm_requests SET response_body = ?1 WHERE id = ?2",
            rusqlite::params![response_body, id],
        )?;
        Ok(())
    }

    fn most_recent_llm_request(&self, conversation_id: &str) -> DbResult<Option<LlmRequestRecord>> {
        let conn = self.reader();
        conn.query_row(
            "SELECT * FROM llm_requests WHERE conversation_id = ?1 ORDER BY created_at DESC LIMIT 1",
            [conversation_id],
            row_to_llm_request,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_llm_request(&self, id: &str) -> DbResult<Option<LlmRequestRecord>> {
        let conn = self.reader();
        conn.query_row("SELECT * FROM llm_requests WHERE id = ?1", [id], row_to_llm_request)
            .optional()
            .map_err(Into::into)
    }

    /// Reconstructs the full request body by walking the prefix chain.
    /// The chain terminates at a request with a null `prefix_request_id`.
    pub fn get_full_llm_request_body(&self, id: &str) -> DbResult<String> {
        let record = self.get_llm_request(id)?.ok_or(StorageError::NotFound)?;
        match record.prefix_request_id {
            None => Ok(record.request_body),
            Some(prefix_id) => {
                let prefix_full = self.get_full_llm_request_body(&prefix_id)?;
                let prefix_len = record.prefix_length as usize;
                let mut full = prefix_full.get(..prefix_len).unwrap_or(&prefix_full).to_string();
                full.push_str(&record.request_body);
                Ok(full)
            }
        }
    }

    // ---- models ---------------------------------------------------------

    pub fn upsert_model(&self, record: &ModelRecord) -> DbResult<()> {
        let conn = self.writer();
        conn.execute(
            "INSERT INTO models (id, display_name, provider, capabilities, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                provider = excluded.provider,
                capabilities = excluded.capabilities",
            rusqlite::params![
                record.id,
                record.display_name,
                record.provider,
                record.capabilities.to_string(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_model(&self, id: &str) -> DbResult<Option<ModelRecord>> {
        let conn = self.reader();
        conn.query_row("SELECT * FROM models WHERE id = ?1", [id], row_to_model)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_models(&self) -> DbResult<Vec<ModelRecord>> {
        let conn = self.reader();
        let mut stmt = conn.prepare("SELECT * FROM models ORDER BY id ASC")?;
        let rows = stmt.query_map([], row_to_model)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

fn generate_conversation_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect();
    format!("c{suffix}")
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let state_str: String = row.get("state")?;
    let state_data_str: Option<String> = row.get("state_data")?;
    Ok(Conversation {
        id: row.get("id")?,
        slug: row.get("slug")?,
        parent_conversation_id: row.get("parent_conversation_id")?,
        cwd: row.get("cwd")?,
        model: row.get("model")?,
        pinned: row.get("pinned")?,
        archived: row.get("archived")?,
        user_initiated: row.get("user_initiated")?,
        state: state_str.parse().unwrap_or(ConversationState::Idle),
        state_data: state_data_str.and_then(|s| serde_json::from_str(&s).ok()),
        state_updated_at: parse_timestamp(row, "state_updated_at")?,
        created_at: parse_timestamp(row, "created_at")?,
        updated_at: parse_timestamp(row, "updated_at")?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let content_str: String = row.get("content")?;
    let content: MessageContent = serde_json::from_str(&content_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let usage_str: Option<String> = row.get("usage_data")?;
    let usage_data = usage_str.and_then(|s| serde_json::from_str::<UsageData>(&s).ok());
    let display_str: Option<String> = row.get("display_data")?;
    let display_data = display_str.and_then(|s| serde_json::from_str(&s).ok());

    Ok(Message {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        sequence_id: row.get("sequence_id")?,
        content,
        display_data,
        usage_data,
        excluded_from_context: row.get("excluded_from_context")?,
        created_at: parse_timestamp(row, "created_at")?,
    })
}

fn row_to_llm_request(row: &Row<'_>) -> rusqlite::Result<LlmRequestRecord> {
    Ok(LlmRequestRecord {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        request_body: row.get("request_body")?,
        response_body: row.get("response_body")?,
        prefix_request_id: row.get("prefix_request_id")?,
        prefix_length: row.get("prefix_length")?,
        created_at: parse_timestamp(row, "created_at")?,
    })
}

fn row_to_model(row: &Row<'_>) -> rusqlite::Result<ModelRecord> {
    let capabilities_str: String = row.get("capabilities")?;
    Ok(ModelRecord {
        id: row.get("id")?,
        display_name: row.get("display_name")?,
        provider: row.get("provider")?,
        capabilities: serde_json::from_str(&capabilities_str).unwrap_or(Value::Null),
        created_at: parse_timestamp(row, "created_at")?,
    })
}

fn parse_timestamp(row: &Row<'_>, col: &str) -> rusqlite::Result<chrono::DateTime<Utc>> {
    let s: String = row.get(col)?;
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}
