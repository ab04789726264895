use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

use crate::domain::{
    Actor, Credits, HistoryEntry, RequestId, RequestState, ServiceRequest, TransactionKind,
    TransactionRecord, UserBalance, UserId,
};

use super::MIGRATION_001_INITIAL;

const REQUEST_COLUMNS: &str = "id, requester_id, provider_id, service_type, amount, description, state, version, created_at, updated_at";
const TRANSACTION_COLUMNS: &str =
    "id, sequence, request_id, from_user_id, to_user_id, amount, kind, operation_key, recorded_at";

/// A row was changed by someone else between read and write.
#[derive(Debug, thiserror::Error)]
#[error("{entity} {id} was modified concurrently")]
pub struct VersionConflict {
    pub entity: &'static str,
    pub id: String,
}

/// A command whose effects have been committed, keyed by its idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedCommand {
    pub idempotency_key: String,
    pub command: String,
    pub request_id: RequestId,
    pub recorded_at: DateTime<Utc>,
}

/// Repository for persisting and querying balances, requests and transaction records.
///
/// Methods suffixed with `_in` run on a caller-supplied connection, which is
/// how the engine groups several writes into one database transaction.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

/// Timestamps are stored in a fixed-width format so they sort lexically.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}

fn parse_id(s: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid {}: {}", what, s))
}

fn parse_state(s: &str) -> Result<RequestState> {
    RequestState::from_str(s).ok_or_else(|| anyhow::anyhow!("Invalid request state: {}", s))
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database at the given URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid database URL")?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Initialize a new database (connect + migrate).
    pub async fn init(database_url: &str) -> Result<Self> {
        let repo = Self::connect(database_url).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    /// Start a database transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .context("Failed to begin transaction")
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================
    // Balance operations
    // ========================

    /// Get the stored balance for a user, if it was ever written.
    pub async fn get_balance(&self, user_id: UserId) -> Result<Option<UserBalance>> {
        let mut conn = self.pool.acquire().await?;
        Self::balance_in(&mut conn, user_id).await
    }

    pub async fn balance_in(
        conn: &mut SqliteConnection,
        user_id: UserId,
    ) -> Result<Option<UserBalance>> {
        let row = sqlx::query(
            "SELECT user_id, available, reserved, version, updated_at FROM balances WHERE user_id = ?",
        )
        .bind(user_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch balance")?;

        row.as_ref().map(Self::row_to_balance).transpose()
    }

    /// List all stored balances.
    pub async fn list_balances(&self) -> Result<Vec<UserBalance>> {
        let rows = sqlx::query(
            "SELECT user_id, available, reserved, version, updated_at FROM balances ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list balances")?;

        rows.iter().map(Self::row_to_balance).collect()
    }

    /// Write a balance, checking that nobody else wrote it since it was read.
    /// On success the balance's version is bumped to the stored value.
    pub async fn save_balance_in(
        conn: &mut SqliteConnection,
        balance: &mut UserBalance,
    ) -> Result<()> {
        let updated_at = Utc::now();
        let result = if balance.is_new() {
            sqlx::query(
                r#"
                INSERT INTO balances (user_id, available, reserved, version, updated_at)
                VALUES (?, ?, ?, 1, ?)
                ON CONFLICT (user_id) DO NOTHING
                "#,
            )
            .bind(balance.user_id.to_string())
            .bind(balance.available)
            .bind(balance.reserved)
            .bind(format_timestamp(&updated_at))
            .execute(&mut *conn)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE balances
                SET available = ?, reserved = ?, version = version + 1, updated_at = ?
                WHERE user_id = ? AND version = ?
                "#,
            )
            .bind(balance.available)
            .bind(balance.reserved)
            .bind(format_timestamp(&updated_at))
            .bind(balance.user_id.to_string())
            .bind(balance.version)
            .execute(&mut *conn)
            .await
        }
        .context("Failed to save balance")?;

        if result.rows_affected() == 0 {
            return Err(VersionConflict {
                entity: "balance",
                id: balance.user_id.to_string(),
            }
            .into());
        }

        balance.version += 1;
        balance.updated_at = updated_at;
        Ok(())
    }

    fn row_to_balance(row: &SqliteRow) -> Result<UserBalance> {
        let user_id: String = row.get("user_id");
        let updated_at: String = row.get("updated_at");

        Ok(UserBalance {
            user_id: parse_id(&user_id, "user ID")?,
            available: row.get("available"),
            reserved: row.get("reserved"),
            version: row.get("version"),
            updated_at: parse_timestamp(&updated_at)?,
        })
    }

    // ========================
    // Request operations
    // ========================

    /// Get a request by ID, including its history.
    pub async fn get_request(&self, id: RequestId) -> Result<Option<ServiceRequest>> {
        let mut conn = self.pool.acquire().await?;
        Self::request_in(&mut conn, id).await
    }

    pub async fn request_in(
        conn: &mut SqliteConnection,
        id: RequestId,
    ) -> Result<Option<ServiceRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM requests WHERE id = ?",
            REQUEST_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch request")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut request = Self::row_to_request(&row)?;
        request.history = Self::history_in(conn, id).await?;
        Ok(Some(request))
    }

    /// List requests, optionally only those where `user_id` is a party.
    pub async fn list_requests(&self, user_id: Option<UserId>) -> Result<Vec<ServiceRequest>> {
        let mut conn = self.pool.acquire().await?;

        let rows = match user_id {
            Some(user_id) => {
                let id = user_id.to_string();
                sqlx::query(&format!(
                    "SELECT {} FROM requests WHERE requester_id = ? OR provider_id = ? ORDER BY created_at",
                    REQUEST_COLUMNS
                ))
                .bind(&id)
                .bind(&id)
                .fetch_all(&mut *conn)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM requests ORDER BY created_at",
                    REQUEST_COLUMNS
                ))
                .fetch_all(&mut *conn)
                .await
            }
        }
        .context("Failed to list requests")?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut request = Self::row_to_request(row)?;
            request.history = Self::history_in(&mut conn, request.id).await?;
            requests.push(request);
        }
        Ok(requests)
    }

    /// Requests in one of `states` that have not changed since `before`.
    pub async fn list_stale_requests(
        &self,
        states: &[RequestState],
        before: DateTime<Utc>,
    ) -> Result<Vec<ServiceRequest>> {
        let placeholders = vec!["?"; states.len()].join(", ");
        let query = format!(
            "SELECT {} FROM requests WHERE state IN ({}) AND updated_at < ? ORDER BY updated_at",
            REQUEST_COLUMNS, placeholders
        );

        let mut sql_query = sqlx::query(&query);
        for state in states {
            sql_query = sql_query.bind(state.as_str());
        }

        let rows = sql_query
            .bind(format_timestamp(&before))
            .fetch_all(&self.pool)
            .await
            .context("Failed to list stale requests")?;

        rows.iter().map(Self::row_to_request).collect()
    }

    /// Number of in-flight requests per assigned provider.
    pub async fn in_flight_counts(&self) -> Result<HashMap<UserId, u32>> {
        let rows = sqlx::query(
            r#"
            SELECT provider_id, COUNT(*) as in_flight
            FROM requests
            WHERE provider_id IS NOT NULL AND state IN ('matched', 'accepted', 'in_progress')
            GROUP BY provider_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count in-flight requests")?;

        let mut counts = HashMap::new();
        for row in rows {
            let provider: String = row.get("provider_id");
            let in_flight: i64 = row.get("in_flight");
            counts.insert(parse_id(&provider, "provider ID")?, in_flight as u32);
        }
        Ok(counts)
    }

    /// Sum of request amounts currently holding a reservation, per requester.
    pub async fn reserved_by_requester(&self) -> Result<HashMap<UserId, Credits>> {
        let rows = sqlx::query(
            r#"
            SELECT requester_id, SUM(amount) as held
            FROM requests
            WHERE state IN ('matched', 'accepted', 'in_progress', 'disputed')
            GROUP BY requester_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to sum reservations")?;

        let mut held = HashMap::new();
        for row in rows {
            let requester: String = row.get("requester_id");
            held.insert(parse_id(&requester, "requester ID")?, row.get("held"));
        }
        Ok(held)
    }

    /// Insert a new request together with its history.
    pub async fn insert_request_in(
        conn: &mut SqliteConnection,
        request: &ServiceRequest,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO requests (id, requester_id, provider_id, service_type, amount, description, state, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(request.id.to_string())
        .bind(request.requester_id.to_string())
        .bind(request.provider_id.map(|id| id.to_string()))
        .bind(&request.service_type)
        .bind(request.amount)
        .bind(&request.description)
        .bind(request.state.as_str())
        .bind(request.version)
        .bind(format_timestamp(&request.created_at))
        .bind(format_timestamp(&request.updated_at))
        .execute(&mut *conn)
        .await
        .context("Failed to save request")?;

        for entry in &request.history {
            Self::insert_history_in(conn, request.id, entry).await?;
        }
        Ok(())
    }

    /// Write the mutable fields of a request, checking its version.
    /// On success the request's version is bumped to the stored value.
    pub async fn update_request_in(
        conn: &mut SqliteConnection,
        request: &mut ServiceRequest,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE requests
            SET provider_id = ?, state = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(request.provider_id.map(|id| id.to_string()))
        .bind(request.state.as_str())
        .bind(format_timestamp(&request.updated_at))
        .bind(request.id.to_string())
        .bind(request.version)
        .execute(&mut *conn)
        .await
        .context("Failed to update request")?;

        if result.rows_affected() == 0 {
            return Err(VersionConflict {
                entity: "request",
                id: request.id.to_string(),
            }
            .into());
        }

        request.version += 1;
        Ok(())
    }

    fn row_to_request(row: &SqliteRow) -> Result<ServiceRequest> {
        let id: String = row.get("id");
        let requester_id: String = row.get("requester_id");
        let provider_id: Option<String> = row.get("provider_id");
        let state: String = row.get("state");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");

        Ok(ServiceRequest {
            id: parse_id(&id, "request ID")?,
            requester_id: parse_id(&requester_id, "requester ID")?,
            provider_id: provider_id
                .map(|s| parse_id(&s, "provider ID"))
                .transpose()?,
            service_type: row.get("service_type"),
            amount: row.get("amount"),
            description: row.get("description"),
            state: parse_state(&state)?,
            version: row.get("version"),
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            history: Vec::new(),
        })
    }

    // ========================
    // History operations
    // ========================

    pub async fn history_in(
        conn: &mut SqliteConnection,
        request_id: RequestId,
    ) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT position, from_state, to_state, actor, reason, occurred_at
            FROM request_history
            WHERE request_id = ?
            ORDER BY position
            "#,
        )
        .bind(request_id.to_string())
        .fetch_all(&mut *conn)
        .await
        .context("Failed to fetch request history")?;

        rows.iter().map(Self::row_to_history).collect()
    }

    pub async fn insert_history_in(
        conn: &mut SqliteConnection,
        request_id: RequestId,
        entry: &HistoryEntry,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO request_history (request_id, position, from_state, to_state, actor, reason, occurred_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(request_id.to_string())
        .bind(entry.position)
        .bind(entry.from_state.map(|s| s.as_str()))
        .bind(entry.to_state.as_str())
        .bind(entry.actor.to_string())
        .bind(&entry.reason)
        .bind(format_timestamp(&entry.occurred_at))
        .execute(&mut *conn)
        .await
        .context("Failed to save history entry")?;
        Ok(())
    }

    fn row_to_history(row: &SqliteRow) -> Result<HistoryEntry> {
        let from_state: Option<String> = row.get("from_state");
        let to_state: String = row.get("to_state");
        let actor: String = row.get("actor");
        let occurred_at: String = row.get("occurred_at");

        Ok(HistoryEntry {
            position: row.get("position"),
            from_state: from_state.as_deref().map(parse_state).transpose()?,
            to_state: parse_state(&to_state)?,
            actor: Actor::parse(&actor)
                .ok_or_else(|| anyhow::anyhow!("Invalid actor: {}", actor))?,
            occurred_at: parse_timestamp(&occurred_at)?,
            reason: row.get("reason"),
        })
    }

    // ========================
    // Transaction record operations
    // ========================

    /// Append a transaction record. Assigns the next sequence number.
    pub async fn insert_transaction_in(
        conn: &mut SqliteConnection,
        record: &mut TransactionRecord,
    ) -> Result<()> {
        record.sequence = Self::next_sequence_in(conn).await?;

        sqlx::query(
            r#"
            INSERT INTO transactions (id, sequence, request_id, from_user_id, to_user_id, amount, kind, operation_key, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.sequence)
        .bind(record.request_id.map(|id| id.to_string()))
        .bind(record.from_user.map(|id| id.to_string()))
        .bind(record.to_user.to_string())
        .bind(record.amount)
        .bind(record.kind.as_str())
        .bind(&record.operation_key)
        .bind(format_timestamp(&record.recorded_at))
        .execute(&mut *conn)
        .await
        .context("Failed to save transaction record")?;

        Ok(())
    }

    /// Get the next sequence number and increment the counter.
    async fn next_sequence_in(conn: &mut SqliteConnection) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE sequence_counter
            SET value = value + 1
            WHERE name = 'transaction_sequence'
            RETURNING value
            "#,
        )
        .fetch_one(&mut *conn)
        .await
        .context("Failed to get next sequence number")?;

        Ok(row.get("value"))
    }

    /// Find the record produced by a ledger operation, by its key.
    pub async fn transaction_by_key_in(
        conn: &mut SqliteConnection,
        operation_key: &str,
    ) -> Result<Option<TransactionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE operation_key = ?",
            TRANSACTION_COLUMNS
        ))
        .bind(operation_key)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch transaction record")?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    /// Sum of every grant ever recorded.
    pub async fn total_granted_in(conn: &mut SqliteConnection) -> Result<Credits> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount), 0) AS total FROM transactions WHERE kind = 'grant'",
        )
        .fetch_one(&mut *conn)
        .await
        .context("Failed to sum granted credits")?;

        Ok(row.get("total"))
    }

    /// List transaction records in sequence order, optionally for one user.
    pub async fn list_transactions(&self, user_id: Option<UserId>) -> Result<Vec<TransactionRecord>> {
        let rows = match user_id {
            Some(user_id) => {
                let id = user_id.to_string();
                sqlx::query(&format!(
                    "SELECT {} FROM transactions WHERE from_user_id = ? OR to_user_id = ? ORDER BY sequence",
                    TRANSACTION_COLUMNS
                ))
                .bind(&id)
                .bind(&id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM transactions ORDER BY sequence",
                    TRANSACTION_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list transaction records")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// List the records produced for a request.
    pub async fn list_transactions_for_request(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<TransactionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE request_id = ? ORDER BY sequence",
            TRANSACTION_COLUMNS
        ))
        .bind(request_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transaction records for request")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    fn row_to_transaction(row: &SqliteRow) -> Result<TransactionRecord> {
        let id: String = row.get("id");
        let request_id: Option<String> = row.get("request_id");
        let from_user: Option<String> = row.get("from_user_id");
        let to_user: String = row.get("to_user_id");
        let kind: String = row.get("kind");
        let recorded_at: String = row.get("recorded_at");

        Ok(TransactionRecord {
            id: parse_id(&id, "transaction ID")?,
            sequence: row.get("sequence"),
            request_id: request_id
                .map(|s| parse_id(&s, "request ID"))
                .transpose()?,
            from_user: from_user.map(|s| parse_id(&s, "user ID")).transpose()?,
            to_user: parse_id(&to_user, "user ID")?,
            amount: row.get("amount"),
            kind: TransactionKind::from_str(&kind)
                .ok_or_else(|| anyhow::anyhow!("Invalid transaction kind: {}", kind))?,
            operation_key: row.get("operation_key"),
            recorded_at: parse_timestamp(&recorded_at)?,
        })
    }

    // ========================
    // Idempotency operations
    // ========================

    /// Look up a committed command by its idempotency key.
    pub async fn get_processed_command(&self, key: &str) -> Result<Option<ProcessedCommand>> {
        let mut conn = self.pool.acquire().await?;
        Self::processed_command_in(&mut conn, key).await
    }

    pub async fn processed_command_in(
        conn: &mut SqliteConnection,
        key: &str,
    ) -> Result<Option<ProcessedCommand>> {
        let row = sqlx::query(
            r#"
            SELECT idempotency_key, command, request_id, recorded_at
            FROM processed_commands
            WHERE idempotency_key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch processed command")?;

        match row {
            Some(row) => {
                let request_id: String = row.get("request_id");
                let recorded_at: String = row.get("recorded_at");
                Ok(Some(ProcessedCommand {
                    idempotency_key: row.get("idempotency_key"),
                    command: row.get("command"),
                    request_id: parse_id(&request_id, "request ID")?,
                    recorded_at: parse_timestamp(&recorded_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn record_command_in(
        conn: &mut SqliteConnection,
        command: &ProcessedCommand,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_commands (idempotency_key, command, request_id, recorded_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&command.idempotency_key)
        .bind(&command.command)
        .bind(command.request_id.to_string())
        .bind(format_timestamp(&command.recorded_at))
        .execute(&mut *conn)
        .await
        .context("Failed to record processed command")?;
        Ok(())
    }
}
