//! Persistent storage for the treasury backend.
//!
//! Uses SQLite for durable storage of:
//! - Coin locks and replay markers (the cross-process mutual-exclusion table)
//! - Signing requests and their per-signer items
//! - Transfer requests (withdrawals, replenishments)
//! - Scheduled transactions awaiting broadcast
//! - PayJoin idempotency records and deposit addresses
//!
//! The atomic-insert lock primitive relies on the PRIMARY KEY constraint of
//! the `coin_locks` table: acquisition is an insert that fails on collision,
//! release is a delete. No in-process mutex is assumed by callers.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use uuid::Uuid;

use treasury_types::{
    DepositAddress, LockKind, PayjoinRecord, ScheduledTransactionRecord, SigningRequestItem,
    SigningRequestRecord, SigningRequestStatus, SigningRequestType, TransferRequestRecord,
    TransferStatus, TransferType, TreasuryError,
};

/// The shared relational store. Every operation runs inside one implicit or
/// explicit SQLite transaction; nothing authoritative lives only in memory.
pub struct TreasuryStore {
    conn: Mutex<Connection>,
}

impl TreasuryStore {
    /// Open or create a store at the given path.
    pub fn open(path: &str) -> Result<Self, TreasuryError> {
        let conn = Connection::open(path)
            .map_err(|e| TreasuryError::Storage(format!("Failed to open database: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, TreasuryError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            TreasuryError::Storage(format!("Failed to open in-memory database: {}", e))
        })?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), TreasuryError> {
        let conn = self.lock_conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS coin_locks (
                outpoint TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS signing_requests (
                id TEXT PRIMARY KEY,
                wallet_id TEXT NOT NULL,
                unsigned_psbt TEXT NOT NULL,
                final_psbt TEXT,
                required_signatures INTEGER NOT NULL,
                status TEXT NOT NULL,
                request_type TEXT NOT NULL,
                failure_reason TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS signing_request_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signing_request_id TEXT NOT NULL,
                signed_psbt TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(signing_request_id, signed_psbt)
            );
            CREATE TABLE IF NOT EXISTS transfer_requests (
                id TEXT PRIMARY KEY,
                amount_sats INTEGER NOT NULL,
                destination TEXT NOT NULL,
                status TEXT NOT NULL,
                transfer_type TEXT NOT NULL,
                signing_request_id TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS scheduled_transactions (
                id TEXT PRIMARY KEY,
                raw_tx TEXT NOT NULL,
                broadcast_at INTEGER NOT NULL,
                replaces_signing_request_id TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS payjoin_records (
                final_txid TEXT PRIMARY KEY,
                original_txid TEXT NOT NULL,
                deposit_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS deposit_addresses (
                id TEXT PRIMARY KEY,
                wallet_id TEXT NOT NULL,
                address TEXT NOT NULL,
                derivation_change INTEGER NOT NULL,
                derivation_index INTEGER NOT NULL,
                active INTEGER NOT NULL
            );",
        )
        .map_err(|e| TreasuryError::Storage(format!("Failed to create schema: {}", e)))?;

        tracing::debug!("Treasury store schema initialized");
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, TreasuryError> {
        self.conn
            .lock()
            .map_err(|e| TreasuryError::Storage(format!("Lock error: {}", e)))
    }

    // ========================================================================
    // Coin locks
    // ========================================================================

    /// Atomically insert a selection lock. Returns true iff no row existed.
    pub fn try_lock(&self, outpoint: &str) -> Result<bool, TreasuryError> {
        let conn = self.lock_conn()?;

        let result = conn.execute(
            "INSERT INTO coin_locks (outpoint, kind, created_at) VALUES (?1, ?2, ?3)",
            params![
                outpoint,
                LockKind::Selection.to_string(),
                Utc::now().timestamp()
            ],
        );

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_constraint_violation(&e) => Ok(false),
            Err(e) => Err(TreasuryError::Storage(format!(
                "Failed to insert lock: {}",
                e
            ))),
        }
    }

    /// Delete selection-lock rows. Returns true only if every given outpoint
    /// had a row removed; partial removal returns false and the caller must
    /// treat store state as possibly inconsistent.
    pub fn try_unlock(&self, outpoints: &[String]) -> Result<bool, TreasuryError> {
        let conn = self.lock_conn()?;

        let mut all_removed = true;
        for outpoint in outpoints {
            let rows = conn
                .execute(
                    "DELETE FROM coin_locks WHERE outpoint = ?1 AND kind = ?2",
                    params![outpoint, LockKind::Selection.to_string()],
                )
                .map_err(|e| TreasuryError::Storage(format!("Failed to delete lock: {}", e)))?;
            if rows == 0 {
                all_removed = false;
            }
        }
        Ok(all_removed)
    }

    /// Insert permanent replay markers for a sender's declared inputs, all in
    /// one transaction. A collision on any input rolls back every insert and
    /// returns false ("these inputs were seen before").
    pub fn try_lock_inputs(&self, outpoints: &[String]) -> Result<bool, TreasuryError> {
        let mut conn = self.lock_conn()?;

        let tx = conn
            .transaction()
            .map_err(|e| TreasuryError::Storage(format!("Failed to begin transaction: {}", e)))?;

        for outpoint in outpoints {
            let result = tx.execute(
                "INSERT INTO coin_locks (outpoint, kind, created_at) VALUES (?1, ?2, ?3)",
                params![
                    outpoint,
                    LockKind::Replay.to_string(),
                    Utc::now().timestamp()
                ],
            );
            match result {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    // Rollback happens on drop.
                    return Ok(false);
                }
                Err(e) => {
                    return Err(TreasuryError::Storage(format!(
                        "Failed to insert replay marker: {}",
                        e
                    )))
                }
            }
        }

        tx.commit()
            .map_err(|e| TreasuryError::Storage(format!("Failed to commit markers: {}", e)))?;
        Ok(true)
    }

    /// Return the subset of the given outpoints that currently have *any*
    /// lock row (selection lock or replay marker).
    pub fn locked_subset(&self, outpoints: &[String]) -> Result<Vec<String>, TreasuryError> {
        let conn = self.lock_conn()?;

        let mut stmt = conn
            .prepare("SELECT 1 FROM coin_locks WHERE outpoint = ?1")
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        let mut locked = Vec::new();
        for outpoint in outpoints {
            let exists = stmt
                .exists(params![outpoint])
                .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;
            if exists {
                locked.push(outpoint.clone());
            }
        }
        Ok(locked)
    }

    /// Delete selection locks older than `max_age_secs`. Replay markers are
    /// never swept. Returns the number of rows removed.
    pub fn sweep_selection_locks(&self, max_age_secs: i64) -> Result<usize, TreasuryError> {
        let conn = self.lock_conn()?;

        let cutoff = Utc::now().timestamp() - max_age_secs;
        let rows = conn
            .execute(
                "DELETE FROM coin_locks WHERE kind = ?1 AND created_at <= ?2",
                params![LockKind::Selection.to_string(), cutoff],
            )
            .map_err(|e| TreasuryError::Storage(format!("Sweep error: {}", e)))?;

        if rows > 0 {
            tracing::info!("Swept {} stale selection locks", rows);
        }
        Ok(rows)
    }

    /// Number of lock rows, optionally restricted to one kind.
    pub fn lock_count(&self, kind: Option<LockKind>) -> Result<usize, TreasuryError> {
        let conn = self.lock_conn()?;

        let count: i64 = match kind {
            Some(k) => conn
                .query_row(
                    "SELECT COUNT(*) FROM coin_locks WHERE kind = ?1",
                    params![k.to_string()],
                    |row| row.get(0),
                )
                .map_err(|e| TreasuryError::Storage(format!("Count error: {}", e)))?,
            None => conn
                .query_row("SELECT COUNT(*) FROM coin_locks", [], |row| row.get(0))
                .map_err(|e| TreasuryError::Storage(format!("Count error: {}", e)))?,
        };
        Ok(count as usize)
    }

    // ========================================================================
    // Signing requests
    // ========================================================================

    /// Insert a new signing request.
    pub fn insert_signing_request(
        &self,
        request: &SigningRequestRecord,
    ) -> Result<(), TreasuryError> {
        let conn = self.lock_conn()?;

        conn.execute(
            "INSERT INTO signing_requests
             (id, wallet_id, unsigned_psbt, final_psbt, required_signatures, status,
              request_type, failure_reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                request.id,
                request.wallet_id,
                request.unsigned_psbt,
                request.final_psbt,
                request.required_signatures,
                request.status.to_string(),
                request.request_type.to_string(),
                request.failure_reason,
                request.created_at.timestamp(),
            ],
        )
        .map_err(|e| TreasuryError::Storage(format!("Failed to insert signing request: {}", e)))?;

        tracing::info!(
            "Recorded signing request {} ({}, {} required signatures)",
            request.id,
            request.request_type,
            request.required_signatures
        );
        Ok(())
    }

    /// Get a signing request by id.
    pub fn get_signing_request(
        &self,
        id: &str,
    ) -> Result<Option<SigningRequestRecord>, TreasuryError> {
        let conn = self.lock_conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, wallet_id, unsigned_psbt, final_psbt, required_signatures, status,
                        request_type, failure_reason, created_at
                 FROM signing_requests WHERE id = ?1",
            )
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        let request = stmt
            .query_row(params![id], row_to_signing_request)
            .optional()
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        Ok(request)
    }

    /// List signing requests, newest first, optionally filtered by status
    /// and/or type.
    pub fn list_signing_requests(
        &self,
        status: Option<SigningRequestStatus>,
        request_type: Option<SigningRequestType>,
    ) -> Result<Vec<SigningRequestRecord>, TreasuryError> {
        let conn = self.lock_conn()?;

        let mut sql = String::from(
            "SELECT id, wallet_id, unsigned_psbt, final_psbt, required_signatures, status,
                    request_type, failure_reason, created_at
             FROM signing_requests WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(s) = status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(s.to_string());
        }
        if let Some(t) = request_type {
            sql.push_str(&format!(" AND request_type = ?{}", args.len() + 1));
            args.push(t.to_string());
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        let requests = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter()),
                row_to_signing_request,
            )
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        Ok(requests)
    }

    /// Move a signing request into a new status, with an optional persisted
    /// failure reason.
    pub fn set_signing_request_status(
        &self,
        id: &str,
        status: SigningRequestStatus,
        failure_reason: Option<&str>,
    ) -> Result<(), TreasuryError> {
        let conn = self.lock_conn()?;

        let rows = conn
            .execute(
                "UPDATE signing_requests SET status = ?1, failure_reason = ?2 WHERE id = ?3",
                params![status.to_string(), failure_reason, id],
            )
            .map_err(|e| TreasuryError::Storage(format!("Update error: {}", e)))?;

        if rows == 0 {
            return Err(TreasuryError::NotFound(format!("signing request {}", id)));
        }
        Ok(())
    }

    /// Record the combined+finalized PSBT and mark the request Signed.
    pub fn set_signing_request_final(
        &self,
        id: &str,
        final_psbt: &str,
    ) -> Result<(), TreasuryError> {
        let conn = self.lock_conn()?;

        let rows = conn
            .execute(
                "UPDATE signing_requests SET final_psbt = ?1, status = ?2 WHERE id = ?3",
                params![final_psbt, SigningRequestStatus::Signed.to_string(), id],
            )
            .map_err(|e| TreasuryError::Storage(format!("Update error: {}", e)))?;

        if rows == 0 {
            return Err(TreasuryError::NotFound(format!("signing request {}", id)));
        }
        Ok(())
    }

    /// Insert one signer's signed copy. Returns false if the identical
    /// payload was already recorded for this request (UNIQUE constraint).
    pub fn insert_signing_item(
        &self,
        signing_request_id: &str,
        signed_psbt: &str,
    ) -> Result<bool, TreasuryError> {
        let conn = self.lock_conn()?;

        let result = conn.execute(
            "INSERT INTO signing_request_items (signing_request_id, signed_psbt, created_at)
             VALUES (?1, ?2, ?3)",
            params![signing_request_id, signed_psbt, Utc::now().timestamp()],
        );

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_constraint_violation(&e) => Ok(false),
            Err(e) => Err(TreasuryError::Storage(format!(
                "Failed to insert signing item: {}",
                e
            ))),
        }
    }

    /// All items recorded for a signing request, oldest first.
    pub fn signing_items(
        &self,
        signing_request_id: &str,
    ) -> Result<Vec<SigningRequestItem>, TreasuryError> {
        let conn = self.lock_conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, signing_request_id, signed_psbt, created_at
                 FROM signing_request_items WHERE signing_request_id = ?1 ORDER BY id ASC",
            )
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        let items = stmt
            .query_map(params![signing_request_id], |row| {
                Ok(SigningRequestItem {
                    id: row.get(0)?,
                    signing_request_id: row.get(1)?,
                    signed_psbt: row.get(2)?,
                    created_at: timestamp_to_datetime(row.get::<_, i64>(3)?),
                })
            })
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        Ok(items)
    }

    // ========================================================================
    // Transfer requests
    // ========================================================================

    /// Insert a new transfer request.
    pub fn insert_transfer_request(
        &self,
        transfer: &TransferRequestRecord,
    ) -> Result<(), TreasuryError> {
        let conn = self.lock_conn()?;

        conn.execute(
            "INSERT INTO transfer_requests
             (id, amount_sats, destination, status, transfer_type, signing_request_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                transfer.id.to_string(),
                transfer.amount_sats as i64,
                transfer.destination,
                transfer.status.to_string(),
                transfer.transfer_type.to_string(),
                transfer.signing_request_id,
                transfer.created_at.timestamp(),
            ],
        )
        .map_err(|e| TreasuryError::Storage(format!("Failed to insert transfer: {}", e)))?;

        Ok(())
    }

    /// List transfer requests oldest-first (FIFO), optionally filtered.
    pub fn list_transfer_requests(
        &self,
        status: Option<TransferStatus>,
        transfer_type: Option<TransferType>,
    ) -> Result<Vec<TransferRequestRecord>, TreasuryError> {
        let conn = self.lock_conn()?;

        let mut sql = String::from(
            "SELECT id, amount_sats, destination, status, transfer_type, signing_request_id,
                    created_at
             FROM transfer_requests WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(s) = status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(s.to_string());
        }
        if let Some(t) = transfer_type {
            sql.push_str(&format!(" AND transfer_type = ?{}", args.len() + 1));
            args.push(t.to_string());
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        let transfers = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), row_to_transfer)
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        Ok(transfers)
    }

    /// Get a transfer request by id.
    pub fn get_transfer_request(
        &self,
        id: &Uuid,
    ) -> Result<Option<TransferRequestRecord>, TreasuryError> {
        let conn = self.lock_conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, amount_sats, destination, status, transfer_type, signing_request_id,
                        created_at
                 FROM transfer_requests WHERE id = ?1",
            )
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        let transfer = stmt
            .query_row(params![id.to_string()], row_to_transfer)
            .optional()
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        Ok(transfer)
    }

    /// Mark fulfilled transfers Processing and link them to the funding
    /// signing request.
    pub fn mark_transfers_processing(
        &self,
        ids: &[Uuid],
        signing_request_id: &str,
    ) -> Result<(), TreasuryError> {
        let conn = self.lock_conn()?;

        for id in ids {
            conn.execute(
                "UPDATE transfer_requests SET status = ?1, signing_request_id = ?2 WHERE id = ?3",
                params![
                    TransferStatus::Processing.to_string(),
                    signing_request_id,
                    id.to_string()
                ],
            )
            .map_err(|e| TreasuryError::Storage(format!("Update error: {}", e)))?;
        }
        Ok(())
    }

    /// Cancel every Pending Internal transfer; returns the signing-request
    /// ids they were linked to so the caller can expire those requests.
    pub fn cancel_pending_internal_transfers(&self) -> Result<Vec<String>, TreasuryError> {
        let conn = self.lock_conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT signing_request_id FROM transfer_requests
                 WHERE status = ?1 AND transfer_type = ?2 AND signing_request_id IS NOT NULL",
            )
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        let linked: Vec<String> = stmt
            .query_map(
                params![
                    TransferStatus::Pending.to_string(),
                    TransferType::Internal.to_string()
                ],
                |row| row.get(0),
            )
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        let cancelled = conn
            .execute(
                "UPDATE transfer_requests SET status = ?1
                 WHERE status = ?2 AND transfer_type = ?3",
                params![
                    TransferStatus::Cancelled.to_string(),
                    TransferStatus::Pending.to_string(),
                    TransferType::Internal.to_string()
                ],
            )
            .map_err(|e| TreasuryError::Storage(format!("Update error: {}", e)))?;

        if cancelled > 0 {
            tracing::info!("Cancelled {} pending internal transfers", cancelled);
        }
        Ok(linked)
    }

    /// Re-point transfers linked to a superseded signing request onto the
    /// replacement transaction id and mark them Processing. Returns the
    /// number of transfers touched.
    pub fn repoint_transfers(
        &self,
        old_signing_request_id: &str,
        new_txid: &str,
    ) -> Result<usize, TreasuryError> {
        let conn = self.lock_conn()?;

        let rows = conn
            .execute(
                "UPDATE transfer_requests SET signing_request_id = ?1, status = ?2
                 WHERE signing_request_id = ?3",
                params![
                    new_txid,
                    TransferStatus::Processing.to_string(),
                    old_signing_request_id
                ],
            )
            .map_err(|e| TreasuryError::Storage(format!("Update error: {}", e)))?;
        Ok(rows)
    }

    // ========================================================================
    // Scheduled transactions
    // ========================================================================

    /// Queue a signed transaction for future broadcast.
    pub fn insert_scheduled_transaction(
        &self,
        scheduled: &ScheduledTransactionRecord,
    ) -> Result<(), TreasuryError> {
        let conn = self.lock_conn()?;

        conn.execute(
            "INSERT INTO scheduled_transactions
             (id, raw_tx, broadcast_at, replaces_signing_request_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                scheduled.id.to_string(),
                scheduled.raw_tx,
                scheduled.broadcast_at.timestamp(),
                scheduled.replaces_signing_request_id,
                scheduled.created_at.timestamp(),
            ],
        )
        .map_err(|e| TreasuryError::Storage(format!("Failed to schedule transaction: {}", e)))?;

        Ok(())
    }

    /// All entries due at or before `now`, oldest first.
    pub fn due_scheduled_transactions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledTransactionRecord>, TreasuryError> {
        let conn = self.lock_conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, raw_tx, broadcast_at, replaces_signing_request_id, created_at
                 FROM scheduled_transactions WHERE broadcast_at <= ?1
                 ORDER BY broadcast_at ASC, created_at ASC",
            )
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        let entries = stmt
            .query_map(params![now.timestamp()], |row| {
                let id_str: String = row.get(0)?;
                let id = parse_uuid(&id_str, 0)?;
                Ok(ScheduledTransactionRecord {
                    id,
                    raw_tx: row.get(1)?,
                    broadcast_at: timestamp_to_datetime(row.get::<_, i64>(2)?),
                    replaces_signing_request_id: row.get(3)?,
                    created_at: timestamp_to_datetime(row.get::<_, i64>(4)?),
                })
            })
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        Ok(entries)
    }

    /// Remove a schedule entry. Returns true if a row was deleted.
    pub fn delete_scheduled_transaction(&self, id: &Uuid) -> Result<bool, TreasuryError> {
        let conn = self.lock_conn()?;

        let rows = conn
            .execute(
                "DELETE FROM scheduled_transactions WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(|e| TreasuryError::Storage(format!("Delete error: {}", e)))?;
        Ok(rows > 0)
    }

    // ========================================================================
    // PayJoin records
    // ========================================================================

    /// Persist the idempotency record for a completed negotiation.
    pub fn insert_payjoin_record(&self, record: &PayjoinRecord) -> Result<(), TreasuryError> {
        let conn = self.lock_conn()?;

        conn.execute(
            "INSERT INTO payjoin_records (final_txid, original_txid, deposit_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.final_txid,
                record.original_txid,
                record.deposit_id,
                record.created_at.timestamp(),
            ],
        )
        .map_err(|e| TreasuryError::Storage(format!("Failed to insert payjoin record: {}", e)))?;

        Ok(())
    }

    /// Look up a payjoin record by the finalized transaction hash.
    pub fn get_payjoin_record(
        &self,
        final_txid: &str,
    ) -> Result<Option<PayjoinRecord>, TreasuryError> {
        let conn = self.lock_conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT final_txid, original_txid, deposit_id, created_at
                 FROM payjoin_records WHERE final_txid = ?1",
            )
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        let record = stmt
            .query_row(params![final_txid], |row| {
                Ok(PayjoinRecord {
                    final_txid: row.get(0)?,
                    original_txid: row.get(1)?,
                    deposit_id: row.get(2)?,
                    created_at: timestamp_to_datetime(row.get::<_, i64>(3)?),
                })
            })
            .optional()
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        Ok(record)
    }

    // ========================================================================
    // Deposit addresses
    // ========================================================================

    /// Record a deposit address issued for a wallet.
    pub fn insert_deposit_address(&self, deposit: &DepositAddress) -> Result<(), TreasuryError> {
        let conn = self.lock_conn()?;

        conn.execute(
            "INSERT INTO deposit_addresses
             (id, wallet_id, address, derivation_change, derivation_index, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                deposit.id,
                deposit.wallet_id,
                deposit.address,
                deposit.derivation_change,
                deposit.derivation_index,
                deposit.active as i32,
            ],
        )
        .map_err(|e| TreasuryError::Storage(format!("Failed to insert deposit: {}", e)))?;

        Ok(())
    }

    /// All currently-active deposit addresses.
    pub fn active_deposit_addresses(&self) -> Result<Vec<DepositAddress>, TreasuryError> {
        let conn = self.lock_conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, wallet_id, address, derivation_change, derivation_index, active
                 FROM deposit_addresses WHERE active = 1",
            )
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        let deposits = stmt
            .query_map([], |row| {
                Ok(DepositAddress {
                    id: row.get(0)?,
                    wallet_id: row.get(1)?,
                    address: row.get(2)?,
                    derivation_change: row.get(3)?,
                    derivation_index: row.get(4)?,
                    active: row.get::<_, i32>(5)? != 0,
                })
            })
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TreasuryError::Storage(format!("Query error: {}", e)))?;

        Ok(deposits)
    }

}

// ============================================================================
// Helpers
// ============================================================================

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn timestamp_to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn parse_uuid(s: &str, col: usize) -> SqlResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("invalid UUID '{}': {}", s, e).into(),
        )
    })
}

fn parse_enum<T>(s: &str, col: usize, parse: fn(&str) -> Result<T, String>) -> SqlResult<T> {
    parse(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, e.into())
    })
}

fn row_to_signing_request(row: &rusqlite::Row<'_>) -> SqlResult<SigningRequestRecord> {
    let status_str: String = row.get(5)?;
    let type_str: String = row.get(6)?;
    Ok(SigningRequestRecord {
        id: row.get(0)?,
        wallet_id: row.get(1)?,
        unsigned_psbt: row.get(2)?,
        final_psbt: row.get(3)?,
        required_signatures: row.get(4)?,
        status: parse_enum(&status_str, 5, SigningRequestStatus::parse)?,
        request_type: parse_enum(&type_str, 6, SigningRequestType::parse)?,
        failure_reason: row.get(7)?,
        created_at: timestamp_to_datetime(row.get::<_, i64>(8)?),
    })
}

fn row_to_transfer(row: &rusqlite::Row<'_>) -> SqlResult<TransferRequestRecord> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(3)?;
    let type_str: String = row.get(4)?;
    Ok(TransferRequestRecord {
        id: parse_uuid(&id_str, 0)?,
        amount_sats: row.get::<_, i64>(1)? as u64,
        destination: row.get(2)?,
        status: parse_enum(&status_str, 3, TransferStatus::parse)?,
        transfer_type: parse_enum(&type_str, 4, TransferType::parse)?,
        signing_request_id: row.get(5)?,
        created_at: timestamp_to_datetime(row.get::<_, i64>(6)?),
    })
}

// Extend the optional trait for rusqlite
trait OptionalExt<T> {
    fn optional(self) -> SqlResult<Option<T>>;
}

impl<T> OptionalExt<T> for SqlResult<T> {
    fn optional(self) -> SqlResult<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signing_request(id: &str) -> SigningRequestRecord {
        SigningRequestRecord {
            id: id.to_string(),
            wallet_id: "hot-1".to_string(),
            unsigned_psbt: "cHNidP8BAA==".to_string(),
            final_psbt: None,
            required_signatures: 2,
            status: SigningRequestStatus::Pending,
            request_type: SigningRequestType::HotWallet,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_try_lock_is_exclusive() {
        let store = TreasuryStore::open_in_memory().unwrap();

        assert!(store.try_lock("abcd:0").unwrap());
        assert!(!store.try_lock("abcd:0").unwrap());

        // Unlock makes it acquirable again.
        assert!(store.try_unlock(&["abcd:0".to_string()]).unwrap());
        assert!(store.try_lock("abcd:0").unwrap());
    }

    #[test]
    fn test_try_unlock_partial_returns_false() {
        let store = TreasuryStore::open_in_memory().unwrap();

        assert!(store.try_lock("aa:0").unwrap());
        let result = store
            .try_unlock(&["aa:0".to_string(), "bb:1".to_string()])
            .unwrap();
        assert!(!result);
        // The existing row was still removed.
        assert_eq!(store.lock_count(None).unwrap(), 0);
    }

    #[test]
    fn test_replay_markers_all_or_nothing() {
        let store = TreasuryStore::open_in_memory().unwrap();

        let inputs = vec!["tx1:0".to_string(), "tx1:1".to_string()];
        assert!(store.try_lock_inputs(&inputs).unwrap());
        // Second attempt sees the markers.
        assert!(!store.try_lock_inputs(&inputs).unwrap());

        // Overlap with one already-marked input inserts nothing.
        let overlapping = vec!["tx2:0".to_string(), "tx1:0".to_string()];
        assert!(!store.try_lock_inputs(&overlapping).unwrap());
        assert_eq!(store.lock_count(Some(LockKind::Replay)).unwrap(), 2);
    }

    #[test]
    fn test_sweep_spares_replay_markers() {
        let store = TreasuryStore::open_in_memory().unwrap();

        assert!(store.try_lock("sel:0").unwrap());
        assert!(store.try_lock_inputs(&["rep:0".to_string()]).unwrap());

        // Sweep with zero max age removes all selection locks, no markers.
        let removed = store.sweep_selection_locks(0).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.lock_count(Some(LockKind::Selection)).unwrap(), 0);
        assert_eq!(store.lock_count(Some(LockKind::Replay)).unwrap(), 1);

        // The swept outpoint is lockable again.
        assert!(store.try_lock("sel:0").unwrap());
    }

    #[test]
    fn test_locked_subset_sees_both_kinds() {
        let store = TreasuryStore::open_in_memory().unwrap();

        store.try_lock("a:0").unwrap();
        store.try_lock_inputs(&["b:0".to_string()]).unwrap();

        let locked = store
            .locked_subset(&["a:0".to_string(), "b:0".to_string(), "c:0".to_string()])
            .unwrap();
        assert_eq!(locked, vec!["a:0".to_string(), "b:0".to_string()]);
    }

    #[test]
    fn test_signing_request_crud() {
        let store = TreasuryStore::open_in_memory().unwrap();

        let request = sample_signing_request("txid-1");
        store.insert_signing_request(&request).unwrap();

        let loaded = store.get_signing_request("txid-1").unwrap().unwrap();
        assert_eq!(loaded.status, SigningRequestStatus::Pending);
        assert_eq!(loaded.required_signatures, 2);

        store
            .set_signing_request_status("txid-1", SigningRequestStatus::Failed, Some("bad psbt"))
            .unwrap();
        let loaded = store.get_signing_request("txid-1").unwrap().unwrap();
        assert_eq!(loaded.status, SigningRequestStatus::Failed);
        assert_eq!(loaded.failure_reason.as_deref(), Some("bad psbt"));
    }

    #[test]
    fn test_signing_items_reject_duplicates() {
        let store = TreasuryStore::open_in_memory().unwrap();
        store
            .insert_signing_request(&sample_signing_request("txid-2"))
            .unwrap();

        assert!(store.insert_signing_item("txid-2", "psbt-a").unwrap());
        assert!(!store.insert_signing_item("txid-2", "psbt-a").unwrap());
        assert!(store.insert_signing_item("txid-2", "psbt-b").unwrap());

        let items = store.signing_items("txid-2").unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_list_signing_requests_filters() {
        let store = TreasuryStore::open_in_memory().unwrap();

        let mut a = sample_signing_request("txid-a");
        a.request_type = SigningRequestType::Replenishment;
        store.insert_signing_request(&a).unwrap();

        let b = sample_signing_request("txid-b");
        store.insert_signing_request(&b).unwrap();
        store
            .set_signing_request_status("txid-b", SigningRequestStatus::Signed, None)
            .unwrap();

        let pending = store
            .list_signing_requests(Some(SigningRequestStatus::Pending), None)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "txid-a");

        let replenishments = store
            .list_signing_requests(None, Some(SigningRequestType::Replenishment))
            .unwrap();
        assert_eq!(replenishments.len(), 1);
    }

    #[test]
    fn test_transfer_fifo_ordering() {
        let store = TreasuryStore::open_in_memory().unwrap();

        for (i, amount) in [30_000u64, 10_000, 20_000].iter().enumerate() {
            let t = TransferRequestRecord {
                id: Uuid::new_v4(),
                amount_sats: *amount,
                destination: format!("addr-{}", i),
                status: TransferStatus::Pending,
                transfer_type: TransferType::External,
                signing_request_id: None,
                created_at: timestamp_to_datetime(1_700_000_000 + i as i64),
            };
            store.insert_transfer_request(&t).unwrap();
        }

        let pending = store
            .list_transfer_requests(Some(TransferStatus::Pending), Some(TransferType::External))
            .unwrap();
        let amounts: Vec<u64> = pending.iter().map(|t| t.amount_sats).collect();
        // Insertion (timestamp) order, not amount order.
        assert_eq!(amounts, vec![30_000, 10_000, 20_000]);
    }

    #[test]
    fn test_cancel_pending_internal_transfers() {
        let store = TreasuryStore::open_in_memory().unwrap();

        let internal = TransferRequestRecord {
            id: Uuid::new_v4(),
            amount_sats: 50_000,
            destination: "replenish-addr".to_string(),
            status: TransferStatus::Pending,
            transfer_type: TransferType::Internal,
            signing_request_id: Some("sr-1".to_string()),
            created_at: Utc::now(),
        };
        store.insert_transfer_request(&internal).unwrap();

        let external = TransferRequestRecord {
            id: Uuid::new_v4(),
            amount_sats: 70_000,
            destination: "user-addr".to_string(),
            status: TransferStatus::Pending,
            transfer_type: TransferType::External,
            signing_request_id: None,
            created_at: Utc::now(),
        };
        store.insert_transfer_request(&external).unwrap();

        let linked = store.cancel_pending_internal_transfers().unwrap();
        assert_eq!(linked, vec!["sr-1".to_string()]);

        let loaded = store.get_transfer_request(&internal.id).unwrap().unwrap();
        assert_eq!(loaded.status, TransferStatus::Cancelled);
        // External request untouched.
        let loaded = store.get_transfer_request(&external.id).unwrap().unwrap();
        assert_eq!(loaded.status, TransferStatus::Pending);
    }

    #[test]
    fn test_repoint_transfers() {
        let store = TreasuryStore::open_in_memory().unwrap();

        let t = TransferRequestRecord {
            id: Uuid::new_v4(),
            amount_sats: 10_000,
            destination: "addr".to_string(),
            status: TransferStatus::Pending,
            transfer_type: TransferType::External,
            signing_request_id: Some("old-sr".to_string()),
            created_at: Utc::now(),
        };
        store.insert_transfer_request(&t).unwrap();

        let touched = store.repoint_transfers("old-sr", "new-txid").unwrap();
        assert_eq!(touched, 1);

        let loaded = store.get_transfer_request(&t.id).unwrap().unwrap();
        assert_eq!(loaded.signing_request_id.as_deref(), Some("new-txid"));
        assert_eq!(loaded.status, TransferStatus::Processing);
    }

    #[test]
    fn test_scheduled_transactions_due_and_delete() {
        let store = TreasuryStore::open_in_memory().unwrap();

        let past = ScheduledTransactionRecord {
            id: Uuid::new_v4(),
            raw_tx: "0200...".to_string(),
            broadcast_at: timestamp_to_datetime(Utc::now().timestamp() - 10),
            replaces_signing_request_id: Some("sr-9".to_string()),
            created_at: Utc::now(),
        };
        let future = ScheduledTransactionRecord {
            id: Uuid::new_v4(),
            raw_tx: "0200...".to_string(),
            broadcast_at: timestamp_to_datetime(Utc::now().timestamp() + 3600),
            replaces_signing_request_id: None,
            created_at: Utc::now(),
        };
        store.insert_scheduled_transaction(&past).unwrap();
        store.insert_scheduled_transaction(&future).unwrap();

        let due = store.due_scheduled_transactions(Utc::now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, past.id);

        assert!(store.delete_scheduled_transaction(&past.id).unwrap());
        assert!(!store.delete_scheduled_transaction(&past.id).unwrap());
    }

    #[test]
    fn test_payjoin_record_round_trip() {
        let store = TreasuryStore::open_in_memory().unwrap();

        let record = PayjoinRecord {
            final_txid: "ff".repeat(32),
            original_txid: "aa".repeat(32),
            deposit_id: "dep-1".to_string(),
            created_at: Utc::now(),
        };
        store.insert_payjoin_record(&record).unwrap();

        let loaded = store
            .get_payjoin_record(&record.final_txid)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.original_txid, record.original_txid);
        assert!(store.get_payjoin_record("00").unwrap().is_none());
    }

    #[test]
    fn test_deposit_addresses_active_filter() {
        let store = TreasuryStore::open_in_memory().unwrap();

        store
            .insert_deposit_address(&DepositAddress {
                id: "dep-1".to_string(),
                wallet_id: "hot-1".to_string(),
                address: "bcrt1q...".to_string(),
                derivation_change: 0,
                derivation_index: 7,
                active: true,
            })
            .unwrap();
        store
            .insert_deposit_address(&DepositAddress {
                id: "dep-2".to_string(),
                wallet_id: "hot-1".to_string(),
                address: "bcrt1q...2".to_string(),
                derivation_change: 0,
                derivation_index: 8,
                active: false,
            })
            .unwrap();

        let active = store.active_deposit_addresses().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "dep-1");
    }
}
