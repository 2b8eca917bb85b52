//! Saga state persistence
//!
//! Optimistic concurrency on saga rows (`WHERE saga_id = :id AND version =
//! :expected`), lease arithmetic on the store's own clock, and terminal
//! transitions that release the saga's locks inside the same transaction.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use civica_common::common::{IdempotencyEntry, Lease, LockRecord};
use civica_common::database::{Error, SagaStateStore, SagaUpdate};
use civica_common::saga::{SagaInstance, SagaStatus};
use civica_common::util::unix_time;
use rusqlite::Connection;
use uuid::Uuid;

use crate::stmt::{query, Column};
use crate::{column_as_nullable_number, column_as_nullable_string, column_as_number,
    column_as_string, unpack_into, CivicaSqliteDatabase};

const SAGA_COLUMNS: &str = r#"
    saga_id,
    saga_type,
    saga_version,
    status,
    current_step,
    step_results,
    context,
    correlation_id,
    idempotency_key,
    started_at,
    updated_at,
    finished_at,
    error,
    version
"#;

fn parse_uuid(s: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(s).map_err(|e| Error::Internal(format!("Invalid saga id: {e}")))
}

fn parse_status(s: &str) -> Result<SagaStatus, Error> {
    SagaStatus::from_str(s).map_err(Error::Internal)
}

pub(crate) fn sql_row_to_saga(row: Vec<Column>) -> Result<SagaInstance, Error> {
    unpack_into!(
        let (
            saga_id,
            saga_type,
            saga_version,
            status,
            current_step,
            step_results,
            context,
            correlation_id,
            idempotency_key,
            started_at,
            updated_at,
            finished_at,
            error,
            version
        ) = row
    );

    let saga_id = parse_uuid(&column_as_string!(&saga_id))?;
    let status = parse_status(&column_as_string!(&status))?;
    let step_results = serde_json::from_str(&column_as_string!(&step_results))?;
    let context = serde_json::from_str(&column_as_string!(&context))?;
    let saga_version: u32 = column_as_number!(saga_version);
    let current_step: usize = column_as_number!(current_step);
    let started_at: u64 = column_as_number!(started_at);
    let updated_at: u64 = column_as_number!(updated_at);
    let finished_at: Option<u64> = column_as_nullable_number!(finished_at);
    let version: u64 = column_as_number!(version);

    Ok(SagaInstance {
        saga_id,
        saga_type: column_as_string!(&saga_type),
        saga_version,
        status,
        current_step,
        step_results,
        context,
        correlation_id: column_as_nullable_string!(&correlation_id),
        idempotency_key: column_as_nullable_string!(&idempotency_key),
        started_at,
        updated_at,
        finished_at,
        error: column_as_nullable_string!(&error),
        version,
    })
}

fn sql_row_to_lock(row: Vec<Column>) -> Result<LockRecord, Error> {
    unpack_into!(
        let (
            resource_key,
            owner_saga_id,
            acquired_at,
            expires_at
        ) = row
    );

    let owner_saga_id = parse_uuid(&column_as_string!(&owner_saga_id))?;
    let acquired_at: u64 = column_as_number!(acquired_at);
    let expires_at: u64 = column_as_number!(expires_at);

    Ok(LockRecord {
        resource_key: column_as_string!(&resource_key),
        owner_saga_id,
        acquired_at,
        expires_at,
    })
}

fn get_idempotency_row(conn: &Connection, key: &str) -> Result<Option<IdempotencyEntry>, Error> {
    query(
        r#"
        SELECT
            key,
            saga_id,
            outcome,
            created_at
        FROM
            idempotency_keys
        WHERE
            key = :key
        "#,
    )
    .bind(":key", key.to_string())
    .fetch_one(conn)?
    .map(|row| {
        unpack_into!(
            let (
                key,
                saga_id,
                outcome,
                created_at
            ) = row
        );

        let saga_id = parse_uuid(&column_as_string!(&saga_id))?;
        let outcome = serde_json::from_str(&column_as_string!(&outcome))?;
        let created_at: u64 = column_as_number!(created_at);

        Ok(IdempotencyEntry {
            key: column_as_string!(&key),
            saga_id,
            outcome,
            created_at,
        })
    })
    .transpose()
}

#[async_trait]
impl SagaStateStore for CivicaSqliteDatabase {
    async fn create_saga(&self, saga: &SagaInstance) -> Result<(), Error> {
        self.in_tx(|conn| {
            // A key already finalized short-circuits with the stored outcome
            if let Some(key) = &saga.idempotency_key {
                if let Some(entry) = get_idempotency_row(conn, key)? {
                    return Err(Error::IdempotencyFinalized {
                        key: key.clone(),
                        saga_id: entry.saga_id,
                        outcome: entry.outcome,
                    });
                }
            }

            query(
                r#"
                INSERT INTO saga_instances
                (saga_id, saga_type, saga_version, status, current_step, step_results,
                 context, correlation_id, idempotency_key, started_at, updated_at,
                 finished_at, error, version)
                VALUES
                (:saga_id, :saga_type, :saga_version, :status, :current_step, :step_results,
                 :context, :correlation_id, :idempotency_key, :started_at, :updated_at,
                 :finished_at, :error, :version)
                "#,
            )
            .bind(":saga_id", saga.saga_id.to_string())
            .bind(":saga_type", saga.saga_type.clone())
            .bind(":saga_version", saga.saga_version as i64)
            .bind(":status", saga.status.as_str().to_string())
            .bind(":current_step", saga.current_step as i64)
            .bind(":step_results", serde_json::to_string(&saga.step_results)?)
            .bind(":context", serde_json::to_string(&saga.context)?)
            .bind(":correlation_id", saga.correlation_id.clone())
            .bind(":idempotency_key", saga.idempotency_key.clone())
            .bind(":started_at", saga.started_at as i64)
            .bind(":updated_at", saga.updated_at as i64)
            .bind(":finished_at", saga.finished_at.map(|t| t as i64))
            .bind(":error", saga.error.clone())
            .bind(":version", saga.version as i64)
            .execute(conn)?;

            Ok(())
        })
    }

    async fn load_saga(&self, saga_id: &Uuid) -> Result<SagaInstance, Error> {
        let conn = self.conn()?;

        query(format!(
            "SELECT {SAGA_COLUMNS} FROM saga_instances WHERE saga_id = :saga_id"
        ))
        .bind(":saga_id", saga_id.to_string())
        .fetch_one(&conn)?
        .map(sql_row_to_saga)
        .transpose()?
        .ok_or(Error::SagaNotFound)
    }

    async fn find_saga_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<SagaInstance>, Error> {
        let conn = self.conn()?;

        query(format!(
            "SELECT {SAGA_COLUMNS} FROM saga_instances WHERE idempotency_key = :key"
        ))
        .bind(":key", key.to_string())
        .fetch_one(&conn)?
        .map(sql_row_to_saga)
        .transpose()
    }

    async fn update_saga(
        &self,
        saga_id: &Uuid,
        expected_version: u64,
        update: SagaUpdate,
    ) -> Result<u64, Error> {
        self.in_tx(|conn| {
            let mut saga = query(format!(
                "SELECT {SAGA_COLUMNS} FROM saga_instances WHERE saga_id = :saga_id"
            ))
            .bind(":saga_id", saga_id.to_string())
            .fetch_one(conn)?
            .map(sql_row_to_saga)
            .transpose()?
            .ok_or(Error::SagaNotFound)?;

            if saga.status.is_terminal() {
                return Err(Error::AttemptUpdateFinishedSaga);
            }
            if saga.version != expected_version {
                return Err(Error::VersionConflict);
            }

            if let Some(status) = update.status {
                saga.status = status;
            }
            if let Some(current_step) = update.current_step {
                saga.current_step = current_step;
            }
            if let Some(step_results) = update.step_results {
                saga.step_results = step_results;
            }
            if let Some(error) = update.error {
                saga.error = Some(error);
            }
            if let Some(finished_at) = update.finished_at {
                saga.finished_at = Some(finished_at);
            }

            let new_version = expected_version + 1;
            let affected = query(
                r#"
                UPDATE saga_instances
                SET status = :status,
                    current_step = :current_step,
                    step_results = :step_results,
                    error = :error,
                    finished_at = :finished_at,
                    updated_at = :updated_at,
                    version = :new_version
                WHERE saga_id = :saga_id AND version = :expected_version
                "#,
            )
            .bind(":status", saga.status.as_str().to_string())
            .bind(":current_step", saga.current_step as i64)
            .bind(":step_results", serde_json::to_string(&saga.step_results)?)
            .bind(":error", saga.error.clone())
            .bind(":finished_at", saga.finished_at.map(|t| t as i64))
            .bind(":updated_at", unix_time() as i64)
            .bind(":new_version", new_version as i64)
            .bind(":saga_id", saga_id.to_string())
            .bind(":expected_version", expected_version as i64)
            .execute(conn)?;

            if affected == 0 {
                return Err(Error::VersionConflict);
            }

            // No observer may see "saga terminal" with its locks still held
            if saga.status.is_terminal() {
                query("DELETE FROM resource_locks WHERE owner_saga_id = :owner")
                    .bind(":owner", saga_id.to_string())
                    .execute(conn)?;
            }

            Ok(new_version)
        })
    }

    async fn heartbeat(&self, saga_id: &Uuid) -> Result<(), Error> {
        let conn = self.conn()?;

        query(
            r#"
            UPDATE saga_instances
            SET updated_at = :updated_at
            WHERE saga_id = :saga_id AND status IN ('executing', 'compensating')
            "#,
        )
        .bind(":updated_at", unix_time() as i64)
        .bind(":saga_id", saga_id.to_string())
        .execute(&conn)?;

        Ok(())
    }

    async fn list_sagas(
        &self,
        statuses: &[SagaStatus],
        older_than: Option<u64>,
        limit: usize,
    ) -> Result<Vec<SagaInstance>, Error> {
        let conn = self.conn()?;

        let sql = if older_than.is_some() {
            format!(
                "SELECT {SAGA_COLUMNS} FROM saga_instances \
                 WHERE status IN (:statuses) AND updated_at < :older_than \
                 ORDER BY updated_at ASC LIMIT :limit"
            )
        } else {
            format!(
                "SELECT {SAGA_COLUMNS} FROM saga_instances \
                 WHERE status IN (:statuses) \
                 ORDER BY updated_at ASC LIMIT :limit"
            )
        };

        let mut stmt = query(sql).bind_vec(
            ":statuses",
            statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect::<Vec<_>>(),
        );
        if let Some(older_than) = older_than {
            stmt = stmt.bind(":older_than", older_than as i64);
        }

        stmt.bind(":limit", limit as i64)
            .fetch_all(&conn)?
            .into_iter()
            .map(sql_row_to_saga)
            .collect()
    }

    async fn acquire_lock(
        &self,
        resource_key: &str,
        owner_saga_id: &Uuid,
        ttl: Duration,
    ) -> Result<Lease, Error> {
        self.in_tx(|conn| {
            let now = unix_time();
            let expires_at = now + ttl.as_secs();

            let current = query(
                r#"
                SELECT resource_key, owner_saga_id, acquired_at, expires_at
                FROM resource_locks
                WHERE resource_key = :resource_key
                "#,
            )
            .bind(":resource_key", resource_key.to_string())
            .fetch_one(conn)?
            .map(sql_row_to_lock)
            .transpose()?;

            match current {
                None => {
                    query(
                        r#"
                        INSERT INTO resource_locks
                        (resource_key, owner_saga_id, acquired_at, expires_at)
                        VALUES
                        (:resource_key, :owner_saga_id, :acquired_at, :expires_at)
                        "#,
                    )
                    .bind(":resource_key", resource_key.to_string())
                    .bind(":owner_saga_id", owner_saga_id.to_string())
                    .bind(":acquired_at", now as i64)
                    .bind(":expires_at", expires_at as i64)
                    .execute(conn)?;
                }
                Some(lock) if lock.owner_saga_id == *owner_saga_id => {
                    // Reentrant: same owner extends its lease
                    query(
                        r#"
                        UPDATE resource_locks
                        SET expires_at = :expires_at
                        WHERE resource_key = :resource_key
                        "#,
                    )
                    .bind(":expires_at", expires_at as i64)
                    .bind(":resource_key", resource_key.to_string())
                    .execute(conn)?;
                }
                Some(lock) if lock.expires_at <= now => {
                    // TTL expiry alone permits reclamation
                    query(
                        r#"
                        UPDATE resource_locks
                        SET owner_saga_id = :owner_saga_id,
                            acquired_at = :acquired_at,
                            expires_at = :expires_at
                        WHERE resource_key = :resource_key
                        "#,
                    )
                    .bind(":owner_saga_id", owner_saga_id.to_string())
                    .bind(":acquired_at", now as i64)
                    .bind(":expires_at", expires_at as i64)
                    .bind(":resource_key", resource_key.to_string())
                    .execute(conn)?;
                }
                Some(lock) => {
                    tracing::debug!(
                        "Lock on {} held by {} until {}",
                        resource_key,
                        lock.owner_saga_id,
                        lock.expires_at
                    );
                    return Err(Error::Locked(resource_key.to_string()));
                }
            }

            Ok(Lease {
                resource_key: resource_key.to_string(),
                owner_saga_id: *owner_saga_id,
                expires_at,
            })
        })
    }

    async fn renew_lock(&self, lease: &Lease, ttl: Duration) -> Result<Lease, Error> {
        let conn = self.conn()?;
        let expires_at = unix_time() + ttl.as_secs();

        let affected = query(
            r#"
            UPDATE resource_locks
            SET expires_at = :expires_at
            WHERE resource_key = :resource_key AND owner_saga_id = :owner_saga_id
            "#,
        )
        .bind(":expires_at", expires_at as i64)
        .bind(":resource_key", lease.resource_key.clone())
        .bind(":owner_saga_id", lease.owner_saga_id.to_string())
        .execute(&conn)?;

        if affected == 0 {
            return Err(Error::LeaseLost(lease.resource_key.clone()));
        }

        Ok(Lease {
            resource_key: lease.resource_key.clone(),
            owner_saga_id: lease.owner_saga_id,
            expires_at,
        })
    }

    async fn release_lock(&self, lease: &Lease) -> Result<(), Error> {
        let conn = self.conn()?;

        // Already absent is success
        query(
            r#"
            DELETE FROM resource_locks
            WHERE resource_key = :resource_key AND owner_saga_id = :owner_saga_id
            "#,
        )
        .bind(":resource_key", lease.resource_key.clone())
        .bind(":owner_saga_id", lease.owner_saga_id.to_string())
        .execute(&conn)?;

        Ok(())
    }

    async fn locks_held_by(&self, owner_saga_id: &Uuid) -> Result<Vec<LockRecord>, Error> {
        let conn = self.conn()?;

        query(
            r#"
            SELECT resource_key, owner_saga_id, acquired_at, expires_at
            FROM resource_locks
            WHERE owner_saga_id = :owner
            "#,
        )
        .bind(":owner", owner_saga_id.to_string())
        .fetch_all(&conn)?
        .into_iter()
        .map(sql_row_to_lock)
        .collect()
    }

    async fn put_idempotency(
        &self,
        key: &str,
        saga_id: &Uuid,
        outcome: &serde_json::Value,
    ) -> Result<(), Error> {
        self.in_tx(|conn| {
            if let Some(entry) = get_idempotency_row(conn, key)? {
                // Entries are immutable: the identical binding is a no-op
                if entry.saga_id == *saga_id && entry.outcome == *outcome {
                    return Ok(());
                }
                return Err(Error::IdempotencyConflict(key.to_string()));
            }

            query(
                r#"
                INSERT INTO idempotency_keys
                (key, saga_id, outcome, created_at)
                VALUES
                (:key, :saga_id, :outcome, :created_at)
                "#,
            )
            .bind(":key", key.to_string())
            .bind(":saga_id", saga_id.to_string())
            .bind(":outcome", serde_json::to_string(outcome)?)
            .bind(":created_at", unix_time() as i64)
            .execute(conn)?;

            Ok(())
        })
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyEntry>, Error> {
        let conn = self.conn()?;
        get_idempotency_row(&conn, key)
    }
}
