//! Civic record and draft rows

use std::str::FromStr;

use async_trait::async_trait;
use civica_common::database::{Error, RecordStore};
use civica_common::record::{Draft, Record, RecordStatus};

use crate::stmt::{query, Column};
use crate::{column_as_number, column_as_string, unpack_into, CivicaSqliteDatabase};

fn sql_row_to_record(row: Vec<Column>) -> Result<Record, Error> {
    unpack_into!(
        let (
            id,
            title,
            record_type,
            status,
            body,
            path,
            created_at,
            updated_at
        ) = row
    );

    let status = RecordStatus::from_str(&column_as_string!(&status)).map_err(Error::Internal)?;
    let created_at: u64 = column_as_number!(created_at);
    let updated_at: u64 = column_as_number!(updated_at);

    Ok(Record {
        id: column_as_string!(&id),
        title: column_as_string!(&title),
        record_type: column_as_string!(&record_type),
        status,
        body: column_as_string!(&body),
        path: column_as_string!(&path),
        created_at,
        updated_at,
    })
}

fn sql_row_to_draft(row: Vec<Column>) -> Result<Draft, Error> {
    unpack_into!(
        let (
            id,
            title,
            record_type,
            body,
            created_at,
            updated_at
        ) = row
    );

    let created_at: u64 = column_as_number!(created_at);
    let updated_at: u64 = column_as_number!(updated_at);

    Ok(Draft {
        id: column_as_string!(&id),
        title: column_as_string!(&title),
        record_type: column_as_string!(&record_type),
        body: column_as_string!(&body),
        created_at,
        updated_at,
    })
}

#[async_trait]
impl RecordStore for CivicaSqliteDatabase {
    async fn insert_record(&self, record: &Record) -> Result<(), Error> {
        let conn = self.conn()?;

        query(
            r#"
            INSERT INTO records
            (id, title, record_type, status, body, path, created_at, updated_at)
            VALUES
            (:id, :title, :record_type, :status, :body, :path, :created_at, :updated_at)
            "#,
        )
        .bind(":id", record.id.clone())
        .bind(":title", record.title.clone())
        .bind(":record_type", record.record_type.clone())
        .bind(":status", record.status.as_str().to_string())
        .bind(":body", record.body.clone())
        .bind(":path", record.path.clone())
        .bind(":created_at", record.created_at as i64)
        .bind(":updated_at", record.updated_at as i64)
        .execute(&conn)?;

        Ok(())
    }

    async fn get_record(&self, id: &str) -> Result<Option<Record>, Error> {
        let conn = self.conn()?;

        query(
            r#"
            SELECT id, title, record_type, status, body, path, created_at, updated_at
            FROM records
            WHERE id = :id
            "#,
        )
        .bind(":id", id.to_string())
        .fetch_one(&conn)?
        .map(sql_row_to_record)
        .transpose()
    }

    async fn update_record(&self, record: &Record) -> Result<(), Error> {
        let conn = self.conn()?;

        let affected = query(
            r#"
            UPDATE records
            SET title = :title,
                record_type = :record_type,
                status = :status,
                body = :body,
                path = :path,
                updated_at = :updated_at
            WHERE id = :id
            "#,
        )
        .bind(":title", record.title.clone())
        .bind(":record_type", record.record_type.clone())
        .bind(":status", record.status.as_str().to_string())
        .bind(":body", record.body.clone())
        .bind(":path", record.path.clone())
        .bind(":updated_at", record.updated_at as i64)
        .bind(":id", record.id.clone())
        .execute(&conn)?;

        if affected == 0 {
            return Err(Error::RecordNotFound(record.id.clone()));
        }

        Ok(())
    }

    async fn delete_record(&self, id: &str) -> Result<(), Error> {
        let conn = self.conn()?;

        // Already absent is success
        query("DELETE FROM records WHERE id = :id")
            .bind(":id", id.to_string())
            .execute(&conn)?;

        Ok(())
    }

    async fn insert_draft(&self, draft: &Draft) -> Result<(), Error> {
        let conn = self.conn()?;

        query(
            r#"
            INSERT INTO drafts
            (id, title, record_type, body, created_at, updated_at)
            VALUES
            (:id, :title, :record_type, :body, :created_at, :updated_at)
            "#,
        )
        .bind(":id", draft.id.clone())
        .bind(":title", draft.title.clone())
        .bind(":record_type", draft.record_type.clone())
        .bind(":body", draft.body.clone())
        .bind(":created_at", draft.created_at as i64)
        .bind(":updated_at", draft.updated_at as i64)
        .execute(&conn)?;

        Ok(())
    }

    async fn get_draft(&self, id: &str) -> Result<Option<Draft>, Error> {
        let conn = self.conn()?;

        query(
            r#"
            SELECT id, title, record_type, body, created_at, updated_at
            FROM drafts
            WHERE id = :id
            "#,
        )
        .bind(":id", id.to_string())
        .fetch_one(&conn)?
        .map(sql_row_to_draft)
        .transpose()
    }

    async fn delete_draft(&self, id: &str) -> Result<(), Error> {
        let conn = self.conn()?;

        // Already absent is success
        query("DELETE FROM drafts WHERE id = :id")
            .bind(":id", id.to_string())
            .execute(&conn)?;

        Ok(())
    }

    async fn list_records(&self, limit: usize) -> Result<Vec<Record>, Error> {
        let conn = self.conn()?;

        query(
            r#"
            SELECT id, title, record_type, status, body, path, created_at, updated_at
            FROM records
            ORDER BY updated_at DESC
            LIMIT :limit
            "#,
        )
        .bind(":limit", limit as i64)
        .fetch_all(&conn)?
        .into_iter()
        .map(sql_row_to_record)
        .collect()
    }
}
