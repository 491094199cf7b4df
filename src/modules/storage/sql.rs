// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::envelope::{Email, Envelope, Protocol, Transport};
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::hash::HashKey;
use crate::modules::parts::PartsInfo;
use crate::modules::storage::{Chunk, Storage, StorageConfig};
use crate::{raise_error, utc_now};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;

struct Inner {
    pool: MySqlPool,
    email_table: String,
    chunks_table: String,
}

/// Relational engine over MySQL. Statement texts are built once per
/// shape and cached; sqlx keeps the matching server-side prepared
/// statements per pooled connection.
pub struct SqlStorage {
    inner: OnceCell<Inner>,
    /// One multi-select text per arity 1..N, so `get_chunks` runs a
    /// single `IN (?,…)` round-trip regardless of batch size.
    select_sql: Mutex<HashMap<usize, Arc<String>>>,
}

impl SqlStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(SqlStorage {
            inner: OnceCell::new(),
            select_sql: Mutex::new(HashMap::new()),
        })
    }

    fn inner(&self) -> MailVaultResult<&Inner> {
        self.inner.get().ok_or_else(|| {
            raise_error!(
                "sql storage used before initialize".into(),
                ErrorCode::MissingConfiguration
            )
        })
    }

    fn multi_select(&self, arity: usize) -> Arc<String> {
        let mut cache = self.select_sql.lock().unwrap();
        if let Some(sql) = cache.get(&arity) {
            return Arc::clone(sql);
        }
        let table = &self.inner.get().unwrap().chunks_table;
        let sql = Arc::new(multi_select_sql(table, arity));
        cache.insert(arity, Arc::clone(&sql));
        sql
    }

    async fn create_tables(&self) -> MailVaultResult<()> {
        let inner = self.inner()?;
        let emails = format!(
            "CREATE TABLE IF NOT EXISTS `{}` (\
             `mail_id` BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,\
             `created_at` BIGINT NOT NULL,\
             `size` BIGINT UNSIGNED NOT NULL DEFAULT 0,\
             `from` VARCHAR(255) NOT NULL DEFAULT '',\
             `to` VARCHAR(255) NOT NULL DEFAULT '',\
             `parts_info` MEDIUMBLOB,\
             `helo` VARCHAR(255) NOT NULL DEFAULT '',\
             `subject` VARCHAR(998) NOT NULL DEFAULT '',\
             `queued_id` BINARY(16),\
             `recipient` VARCHAR(255) NOT NULL DEFAULT '',\
             `ipv4_addr` INT UNSIGNED NOT NULL DEFAULT 0,\
             `ipv6_addr` BINARY(16) NOT NULL,\
             `return_path` VARCHAR(255) NOT NULL DEFAULT '',\
             `protocol` ENUM('SMTP','SMTPS','ESMTP','ESMTPS','LMTP','LMTPS','unknown') \
             NOT NULL DEFAULT 'unknown',\
             `transport` ENUM('7bit','8bit','unknown','invalid') NOT NULL DEFAULT 'unknown',\
             `finalized` TINYINT(1) NOT NULL DEFAULT 0\
             )",
            inner.email_table
        );
        let chunks = format!(
            "CREATE TABLE IF NOT EXISTS `{}` (\
             `modified_at` BIGINT NOT NULL,\
             `reference_count` INT UNSIGNED NOT NULL DEFAULT 1,\
             `data` MEDIUMBLOB NOT NULL,\
             `hash` BINARY(16) NOT NULL,\
             UNIQUE KEY `hash` (`hash`)\
             )",
            inner.chunks_table
        );
        sqlx::query(&emails)
            .execute(&inner.pool)
            .await
            .map_err(storage_err)?;
        sqlx::query(&chunks)
            .execute(&inner.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    fn email_from_row(row: &MySqlRow) -> MailVaultResult<Email> {
        let ipv4: u32 = row.try_get("ipv4_addr").map_err(storage_err)?;
        let ipv6: Vec<u8> = row.try_get("ipv6_addr").map_err(storage_err)?;
        let remote_ip = if ipv4 != 0 {
            Some(IpAddr::from(std::net::Ipv4Addr::from(ipv4)))
        } else {
            let octets: Option<[u8; 16]> = ipv6.as_slice().try_into().ok();
            octets
                .filter(|o| o.iter().any(|&b| b != 0))
                .map(|o| IpAddr::from(std::net::Ipv6Addr::from(o)))
        };
        let queued: Option<Vec<u8>> = row.try_get("queued_id").map_err(storage_err)?;
        let parts_blob: Option<Vec<u8>> = row.try_get("parts_info").map_err(storage_err)?;
        let protocol: String = row.try_get("protocol").map_err(storage_err)?;
        let transport: String = row.try_get("transport").map_err(storage_err)?;
        let finalized: i8 = row.try_get("finalized").map_err(storage_err)?;
        Ok(Email {
            mail_id: row.try_get("mail_id").map_err(storage_err)?,
            created_at: row.try_get("created_at").map_err(storage_err)?,
            size: row.try_get("size").map_err(storage_err)?,
            from: row.try_get("from").map_err(storage_err)?,
            to: row.try_get("to").map_err(storage_err)?,
            helo: row.try_get("helo").map_err(storage_err)?,
            recipient: row.try_get("recipient").map_err(storage_err)?,
            return_path: row.try_get("return_path").map_err(storage_err)?,
            subject: row.try_get("subject").map_err(storage_err)?,
            queued_id: match queued {
                Some(bytes) => HashKey::from_slice(&bytes)?,
                None => HashKey::default(),
            },
            remote_ip,
            protocol: protocol.parse::<Protocol>().unwrap_or_default(),
            transport: transport.parse::<Transport>().unwrap_or_default(),
            parts_info: match parts_blob {
                Some(blob) => Some(PartsInfo::from_blob(&blob)?),
                None => None,
            },
            finalized: finalized != 0,
        })
    }
}

fn storage_err<E: std::fmt::Debug>(e: E) -> crate::modules::error::MailVaultError {
    raise_error!(format!("{:#?}", e), ErrorCode::StorageError)
}

/// `SELECT … WHERE hash IN (?,…)` with `arity` placeholders.
pub(crate) fn multi_select_sql(table: &str, arity: usize) -> String {
    let mut sql = format!("SELECT `data`, `hash` FROM `{}` WHERE `hash` IN (", table);
    for i in 0..arity {
        if i > 0 {
            sql.push(',');
        }
        sql.push('?');
    }
    sql.push(')');
    sql
}

fn ip_columns(remote_ip: Option<IpAddr>) -> (u32, [u8; 16]) {
    match remote_ip {
        Some(IpAddr::V4(v4)) => (u32::from(v4), [0u8; 16]),
        Some(IpAddr::V6(v6)) => (0, v6.octets()),
        None => (0, [0u8; 16]),
    }
}

#[async_trait]
impl Storage for SqlStorage {
    async fn initialize(&self, config: &StorageConfig) -> MailVaultResult<()> {
        if config.sql_driver != "mysql" {
            return Err(raise_error!(
                format!("unsupported sql driver {:?}", config.sql_driver),
                ErrorCode::MissingConfiguration
            ));
        }
        let dsn = config.sql_dsn.as_deref().ok_or_else(|| {
            raise_error!(
                "sql storage selected but sql_dsn is not set".into(),
                ErrorCode::MissingConfiguration
            )
        })?;
        let pool = MySqlPoolOptions::new()
            .max_connections(config.sql_max_open_conns)
            .min_connections(config.sql_max_idle_conns)
            .max_lifetime(Duration::from_secs(config.sql_max_conn_lifetime))
            .connect(dsn)
            .await
            .map_err(storage_err)?;
        self.inner
            .set(Inner {
                pool,
                email_table: config.email_table.clone(),
                chunks_table: config.email_table_chunks.clone(),
            })
            .map_err(|_| {
                raise_error!(
                    "sql storage initialized twice".into(),
                    ErrorCode::InternalError
                )
            })?;
        self.create_tables().await?;
        info!(
            "sql storage ready, tables [{}] and [{}]",
            config.email_table, config.email_table_chunks
        );
        Ok(())
    }

    async fn open_message(&self, envelope: &Envelope) -> MailVaultResult<u64> {
        let inner = self.inner()?;
        let (ipv4, ipv6) = ip_columns(envelope.remote_ip);
        let sql = format!(
            "INSERT INTO `{}` (`created_at`, `from`, `to`, `helo`, `recipient`, \
             `return_path`, `queued_id`, `ipv4_addr`, `ipv6_addr`, `protocol`, `transport`) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?)",
            inner.email_table
        );
        let result = sqlx::query(&sql)
            .bind(utc_now!())
            .bind(&envelope.from)
            .bind(&envelope.to)
            .bind(&envelope.helo)
            .bind(&envelope.recipient)
            .bind(&envelope.return_path)
            .bind(envelope.queued_id.as_bytes().as_slice())
            .bind(ipv4)
            .bind(ipv6.as_slice())
            .bind(envelope.protocol.to_string())
            .bind(envelope.transport.to_string())
            .execute(&inner.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.last_insert_id())
    }

    async fn close_message(
        &self,
        mail_id: u64,
        size: u64,
        parts_info: &PartsInfo,
        subject: &str,
        queued_id: &HashKey,
        to: &str,
        from: &str,
    ) -> MailVaultResult<()> {
        let inner = self.inner()?;
        let blob = parts_info.to_blob()?;
        let sql = format!(
            "UPDATE `{}` SET `size`=?, `parts_info`=?, `subject`=?, `queued_id`=?, \
             `to`=?, `from`=?, `finalized`=1 WHERE `mail_id`=?",
            inner.email_table
        );
        let result = sqlx::query(&sql)
            .bind(size)
            .bind(&blob)
            .bind(subject)
            .bind(queued_id.as_bytes().as_slice())
            .bind(to)
            .bind(from)
            .bind(mail_id)
            .execute(&inner.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(raise_error!(
                format!("message {} not open", mail_id),
                ErrorCode::MessageNotFound
            ));
        }
        Ok(())
    }

    async fn add_chunk(&self, data: &[u8], hash: &HashKey) -> MailVaultResult<()> {
        let inner = self.inner()?;
        let sql = format!(
            "INSERT INTO `{}` (`modified_at`, `reference_count`, `data`, `hash`) \
             VALUES (?,1,?,?) \
             ON DUPLICATE KEY UPDATE `reference_count`=`reference_count`+1, \
             `modified_at`=VALUES(`modified_at`)",
            inner.chunks_table
        );
        sqlx::query(&sql)
            .bind(utc_now!())
            .bind(data)
            .bind(hash.as_bytes().as_slice())
            .execute(&inner.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_message(&self, mail_id: u64) -> MailVaultResult<Email> {
        let inner = self.inner()?;
        let sql = format!("SELECT * FROM `{}` WHERE `mail_id`=?", inner.email_table);
        let row = sqlx::query(&sql)
            .bind(mail_id)
            .fetch_optional(&inner.pool)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| {
                raise_error!(
                    format!("message {} not found", mail_id),
                    ErrorCode::MessageNotFound
                )
            })?;
        Self::email_from_row(&row)
    }

    async fn get_chunks(&self, hashes: &[HashKey]) -> MailVaultResult<Vec<Chunk>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner()?;
        let sql = self.multi_select(hashes.len());
        let mut query = sqlx::query(sql.as_str());
        for hash in hashes {
            query = query.bind(hash.as_bytes().as_slice());
        }
        let rows = query.fetch_all(&inner.pool).await.map_err(storage_err)?;
        // rows come back in whatever order the engine liked; match them
        // up to the request order
        let mut by_hash: HashMap<HashKey, Vec<u8>> = HashMap::with_capacity(rows.len());
        for row in rows {
            let hash: Vec<u8> = row.try_get("hash").map_err(storage_err)?;
            let data: Vec<u8> = row.try_get("data").map_err(storage_err)?;
            by_hash.insert(HashKey::from_slice(&hash)?, data);
        }
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let data = by_hash.get(hash).cloned().ok_or_else(|| {
                raise_error!(format!("chunk {} missing", hash), ErrorCode::ChunkMissing)
            })?;
            out.push(Chunk { data });
        }
        Ok(out)
    }

    async fn delete_message(&self, mail_id: u64) -> MailVaultResult<u64> {
        let inner = self.inner()?;
        let email = self.get_message(mail_id).await?;
        let mut tx = inner.pool.begin().await.map_err(storage_err)?;
        let now = utc_now!();
        let decrement = format!(
            "UPDATE `{}` SET `reference_count`=`reference_count`-1, `modified_at`=? \
             WHERE `hash`=? AND `reference_count` > 0",
            inner.chunks_table
        );
        let mut released = 0u64;
        if let Some(parts_info) = &email.parts_info {
            for part in &parts_info.parts {
                for hash in &part.chunk_hashes {
                    sqlx::query(&decrement)
                        .bind(now)
                        .bind(hash.as_bytes().as_slice())
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                    released += 1;
                }
            }
        }
        let delete = format!("DELETE FROM `{}` WHERE `mail_id`=?", inner.email_table);
        sqlx::query(&delete)
            .bind(mail_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(released)
    }

    async fn sweep(&self, grace_millis: i64) -> MailVaultResult<u64> {
        let inner = self.inner()?;
        let cutoff = utc_now!() - grace_millis;
        let chunks = format!(
            "DELETE FROM `{}` WHERE `reference_count`=0 AND `modified_at` <= ?",
            inner.chunks_table
        );
        let removed_chunks = sqlx::query(&chunks)
            .bind(cutoff)
            .execute(&inner.pool)
            .await
            .map_err(storage_err)?
            .rows_affected();
        let emails = format!(
            "DELETE FROM `{}` WHERE `finalized`=0 AND `created_at` <= ?",
            inner.email_table
        );
        let removed_emails = sqlx::query(&emails)
            .bind(cutoff)
            .execute(&inner.pool)
            .await
            .map_err(storage_err)?
            .rows_affected();
        Ok(removed_chunks + removed_emails)
    }

    async fn shutdown(&self) -> MailVaultResult<()> {
        if let Some(inner) = self.inner.get() {
            inner.pool.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_select_statement_per_arity() {
        assert_eq!(
            multi_select_sql("in_emails_chunks", 1),
            "SELECT `data`, `hash` FROM `in_emails_chunks` WHERE `hash` IN (?)"
        );
        assert_eq!(
            multi_select_sql("in_emails_chunks", 3),
            "SELECT `data`, `hash` FROM `in_emails_chunks` WHERE `hash` IN (?,?,?)"
        );
    }

    #[test]
    fn ip_column_split() {
        let (v4, v6) = ip_columns(Some("203.0.113.9".parse().unwrap()));
        assert_eq!(v4, 0xCB00_7109);
        assert_eq!(v6, [0u8; 16]);
        let (v4, v6) = ip_columns(Some("2001:db8::1".parse().unwrap()));
        assert_eq!(v4, 0);
        assert_eq!(&v6[..4], &[0x20, 0x01, 0x0d, 0xb8]);
    }

    #[tokio::test]
    async fn uninitialized_storage_refuses_work() {
        let storage = SqlStorage::new();
        let err = storage.get_message(1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
    }

    #[tokio::test]
    async fn missing_dsn_is_a_config_error() {
        let storage = SqlStorage::new();
        let err = storage
            .initialize(&StorageConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
    }
}
