// dbstream/src/connection/mod.rs
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tracing::{debug, info};

use crate::config::{ConnectionConfig, DatabaseKind};
use crate::errors::{PipelineError, Result};

/// Opens live connections to the database server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionAdapter: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DatabaseSession>>;
}

/// One open connection, used for pre-flight queries only.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseSession: Send {
    /// Raw `SELECT version()` text.
    async fn server_version(&mut self) -> Result<String>;

    /// Creates `name` unless it exists. Returns whether it was created.
    async fn ensure_database(&mut self, name: &str) -> Result<bool>;

    async fn close(&mut self) -> Result<()>;
}

pub struct SqlxAdapter;

#[async_trait]
impl ConnectionAdapter for SqlxAdapter {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DatabaseSession>> {
        let target = format!("{}:{}/{}", config.host, config.port, config.database);
        let connection_error =
            |e: sqlx::Error| PipelineError::Connection(format!("Failed to connect to {}: {}", target, e));

        let conn = match config.kind {
            DatabaseKind::Postgres => {
                let options = PgConnectOptions::new()
                    .host(&config.host)
                    .port(config.port)
                    .username(&config.user)
                    .password(&config.password)
                    .database(&config.database);
                SqlxConnection::Postgres(
                    PgConnection::connect_with(&options)
                        .await
                        .map_err(connection_error)?,
                )
            }
            DatabaseKind::MySql => {
                let options = MySqlConnectOptions::new()
                    .host(&config.host)
                    .port(config.port)
                    .username(&config.user)
                    .password(&config.password)
                    .database(&config.database);
                SqlxConnection::MySql(
                    MySqlConnection::connect_with(&options)
                        .await
                        .map_err(connection_error)?,
                )
            }
        };

        info!("✨ Connected successfully to {} ({})", target, config.kind);
        Ok(Box::new(SqlxSession { conn: Some(conn) }))
    }
}

enum SqlxConnection {
    Postgres(PgConnection),
    MySql(MySqlConnection),
}

struct SqlxSession {
    conn: Option<SqlxConnection>,
}

impl SqlxSession {
    fn conn(&mut self) -> Result<&mut SqlxConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| PipelineError::Connection("connection already closed".to_string()))
    }
}

/// `"name"` with embedded quotes doubled.
fn quote_pg_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `` `name` `` with embedded backticks doubled.
fn quote_mysql_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[async_trait]
impl DatabaseSession for SqlxSession {
    async fn server_version(&mut self) -> Result<String> {
        let query_error =
            |e: sqlx::Error| PipelineError::Connection(format!("Failed to query server version: {}", e));

        let version: String = match self.conn()? {
            SqlxConnection::Postgres(conn) => sqlx::query_scalar::<_, String>("SELECT version()")
                .fetch_one(conn)
                .await
                .map_err(query_error)?,
            SqlxConnection::MySql(conn) => sqlx::query_scalar::<_, String>("SELECT version()")
                .fetch_one(conn)
                .await
                .map_err(query_error)?,
        };
        debug!("Server reports version: {}", version);
        Ok(version)
    }

    async fn ensure_database(&mut self, name: &str) -> Result<bool> {
        let prepare_error =
            |e: sqlx::Error| PipelineError::Prepare(format!("database '{}': {}", name, e));

        match self.conn()? {
            SqlxConnection::Postgres(conn) => {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                        .bind(name)
                        .fetch_one(&mut *conn)
                        .await
                        .map_err(prepare_error)?;
                if exists {
                    info!("Database '{}' already exists on the target server.", name);
                    return Ok(false);
                }
                sqlx::query(&format!("CREATE DATABASE {}", quote_pg_identifier(name)))
                    .execute(&mut *conn)
                    .await
                    .map_err(prepare_error)?;
            }
            SqlxConnection::MySql(conn) => {
                let result = sqlx::query(&format!(
                    "CREATE DATABASE IF NOT EXISTS {}",
                    quote_mysql_identifier(name)
                ))
                .execute(&mut *conn)
                .await
                .map_err(prepare_error)?;
                if result.rows_affected() == 0 {
                    info!("Database '{}' already exists on the target server.", name);
                    return Ok(false);
                }
            }
        }
        info!("✓ Database '{}' created.", name);
        Ok(true)
    }

    async fn close(&mut self) -> Result<()> {
        let close_error = |e: sqlx::Error| PipelineError::Connection(format!("Failed to close connection: {}", e));
        match self.conn.take() {
            Some(SqlxConnection::Postgres(conn)) => conn.close().await.map_err(close_error)?,
            Some(SqlxConnection::MySql(conn)) => conn.close().await.map_err(close_error)?,
            None => {}
        }
        debug!("Connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_pg_identifier("app"), "\"app\"");
        assert_eq!(quote_pg_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_mysql_identifier("shop"), "`shop`");
        assert_eq!(quote_mysql_identifier("sh`op"), "`sh``op`");
    }

    #[tokio::test]
    async fn test_closed_session_rejects_queries() {
        let mut session = SqlxSession { conn: None };
        assert!(session.server_version().await.is_err());
        assert!(session.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_connection_error() {
        let config = ConnectionConfig {
            kind: DatabaseKind::Postgres,
            host: "127.0.0.1".into(),
            port: 1,
            user: "svc".into(),
            password: String::new(),
            database: "app".into(),
        };
        let err = SqlxAdapter.connect(&config).await.err().expect("nothing listens on port 1");
        assert_eq!(err.stage(), crate::errors::Stage::Connect);
    }
}
