//! PostgreSQL source and Redshift warehouse over `tokio-postgres`

use super::{
    checked_identifier, connection_info, nested_query, CopyOptions, CopySource, ExportStats,
    SourceDatabase, Warehouse,
};
use crate::config::CopyCredentials;
use crate::error::{Error, Result};
use crate::template::{self, TemplateContext};
use crate::types::sql_literal;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_postgres::{Client, NoTls};

/// Open a client and drive its connection on a background task
async fn connect(url: &str, role: &'static str) -> std::result::Result<Client, tokio_postgres::Error> {
    tracing::info!(url = %connection_info(url), "Connecting to {}", role);
    let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "{} connection closed", role);
        }
    });
    Ok(client)
}

/// Server message of a database error, or the client-side description
fn describe(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => db.message().to_string(),
        None => e.to_string(),
    }
}

// ============================================================================
// Source
// ============================================================================

/// PostgreSQL source exporting with `COPY ... TO STDOUT`
#[derive(Debug)]
pub struct PostgresSource {
    client: Client,
}

impl PostgresSource {
    /// Connect to the source database
    pub async fn connect(url: &str) -> Result<Self> {
        let client = connect(url, "source database")
            .await
            .map_err(|e| Error::source_query(format!("Failed to connect: {}", describe(&e))))?;
        Ok(Self { client })
    }

    /// Borrow the client
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn stream_to_file(&self, sql: &str, dest: &Path) -> Result<ExportStats> {
        let stream = self
            .client
            .copy_out(sql)
            .await
            .map_err(|e| Error::source_query(describe(&e)))?;
        futures::pin_mut!(stream);

        let mut file = tokio::fs::File::create(dest).await?;
        let mut bytes = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::source_query(describe(&e)))?;
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(ExportStats { rows: None, bytes })
    }
}

#[async_trait]
impl SourceDatabase for PostgresSource {
    async fn export_delimited(&mut self, query: &str, dest: &Path) -> Result<ExportStats> {
        let sql = export_statement(query);
        tracing::debug!(path = %dest.display(), "Exporting query: {}", query);

        match self.stream_to_file(&sql, dest).await {
            Ok(stats) => Ok(stats),
            Err(e) => {
                let _ = tokio::fs::remove_file(dest).await;
                Err(e)
            }
        }
    }
}

/// `COPY` statement streaming a query in the shared delimited format
fn export_statement(query: &str) -> String {
    format!(
        "COPY ({}) TO STDOUT WITH DELIMITER '|' CSV FORCE QUOTE *",
        nested_query(query)
    )
}

// ============================================================================
// Warehouse
// ============================================================================

/// Redshift warehouse loading from S3 with `COPY ... FROM`
pub struct RedshiftWarehouse {
    client: Client,
    region: String,
    credentials: CopyCredentials,
}

impl RedshiftWarehouse {
    /// Connect to the warehouse
    ///
    /// Credential templates (`{{ env.NAME }}`) are rendered here so a missing
    /// variable fails before any work.
    pub async fn connect(url: &str, region: String, credentials: CopyCredentials) -> Result<Self> {
        let credentials = render_credentials(&credentials)?;
        let client = connect(url, "warehouse")
            .await
            .map_err(|e| Error::warehouse(format!("Failed to connect: {}", describe(&e))))?;
        Ok(Self {
            client,
            region,
            credentials,
        })
    }

    async fn batch(&self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| Error::warehouse(describe(&e)))
    }
}

#[async_trait]
impl Warehouse for RedshiftWarehouse {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.batch(sql).await
    }

    async fn begin(&mut self) -> Result<()> {
        self.batch("BEGIN").await
    }

    async fn commit(&mut self) -> Result<()> {
        self.batch("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.batch("ROLLBACK").await
    }

    async fn create_table_like(&mut self, staging: &str, target: &str) -> Result<()> {
        let staging = checked_identifier(staging)?;
        let target = checked_identifier(target)?;
        self.batch(&format!(
            "CREATE TABLE IF NOT EXISTS {staging} (LIKE {target})"
        ))
        .await
    }

    async fn truncate(&mut self, table: &str) -> Result<()> {
        let table = checked_identifier(table)?;
        self.batch(&format!("TRUNCATE {table}")).await
    }

    async fn copy_in(
        &mut self,
        table: &str,
        source: &CopySource,
        options: &CopyOptions,
    ) -> Result<u64> {
        let table = checked_identifier(table)?;
        let sql = copy_statement(
            table,
            &source.prefix,
            &self.credentials,
            &self.region,
            options.max_errors,
        );
        tracing::debug!(table, prefix = %source.prefix, "Copying into staging");
        self.batch(&sql).await?;

        let row = self
            .client
            .query_one("SELECT pg_last_copy_count()", &[])
            .await
            .map_err(|e| Error::warehouse(describe(&e)))?;
        let rows: i64 = row
            .try_get(0)
            .map_err(|e| Error::warehouse(describe(&e)))?;
        Ok(rows as u64)
    }
}

fn render_credentials(credentials: &CopyCredentials) -> Result<CopyCredentials> {
    let ctx = TemplateContext::new();
    Ok(match credentials {
        CopyCredentials::IamRole(arn) => CopyCredentials::IamRole(template::render(arn, &ctx)?),
        CopyCredentials::AccessKeys {
            access_key_id,
            secret_access_key,
        } => CopyCredentials::AccessKeys {
            access_key_id: template::render(access_key_id, &ctx)?,
            secret_access_key: template::render(secret_access_key, &ctx)?,
        },
    })
}

/// Redshift `COPY` reading every gzip object under a prefix
fn copy_statement(
    table: &str,
    prefix: &str,
    credentials: &CopyCredentials,
    region: &str,
    max_errors: u64,
) -> String {
    let credentials = match credentials {
        CopyCredentials::IamRole(arn) => format!("IAM_ROLE {}", sql_literal(arn)),
        CopyCredentials::AccessKeys {
            access_key_id,
            secret_access_key,
        } => format!(
            "ACCESS_KEY_ID {} SECRET_ACCESS_KEY {}",
            sql_literal(access_key_id),
            sql_literal(secret_access_key)
        ),
    };

    format!(
        "COPY {table} FROM {} {credentials} CSV DELIMITER '|' GZIP BLANKSASNULL \
         ACCEPTANYDATE ACCEPTINVCHARS DATEFORMAT 'auto' TIMEFORMAT 'auto' \
         COMPUPDATE ON MAXERROR {max_errors} REGION {}",
        sql_literal(prefix),
        sql_literal(region)
    )
}
