use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

pub const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

pub async fn init_sqlite_pool(db_path: &str) -> Result<SqlitePool, SqliteInitError> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| SqliteInitError::Io(e.to_string()))?;
        }
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path);
    let options = SqliteConnectOptions::from_str(&db_url)
        .map_err(|e| SqliteInitError::Config(e.to_string()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(SqliteInitError::Sqlx)?;

    run_sqlite_migrations(&pool).await?;

    Ok(pool)
}

pub async fn run_sqlite_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    let version: Option<String> =
        sqlx::query_scalar(r#"SELECT "value" FROM "_db_metadata" WHERE "key" = 'schema_version'"#)
            .fetch_optional(pool)
            .await
            .unwrap_or(None);

    if version.is_some() {
        return Ok(());
    }

    let statements = split_sql_statements(SCHEMA_SQL);
    for stmt in statements {
        let sql: String = stmt
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            continue;
        }
        sqlx::query(trimmed)
            .execute(pool)
            .await
            .map_err(SqliteInitError::Sqlx)?;
    }

    sqlx::query(
        r#"INSERT OR REPLACE INTO "_db_metadata" ("key", "value") VALUES ('schema_version', '1.0.0')"#,
    )
    .execute(pool)
    .await
    .map_err(SqliteInitError::Sqlx)?;

    Ok(())
}

pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut in_line_comment = false;
    let mut prev = '\0';

    for ch in sql.chars() {
        match ch {
            // Inside a "--" comment nothing is syntax until the line ends.
            '\n' if in_line_comment => {
                in_line_comment = false;
            }
            '-' if !in_single_quote && !in_double_quote && !in_line_comment && prev == '-' => {
                in_line_comment = true;
            }
            '\'' if !in_double_quote && !in_line_comment && prev != '\\' => {
                in_single_quote = !in_single_quote;
            }
            '"' if !in_single_quote && !in_line_comment => {
                in_double_quote = !in_double_quote;
            }
            ';' if !in_single_quote && !in_double_quote && !in_line_comment => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
                prev = ch;
                continue;
            }
            _ => {}
        }

        current.push(ch);
        prev = ch;
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }

    statements
}

#[derive(Debug, thiserror::Error)]
pub enum SqliteInitError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}
