// backuptool/src/mysql/mod.rs
//! Boundary to the live MySQL server via the `mysql` client binary:
//! queries the data directory and the database list from tabular output.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Schemas that are never part of a logical database inventory.
const SYSTEM_DATABASES: [&str; 3] = ["information_schema", "sys", "performance_schema"];

#[derive(Debug, Clone)]
pub struct MysqlInfo {
    pub data_dir: PathBuf,
    pub server_version: String,
    pub databases: Vec<String>,
}

/// Queries the live server for its data directory, version, and database
/// list.
pub async fn load(mysql_bin: &str) -> Result<MysqlInfo> {
    let data_dir = query_data_dir(mysql_bin).await?;
    let server_version = query_server_version(mysql_bin).await?;
    let databases = list_databases(mysql_bin).await?;
    debug!("MySQL data directory: {}", data_dir.display());
    debug!("MySQL server version: {}", server_version);
    debug!("databases: {:?}", databases);
    Ok(MysqlInfo {
        data_dir,
        server_version,
        databases,
    })
}

/// `SELECT @@datadir` through the client, skipping the column header.
pub async fn query_data_dir(mysql_bin: &str) -> Result<PathBuf> {
    let output = run_client(mysql_bin, "SELECT @@datadir").await?;
    let value = parse_single_value(&output).context("Unexpected output for SELECT @@datadir")?;
    Ok(PathBuf::from(value))
}

/// `SELECT @@version` through the client, e.g. "8.0.36-0ubuntu0.22.04.1".
pub async fn query_server_version(mysql_bin: &str) -> Result<String> {
    let output = run_client(mysql_bin, "SELECT @@version").await?;
    parse_single_value(&output).context("Unexpected output for SELECT @@version")
}

/// `SHOW DATABASES` through the client, with system schemas filtered out.
pub async fn list_databases(mysql_bin: &str) -> Result<Vec<String>> {
    let output = run_client(mysql_bin, "show databases").await?;
    Ok(parse_database_list(&output))
}

async fn run_client(mysql_bin: &str, statement: &str) -> Result<String> {
    let output = Command::new(mysql_bin)
        .arg("-N")
        .arg("-e")
        .arg(statement)
        .output()
        .await
        .with_context(|| format!("Failed to execute MySQL client: {}", mysql_bin))?;
    if !output.status.success() {
        anyhow::bail!(
            "MySQL client failed for '{}' with status {}: {}",
            statement,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_single_value(output: &str) -> Option<String> {
    let value = output.trim();
    if value.is_empty() || value.lines().count() != 1 {
        return None;
    }
    Some(value.to_string())
}

fn parse_database_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|db| !SYSTEM_DATABASES.contains(db))
        .map(str::to_string)
        .collect()
}
