//! `PostgreSQL` plugin database
//!
//! Scripts and queries use `%(name)s` named parameters. They are rewritten to
//! positional `$n` placeholders and bound with the type the server expects
//! for each position, so plain JSON values work for the common column types.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use pipeline_core::{ConnectorConfig, ConnectorError, Database, Params, Row};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConnection {
    pub host: String,
    pub port: u16,
    /// Database name
    pub name: String,
    pub user: String,
    pub password: String,
    /// Connect timeout in seconds
    pub timeout: u64,
}

impl Default for PostgresConnection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            timeout: 5,
        }
    }
}

impl PostgresConnection {
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} connect_timeout={}",
            self.host, self.port, self.name, self.user, self.password, self.timeout
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PostgresOptions {
    connection: PostgresConnection,
    init: Option<PathBuf>,
}

/// Connects on `initialize` and reconnects when the previous connection closed
pub struct PostgresDatabase {
    connection: PostgresConnection,
    init: Option<PathBuf>,
    client: Mutex<Option<Arc<Client>>>,
}

impl PostgresDatabase {
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let options: PostgresOptions = config.options()?;
        Ok(Self {
            connection: options.connection,
            init: options.init,
            client: Mutex::new(None),
        })
    }

    async fn client(&self) -> Result<Arc<Client>, ConnectorError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref().filter(|c| !c.is_closed()) {
            return Ok(client.clone());
        }

        debug!(
            "Establishing connection towards {}:{}",
            self.connection.host, self.connection.port
        );
        let (client, connection) = tokio_postgres::connect(&self.connection.connection_string(), NoTls)
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        let client = Arc::new(client);
        *slot = Some(client.clone());
        Ok(client)
    }
}

fn query_error(e: tokio_postgres::Error) -> ConnectorError {
    if e.is_closed() {
        ConnectorError::Connection(e.to_string())
    } else {
        ConnectorError::Query(e.to_string())
    }
}

/// Rewrite `%(name)s` to `$n`; repeated names share a position. `%%` is a literal `%`.
fn rewrite_named(sql: &str) -> Result<(String, Vec<String>), ConnectorError> {
    let mut out = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let mut rest = sql;

    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix("%%") {
            out.push('%');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("%(") {
            let end = after
                .find(")s")
                .ok_or_else(|| ConnectorError::Query(format!("unterminated parameter in: {sql}")))?;
            let name = &after[..end];
            let index = match names.iter().position(|n| n == name) {
                Some(i) => i + 1,
                None => {
                    names.push(name.to_string());
                    names.len()
                }
            };
            out.push_str(&format!("${index}"));
            rest = &after[end + 2..];
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    Ok((out, names))
}

fn nullable<T>(value: &Value, get: impl Fn(&Value) -> Option<T>) -> Option<Option<T>> {
    if value.is_null() {
        Some(None)
    } else {
        get(value).map(Some)
    }
}

/// Numbers may arrive as text from HTTP query strings
fn as_i64(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_str()?.trim().parse().ok())
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64().or_else(|| value.as_str()?.trim().parse().ok())
}

fn as_bool(value: &Value) -> Option<bool> {
    value.as_bool().or_else(|| value.as_str()?.trim().parse().ok())
}

type Bound = Box<dyn ToSql + Sync + Send>;

/// Convert a JSON value into the parameter type the statement expects
fn bind(ty: &Type, value: &Value) -> Result<Bound, ConnectorError> {
    let mismatch = || ConnectorError::Query(format!("cannot bind {value} as {ty}"));
    let bound: Bound = match *ty {
        Type::BOOL => Box::new(nullable(value, as_bool).ok_or_else(mismatch)?),
        Type::INT2 => Box::new(
            nullable(value, |v| as_i64(v).and_then(|n| i16::try_from(n).ok())).ok_or_else(mismatch)?,
        ),
        Type::INT4 => Box::new(
            nullable(value, |v| as_i64(v).and_then(|n| i32::try_from(n).ok())).ok_or_else(mismatch)?,
        ),
        Type::INT8 => Box::new(nullable(value, as_i64).ok_or_else(mismatch)?),
        Type::FLOAT4 => Box::new(nullable(value, |v| as_f64(v).map(|f| f as f32)).ok_or_else(mismatch)?),
        Type::FLOAT8 => Box::new(nullable(value, as_f64).ok_or_else(mismatch)?),
        Type::JSON | Type::JSONB => Box::new(value.clone()),
        Type::TIMESTAMPTZ => Box::new(
            nullable(value, |v| {
                v.as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.with_timezone(&Utc))
            })
            .ok_or_else(mismatch)?,
        ),
        Type::TIMESTAMP => Box::new(
            nullable(value, |v| {
                v.as_str()
                    .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok())
            })
            .ok_or_else(mismatch)?,
        ),
        _ => Box::new(
            nullable(value, |v| match v {
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .ok_or_else(mismatch)?,
        ),
    };
    Ok(bound)
}

fn column_value(row: &tokio_postgres::Row, index: usize, ty: &Type) -> Value {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(index).ok().flatten().map(Value::from),
        Type::INT2 => row.try_get::<_, Option<i16>>(index).ok().flatten().map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(index).ok().flatten().map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(index).ok().flatten().map(Value::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)
            .ok()
            .flatten()
            .map(|f| Value::from(f64::from(f))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(index).ok().flatten().map(Value::from),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(index).ok().flatten(),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(index)
            .ok()
            .flatten()
            .map(|d| Value::from(d.to_rfc3339())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(index)
            .ok()
            .flatten()
            .map(|d| Value::from(d.to_string())),
        _ => row.try_get::<_, Option<String>>(index).ok().flatten().map(Value::from),
    };
    value.unwrap_or(Value::Null)
}

fn row_to_json(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| (column.name().to_string(), column_value(row, i, column.type_())))
        .collect()
}

#[async_trait]
impl Database for PostgresDatabase {
    /// Connect once so an unreachable server fails plugin registration
    async fn initialize(&self) -> Result<(), ConnectorError> {
        self.client().await?;
        match &self.init {
            Some(script) => {
                info!("Initializing Postgres database with {}", script.display());
                self.execute_script(script, &Params::new()).await
            }
            None => {
                debug!("No database init script configured");
                Ok(())
            }
        }
    }

    async fn execute_script(&self, path: &Path, params: &Params) -> Result<(), ConnectorError> {
        debug!("Executing script {}", path.display());
        let script = crate::read_script(path).await?;
        if params.is_empty() && !script.contains("%(") {
            let client = self.client().await?;
            return client.batch_execute(&script).await.map_err(query_error);
        }
        self.execute_query(&script, params).await.map(|_| ())
    }

    async fn execute_query(&self, sql: &str, params: &Params) -> Result<Vec<Row>, ConnectorError> {
        let (sql, names) = rewrite_named(sql)?;
        let values = names
            .iter()
            .map(|name| {
                params
                    .get(name)
                    .ok_or_else(|| ConnectorError::Query(format!("missing query parameter '{name}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let client = self.client().await?;
        let statement = client.prepare(&sql).await.map_err(query_error)?;
        let bound = statement
            .params()
            .iter()
            .zip(values)
            .map(|(ty, value)| bind(ty, value))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();

        let rows = client.query(&statement, &refs).await.map_err(query_error)?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}
