// SPDX-License-Identifier: GPL-3.0

//! The relational simulator.
//!
//! Statements pass straight through to a per-database SQLite file; there is
//! no query planning of any kind. Batches run inside one transaction and
//! roll back wholesale when any statement fails.
//!
//! Dynamically-shaped result rows rule out the diesel query builder here;
//! this module uses rusqlite directly, behind `spawn_blocking`.

use crate::errors::D1Error;
use rusqlite::{Connection, types::Value as SqlValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::{
	path::Path,
	sync::{Arc, Mutex},
	time::Instant,
};

/// One statement with its bound parameters.
#[derive(Clone, Debug, Deserialize)]
pub struct D1Statement {
	/// The SQL text.
	pub sql: String,
	/// JSON parameters bound positionally.
	#[serde(default)]
	pub params: Vec<Value>,
}

/// Execution metadata returned with every result.
#[derive(Clone, Debug, Default, Serialize)]
pub struct D1Meta {
	/// Wall time in milliseconds.
	pub duration: f64,
	/// Rows changed by the statement.
	pub changes: i64,
	/// `last_insert_rowid` after the statement.
	pub last_row_id: i64,
}

/// The result of one statement.
#[derive(Clone, Debug, Serialize)]
pub struct D1Result {
	/// Result rows as JSON objects; empty for non-queries.
	pub results: Vec<Map<String, Value>>,
	/// Always true when the statement ran; errors surface as `Err`.
	pub success: bool,
	/// Execution metadata.
	pub meta: D1Meta,
}

/// A relational database backed by one SQLite file (or memory).
#[derive(Clone)]
pub struct D1Database {
	conn: Arc<Mutex<Connection>>,
}

impl D1Database {
	/// Opens (or creates) the database at `path`; `None` opens in memory.
	pub fn open(path: Option<&Path>) -> Result<Self, D1Error> {
		let conn = match path {
			Some(path) => {
				if let Some(parent) = path.parent() {
					std::fs::create_dir_all(parent)?;
				}
				Connection::open(path).map_err(|e| D1Error::Open(e.to_string()))?
			},
			None => Connection::open_in_memory().map_err(|e| D1Error::Open(e.to_string()))?,
		};
		Ok(Self { conn: Arc::new(Mutex::new(conn)) })
	}

	/// Runs a single statement and returns its rows.
	pub async fn query(&self, statement: D1Statement) -> Result<D1Result, D1Error> {
		let conn = Arc::clone(&self.conn);
		tokio::task::spawn_blocking(move || {
			let conn = conn.lock().expect("connection mutex poisoned");
			run_statement(&conn, &statement)
		})
		.await
		.map_err(std::io::Error::other)?
	}

	/// Runs every statement inside one transaction; any failure rolls the
	/// whole batch back and nothing is committed.
	pub async fn batch(&self, statements: Vec<D1Statement>) -> Result<Vec<D1Result>, D1Error> {
		let conn = Arc::clone(&self.conn);
		tokio::task::spawn_blocking(move || {
			let conn = conn.lock().expect("connection mutex poisoned");
			let tx = conn
				.unchecked_transaction()
				.map_err(|e| D1Error::Statement(e.to_string()))?;
			let mut results = Vec::with_capacity(statements.len());
			for statement in &statements {
				// The transaction rolls back on drop unless committed.
				results.push(run_statement(&tx, statement)?);
			}
			tx.commit().map_err(|e| D1Error::Statement(e.to_string()))?;
			Ok(results)
		})
		.await
		.map_err(std::io::Error::other)?
	}

	/// Executes a multi-statement script, one statement per line group.
	pub async fn exec(&self, script: String) -> Result<D1Meta, D1Error> {
		let conn = Arc::clone(&self.conn);
		tokio::task::spawn_blocking(move || {
			let conn = conn.lock().expect("connection mutex poisoned");
			let started = Instant::now();
			let mut changes = 0i64;
			for line in script.lines() {
				let line = line.trim();
				if line.is_empty() {
					continue;
				}
				conn.execute_batch(line).map_err(|e| D1Error::Statement(e.to_string()))?;
				changes += conn.changes() as i64;
			}
			Ok(D1Meta {
				duration: started.elapsed().as_secs_f64() * 1000.0,
				changes,
				last_row_id: conn.last_insert_rowid(),
			})
		})
		.await
		.map_err(std::io::Error::other)?
	}
}

fn bind_params(params: &[Value]) -> Result<Vec<SqlValue>, D1Error> {
	params
		.iter()
		.enumerate()
		.map(|(index, value)| match value {
			Value::Null => Ok(SqlValue::Null),
			Value::Bool(b) => Ok(SqlValue::Integer(*b as i64)),
			Value::Number(n) =>
				if let Some(i) = n.as_i64() {
					Ok(SqlValue::Integer(i))
				} else {
					Ok(SqlValue::Real(n.as_f64().unwrap_or(0.0)))
				},
			Value::String(s) => Ok(SqlValue::Text(s.clone())),
			Value::Array(items) => {
				// Byte arrays arrive as JSON number arrays.
				let bytes: Option<Vec<u8>> = items
					.iter()
					.map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
					.collect();
				bytes
					.map(SqlValue::Blob)
					.ok_or(D1Error::UnsupportedParameter(index))
			},
			Value::Object(_) => Err(D1Error::UnsupportedParameter(index)),
		})
		.collect()
}

fn column_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
	match value {
		rusqlite::types::ValueRef::Null => Value::Null,
		rusqlite::types::ValueRef::Integer(i) => Value::Number(i.into()),
		rusqlite::types::ValueRef::Real(f) =>
			Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
		rusqlite::types::ValueRef::Text(text) =>
			Value::String(String::from_utf8_lossy(text).into_owned()),
		rusqlite::types::ValueRef::Blob(blob) =>
			Value::Array(blob.iter().map(|byte| Value::Number((*byte).into())).collect()),
	}
}

fn run_statement(conn: &Connection, statement: &D1Statement) -> Result<D1Result, D1Error> {
	let started = Instant::now();
	let params = bind_params(&statement.params)?;
	let mut prepared =
		conn.prepare(&statement.sql).map_err(|e| D1Error::Statement(e.to_string()))?;
	let columns: Vec<String> = prepared.column_names().iter().map(|c| c.to_string()).collect();

	let mut results = Vec::new();
	if columns.is_empty() {
		prepared
			.execute(rusqlite::params_from_iter(params))
			.map_err(|e| D1Error::Statement(e.to_string()))?;
	} else {
		let mut rows = prepared
			.query(rusqlite::params_from_iter(params))
			.map_err(|e| D1Error::Statement(e.to_string()))?;
		while let Some(row) = rows.next().map_err(|e| D1Error::Statement(e.to_string()))? {
			let mut object = Map::new();
			for (index, column) in columns.iter().enumerate() {
				let value = row
					.get_ref(index)
					.map_err(|e| D1Error::Statement(e.to_string()))?;
				object.insert(column.clone(), column_to_json(value));
			}
			results.push(object);
		}
	}

	Ok(D1Result {
		results,
		success: true,
		meta: D1Meta {
			duration: started.elapsed().as_secs_f64() * 1000.0,
			changes: conn.changes() as i64,
			last_row_id: conn.last_insert_rowid(),
		},
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn statement(sql: &str) -> D1Statement {
		D1Statement { sql: sql.to_string(), params: vec![] }
	}

	async fn seeded() -> D1Database {
		let db = D1Database::open(None).unwrap();
		db.query(statement("CREATE TABLE t(id INTEGER PRIMARY KEY, n TEXT)")).await.unwrap();
		db.query(statement("INSERT INTO t (id, n) VALUES (1, 'a')")).await.unwrap();
		db
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn query_returns_rows_as_json() {
		let db = seeded().await;
		let result = db.query(statement("SELECT n FROM t ORDER BY id")).await.unwrap();
		assert!(result.success);
		assert_eq!(result.results.len(), 1);
		assert_eq!(result.results[0].get("n"), Some(&Value::String("a".into())));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn parameters_bind_positionally() {
		let db = seeded().await;
		let insert = D1Statement {
			sql: "INSERT INTO t (id, n) VALUES (?1, ?2)".into(),
			params: vec![Value::Number(2.into()), Value::String("b".into())],
		};
		let result = db.query(insert).await.unwrap();
		assert_eq!(result.meta.changes, 1);
		assert_eq!(result.meta.last_row_id, 2);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn failing_batch_rolls_back_entirely() {
		let db = seeded().await;
		let result = db
			.batch(vec![
				D1Statement {
					sql: "INSERT INTO t (id, n) VALUES (?1, ?2)".into(),
					params: vec![Value::Number(2.into()), Value::String("b".into())],
				},
				statement("THIS IS NOT SQL"),
				D1Statement {
					sql: "INSERT INTO t (id, n) VALUES (?1, ?2)".into(),
					params: vec![Value::Number(3.into()), Value::String("c".into())],
				},
			])
			.await;
		assert!(matches!(result, Err(D1Error::Statement(_))));

		// Only the seed row survives.
		let rows = db.query(statement("SELECT n FROM t")).await.unwrap();
		assert_eq!(rows.results.len(), 1);
		assert_eq!(rows.results[0].get("n"), Some(&Value::String("a".into())));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn successful_batch_commits_all() {
		let db = seeded().await;
		db.batch(vec![
			statement("INSERT INTO t (id, n) VALUES (2, 'b')"),
			statement("INSERT INTO t (id, n) VALUES (3, 'c')"),
		])
		.await
		.unwrap();
		let rows = db.query(statement("SELECT COUNT(*) AS c FROM t")).await.unwrap();
		assert_eq!(rows.results[0].get("c"), Some(&Value::Number(3.into())));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn blobs_roundtrip_as_number_arrays() {
		let db = D1Database::open(None).unwrap();
		db.query(statement("CREATE TABLE b(data BLOB)")).await.unwrap();
		db.query(D1Statement {
			sql: "INSERT INTO b (data) VALUES (?1)".into(),
			params: vec![serde_json::json!([1, 2, 255])],
		})
		.await
		.unwrap();
		let rows = db.query(statement("SELECT data FROM b")).await.unwrap();
		assert_eq!(rows.results[0].get("data"), Some(&serde_json::json!([1, 2, 255])));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn objects_are_unsupported_parameters() {
		let db = seeded().await;
		let result = db
			.query(D1Statement {
				sql: "SELECT ?1".into(),
				params: vec![serde_json::json!({ "nested": true })],
			})
			.await;
		assert!(matches!(result, Err(D1Error::UnsupportedParameter(0))));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn exec_runs_scripts_line_by_line() {
		let db = D1Database::open(None).unwrap();
		let meta = db
			.exec("CREATE TABLE s(x);\nINSERT INTO s VALUES (1);\nINSERT INTO s VALUES (2);".into())
			.await
			.unwrap();
		assert!(meta.changes >= 2);
		let rows = db.query(statement("SELECT COUNT(*) AS c FROM s")).await.unwrap();
		assert_eq!(rows.results[0].get("c"), Some(&Value::Number(2.into())));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn file_databases_persist() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("db").join("data.sqlite");
		{
			let db = D1Database::open(Some(&path)).unwrap();
			db.query(statement("CREATE TABLE p(x)")).await.unwrap();
			db.query(statement("INSERT INTO p VALUES (42)")).await.unwrap();
		}
		{
			let db = D1Database::open(Some(&path)).unwrap();
			let rows = db.query(statement("SELECT x FROM p")).await.unwrap();
			assert_eq!(rows.results[0].get("x"), Some(&Value::Number(42.into())));
		}
	}
}
