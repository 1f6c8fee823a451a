// SPDX-License-Identifier: GPL-3.0

//! Relational routes: `POST /:database/query` (single statement or
//! transactional batch) and `POST /:database/execute` (scripts).

use super::{StorageState, error_envelope};
use crate::d1::D1Statement;
use axum::{
	Json, Router,
	extract::{Path, State},
	http::HeaderMap,
	response::{IntoResponse, Response},
	routing::post,
};
use serde::Deserialize;
use std::sync::Arc;

pub(super) fn router(state: Arc<StorageState>) -> Router {
	Router::new()
		.route("/:database/query", post(query))
		.route("/:database/execute", post(execute))
		.with_state(state)
}

/// A query request: one statement, or a batch run in one transaction.
#[derive(Deserialize)]
#[serde(untagged)]
enum QueryBody {
	Batch(Vec<D1Statement>),
	Single(D1Statement),
}

async fn query(
	State(state): State<Arc<StorageState>>,
	Path(database): Path<String>,
	request_headers: HeaderMap,
	Json(body): Json<QueryBody>,
) -> Response {
	let db = match state.d1_database(&database, &request_headers).await {
		Ok(db) => db,
		Err(error) => return error_envelope(500, error.to_string(), error.v4code()),
	};
	let results = match body {
		QueryBody::Single(statement) =>
			db.query(statement).await.map(|result| vec![result]),
		QueryBody::Batch(statements) => db.batch(statements).await,
	};
	match results {
		Ok(results) => Json(results).into_response(),
		Err(error) => error_envelope(500, error.to_string(), error.v4code()),
	}
}

async fn execute(
	State(state): State<Arc<StorageState>>,
	Path(database): Path<String>,
	request_headers: HeaderMap,
	script: String,
) -> Response {
	let db = match state.d1_database(&database, &request_headers).await {
		Ok(db) => db,
		Err(error) => return error_envelope(500, error.to_string(), error.v4code()),
	};
	match db.exec(script).await {
		Ok(meta) => Json(meta).into_response(),
		Err(error) => error_envelope(500, error.to_string(), error.v4code()),
	}
}
