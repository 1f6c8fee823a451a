// SPDX-License-Identifier: GPL-3.0

//! Row types for the per-namespace metadata databases.

use crate::schema::{entries, multipart_parts, multipart_uploads};
use diesel::prelude::*;

/// A stored record: one logical key with its blob reference and metadata.
#[derive(Clone, Debug, Queryable, Selectable)]
#[diesel(table_name = entries)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EntryRow {
	pub key: String,
	pub blob_id: String,
	pub size: i64,
	pub uploaded: i64,
	pub expiration: Option<i64>,
	pub metadata: Option<String>,
	pub hashes: Option<String>,
	pub version: Option<String>,
}

/// Insertable form of [`EntryRow`].
#[derive(Debug, Insertable)]
#[diesel(table_name = entries)]
pub struct NewEntryRow<'a> {
	pub key: &'a str,
	pub blob_id: &'a str,
	pub size: i64,
	pub uploaded: i64,
	pub expiration: Option<i64>,
	pub metadata: Option<&'a str>,
	pub hashes: Option<&'a str>,
	pub version: Option<&'a str>,
}

/// A multipart upload in progress.
#[derive(Clone, Debug, Queryable, Selectable)]
#[diesel(table_name = multipart_uploads)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UploadRow {
	pub upload_id: String,
	pub key: String,
	pub metadata: Option<String>,
	pub state: String,
}

/// Insertable form of [`UploadRow`].
#[derive(Debug, Insertable)]
#[diesel(table_name = multipart_uploads)]
pub struct NewUploadRow<'a> {
	pub upload_id: &'a str,
	pub key: &'a str,
	pub metadata: Option<&'a str>,
	pub state: &'a str,
}

/// One uploaded part of a multipart upload.
#[derive(Clone, Debug, Queryable, Selectable)]
#[diesel(table_name = multipart_parts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PartRow {
	pub upload_id: String,
	pub part_number: i32,
	pub etag: String,
	pub blob_id: String,
	pub size: i64,
}

/// Insertable form of [`PartRow`].
#[derive(Debug, Insertable)]
#[diesel(table_name = multipart_parts)]
pub struct NewPartRow<'a> {
	pub upload_id: &'a str,
	pub part_number: i32,
	pub etag: &'a str,
	pub blob_id: &'a str,
	pub size: i64,
}

/// Multipart upload lifecycle states as stored in `multipart_uploads.state`.
pub mod upload_state {
	pub const IN_PROGRESS: &str = "in-progress";
	pub const COMPLETED: &str = "completed";
	pub const ABORTED: &str = "aborted";
}
