// SPDX-License-Identifier: GPL-3.0

//! The per-namespace metadata plane.
//!
//! Each namespace owns one SQLite database holding its records: logical key,
//! blob reference, size, timestamps, product-typed metadata and hash ledger.
//! The host process is a namespace's only writer, so every database sits
//! behind a single connection and an async mutex; WAL journalling and a
//! busy timeout cover the stray concurrent reader, and there is no
//! application-level retry machinery to tune. In-memory namespaces use the
//! same single-connection shape, which is also what keeps their state from
//! forking across handles.

use crate::{
	errors::StoreError,
	models::{
		EntryRow, NewEntryRow, NewPartRow, NewUploadRow, PartRow, UploadRow, upload_state,
	},
	schema::{entries, multipart_parts, multipart_uploads},
};
use diesel::{
	OptionalExtension, prelude::*, result::Error as DieselError, sqlite::SqliteConnection,
};
use diesel_async::{
	AsyncConnection, AsyncMigrationHarness, RunQueryDsl,
	sync_connection_wrapper::SyncConnectionWrapper,
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::{path::Path, sync::Arc};
use tokio::sync::{Mutex, MutexGuard};

const PRAGMA_JOURNAL_MODE_WAL: &str = "PRAGMA journal_mode = WAL";
const PRAGMA_BUSY_TIMEOUT: &str = "PRAGMA busy_timeout = 5000";
const IN_MEMORY_URL: &str = ":memory:";

// Embedded Diesel migrations located at `crates/ember-storage/migrations`.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type Conn = SyncConnectionWrapper<SqliteConnection>;

/// Options for a lexicographic list over a namespace.
#[derive(Clone, Debug, Default)]
pub struct ListQuery {
	/// Only keys starting with this prefix.
	pub prefix: Option<String>,
	/// Only keys strictly greater than this key (cursor / startAfter).
	pub after: Option<String>,
	/// Maximum number of rows returned.
	pub limit: i64,
	/// Current time in unix millis; rows expired at this instant are invisible.
	pub now: i64,
}

/// SQLite-backed metadata store for one namespace.
///
/// Cloning shares the underlying connection, so every handle to a namespace
/// sees the same data whether it lives on disk or in memory.
#[derive(Clone)]
pub struct MetaStore {
	conn: Arc<Mutex<Conn>>,
}

impl std::fmt::Debug for MetaStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MetaStore").finish_non_exhaustive()
	}
}

impl MetaStore {
	/// Opens or creates the namespace database at `path`, creating parent
	/// directories as needed; `None` opens an in-memory database.
	pub async fn open(maybe_path: Option<&Path>) -> Result<Self, StoreError> {
		let conn = match maybe_path {
			Some(path) => {
				if let Some(parent) = path.parent() {
					std::fs::create_dir_all(parent)?;
				}
				let mut conn = Conn::establish(&path.display().to_string()).await?;
				diesel::sql_query(PRAGMA_JOURNAL_MODE_WAL).execute(&mut conn).await?;
				diesel::sql_query(PRAGMA_BUSY_TIMEOUT).execute(&mut conn).await?;
				conn
			},
			None => Conn::establish(IN_MEMORY_URL).await?,
		};

		let mut harness = AsyncMigrationHarness::new(conn);
		harness.run_pending_migrations(MIGRATIONS)?;
		Ok(Self { conn: Arc::new(Mutex::new(harness.into_inner())) })
	}

	/// Opens a fresh in-memory namespace.
	pub async fn in_memory() -> Result<Self, StoreError> {
		Self::open(None).await
	}

	async fn lock(&self) -> MutexGuard<'_, Conn> {
		self.conn.lock().await
	}

	/// Fetches the record for `key` that is visible at `now` (unix millis).
	pub async fn get(&self, key: &str, now: i64) -> Result<Option<EntryRow>, StoreError> {
		use crate::schema::entries::columns as ec;

		let mut conn = self.lock().await;
		let row = entries::table
			.filter(ec::key.eq(key))
			.filter(ec::expiration.is_null().or(ec::expiration.gt(now)))
			.select(EntryRow::as_select())
			.first(&mut *conn)
			.await
			.optional()?;
		Ok(row)
	}

	/// Fetches the record for `key` regardless of expiration.
	pub async fn get_ignoring_expiration(
		&self,
		key: &str,
	) -> Result<Option<EntryRow>, StoreError> {
		use crate::schema::entries::columns as ec;

		let mut conn = self.lock().await;
		let row = entries::table
			.filter(ec::key.eq(key))
			.select(EntryRow::as_select())
			.first(&mut *conn)
			.await
			.optional()?;
		Ok(row)
	}

	/// Upserts a record, returning the superseded row (if any) so the caller
	/// can reclaim its blob.
	pub async fn put(&self, row: NewEntryRow<'_>) -> Result<Option<EntryRow>, StoreError> {
		use crate::schema::entries::columns as ec;

		let mut conn = self.lock().await;
		let previous: Option<EntryRow> = entries::table
			.filter(ec::key.eq(row.key))
			.select(EntryRow::as_select())
			.first(&mut *conn)
			.await
			.optional()?;

		diesel::insert_into(entries::table)
			.values(&row)
			.on_conflict(ec::key)
			.do_update()
			.set((
				ec::blob_id.eq(row.blob_id),
				ec::size.eq(row.size),
				ec::uploaded.eq(row.uploaded),
				ec::expiration.eq(row.expiration),
				ec::metadata.eq(row.metadata),
				ec::hashes.eq(row.hashes),
				ec::version.eq(row.version),
			))
			.execute(&mut *conn)
			.await?;
		Ok(previous)
	}

	/// Deletes the record for `key`, returning the removed row (if any).
	pub async fn delete(&self, key: &str) -> Result<Option<EntryRow>, StoreError> {
		use crate::schema::entries::columns as ec;

		let mut conn = self.lock().await;
		let previous: Option<EntryRow> = entries::table
			.filter(ec::key.eq(key))
			.select(EntryRow::as_select())
			.first(&mut *conn)
			.await
			.optional()?;
		if previous.is_none() {
			return Ok(None);
		}
		diesel::delete(entries::table.filter(ec::key.eq(key))).execute(&mut *conn).await?;
		Ok(previous)
	}

	/// Lists visible records in lexicographic key order.
	pub async fn list(&self, query: &ListQuery) -> Result<Vec<EntryRow>, StoreError> {
		use crate::schema::entries::columns as ec;

		let mut conn = self.lock().await;
		let mut stmt = entries::table
			.filter(ec::expiration.is_null().or(ec::expiration.gt(query.now)))
			.select(EntryRow::as_select())
			.order(ec::key.asc())
			.limit(query.limit)
			.into_boxed();

		if let Some(prefix) = &query.prefix {
			stmt = stmt.filter(ec::key.ge(prefix.clone()));
			if let Some(upper) = prefix_upper_bound(prefix) {
				stmt = stmt.filter(ec::key.lt(upper));
			}
		}
		if let Some(after) = &query.after {
			stmt = stmt.filter(ec::key.gt(after.clone()));
		}

		Ok(stmt.load(&mut *conn).await?)
	}

	/// Deletes rows whose expiration has passed, returning their blob ids for
	/// reclamation. Callers invoke this lazily; expired rows are already
	/// invisible to reads.
	pub async fn sweep_expired(&self, now: i64) -> Result<Vec<String>, StoreError> {
		use crate::schema::entries::columns as ec;

		let mut conn = self.lock().await;
		let expired: Vec<String> = entries::table
			.filter(ec::expiration.is_not_null())
			.filter(ec::expiration.le(now))
			.select(ec::blob_id)
			.load(&mut *conn)
			.await?;
		if expired.is_empty() {
			return Ok(vec![]);
		}
		diesel::delete(
			entries::table.filter(ec::expiration.is_not_null()).filter(ec::expiration.le(now)),
		)
		.execute(&mut *conn)
		.await?;
		Ok(expired)
	}

	/// Records a new multipart upload.
	pub async fn create_upload(&self, row: NewUploadRow<'_>) -> Result<(), StoreError> {
		let mut conn = self.lock().await;
		diesel::insert_into(multipart_uploads::table).values(&row).execute(&mut *conn).await?;
		Ok(())
	}

	/// Fetches an upload by id.
	pub async fn get_upload(&self, upload_id: &str) -> Result<Option<UploadRow>, StoreError> {
		use crate::schema::multipart_uploads::columns as uc;

		let mut conn = self.lock().await;
		let row = multipart_uploads::table
			.filter(uc::upload_id.eq(upload_id))
			.select(UploadRow::as_select())
			.first(&mut *conn)
			.await
			.optional()?;
		Ok(row)
	}

	/// Upserts a part, returning the superseded part's blob id (re-uploading a
	/// part number replaces it).
	pub async fn put_part(&self, row: NewPartRow<'_>) -> Result<Option<String>, StoreError> {
		use crate::schema::multipart_parts::columns as pc;

		let mut conn = self.lock().await;
		let previous: Option<String> = multipart_parts::table
			.filter(pc::upload_id.eq(row.upload_id))
			.filter(pc::part_number.eq(row.part_number))
			.select(pc::blob_id)
			.first(&mut *conn)
			.await
			.optional()?;

		diesel::insert_into(multipart_parts::table)
			.values(&row)
			.on_conflict((pc::upload_id, pc::part_number))
			.do_update()
			.set((pc::etag.eq(row.etag), pc::blob_id.eq(row.blob_id), pc::size.eq(row.size)))
			.execute(&mut *conn)
			.await?;
		Ok(previous)
	}

	/// All parts uploaded for `upload_id`, ordered by part number.
	pub async fn parts(&self, upload_id: &str) -> Result<Vec<PartRow>, StoreError> {
		use crate::schema::multipart_parts::columns as pc;

		let mut conn = self.lock().await;
		Ok(multipart_parts::table
			.filter(pc::upload_id.eq(upload_id))
			.select(PartRow::as_select())
			.order(pc::part_number.asc())
			.load(&mut *conn)
			.await?)
	}

	/// Atomically swaps a completed upload into the record plane: writes the
	/// stitched entry, marks the upload completed and removes its parts.
	/// Returns the superseded entry (if any) and the part blob ids, both for
	/// blob reclamation.
	pub async fn finish_upload(
		&self,
		upload_id: &str,
		entry: NewEntryRow<'_>,
	) -> Result<(Option<EntryRow>, Vec<String>), StoreError> {
		use crate::schema::{
			entries::columns as ec, multipart_parts::columns as pc,
			multipart_uploads::columns as uc,
		};

		let upload_id = upload_id.to_string();
		let key = entry.key.to_string();
		let blob_id = entry.blob_id.to_string();
		let size = entry.size;
		let uploaded = entry.uploaded;
		let metadata = entry.metadata.map(str::to_string);
		let hashes = entry.hashes.map(str::to_string);
		let version = entry.version.map(str::to_string);

		let mut conn = self.lock().await;
		let result = conn
			.transaction::<_, DieselError, _>(move |conn| {
				Box::pin(async move {
					let previous: Option<EntryRow> = entries::table
						.filter(ec::key.eq(&key))
						.select(EntryRow::as_select())
						.first(conn)
						.await
						.optional()?;

					diesel::insert_into(entries::table)
						.values(NewEntryRow {
							key: &key,
							blob_id: &blob_id,
							size,
							uploaded,
							expiration: None,
							metadata: metadata.as_deref(),
							hashes: hashes.as_deref(),
							version: version.as_deref(),
						})
						.on_conflict(ec::key)
						.do_update()
						.set((
							ec::blob_id.eq(&blob_id),
							ec::size.eq(size),
							ec::uploaded.eq(uploaded),
							ec::expiration.eq(None::<i64>),
							ec::metadata.eq(metadata.as_deref()),
							ec::hashes.eq(hashes.as_deref()),
							ec::version.eq(version.as_deref()),
						))
						.execute(conn)
						.await?;

					let part_blobs: Vec<String> = multipart_parts::table
						.filter(pc::upload_id.eq(&upload_id))
						.select(pc::blob_id)
						.load(conn)
						.await?;
					diesel::delete(multipart_parts::table.filter(pc::upload_id.eq(&upload_id)))
						.execute(conn)
						.await?;
					diesel::update(
						multipart_uploads::table.filter(uc::upload_id.eq(&upload_id)),
					)
					.set(uc::state.eq(upload_state::COMPLETED))
					.execute(conn)
					.await?;

					Ok((previous, part_blobs))
				})
			})
			.await?;
		Ok(result)
	}

	/// Marks an upload aborted and removes its parts, returning their blob ids.
	pub async fn abort_upload(&self, upload_id: &str) -> Result<Vec<String>, StoreError> {
		use crate::schema::{multipart_parts::columns as pc, multipart_uploads::columns as uc};

		let upload_id = upload_id.to_string();
		let mut conn = self.lock().await;
		let part_blobs = conn
			.transaction::<_, DieselError, _>(move |conn| {
				Box::pin(async move {
					let part_blobs: Vec<String> = multipart_parts::table
						.filter(pc::upload_id.eq(&upload_id))
						.select(pc::blob_id)
						.load(conn)
						.await?;
					diesel::delete(multipart_parts::table.filter(pc::upload_id.eq(&upload_id)))
						.execute(conn)
						.await?;
					diesel::update(
						multipart_uploads::table.filter(uc::upload_id.eq(&upload_id)),
					)
					.set(uc::state.eq(upload_state::ABORTED))
					.execute(conn)
					.await?;
					Ok(part_blobs)
				})
			})
			.await?;
		Ok(part_blobs)
	}
}

/// Computes the exclusive upper bound for a lexicographic prefix query, or
/// `None` when every byte is already at its maximum and `>=` suffices.
fn prefix_upper_bound(prefix: &str) -> Option<String> {
	let mut bytes = prefix.as_bytes().to_vec();
	while let Some(last) = bytes.last_mut() {
		if *last < 0xFF {
			*last += 1;
			// Lossy is fine: the bound only needs byte-wise ordering.
			return Some(String::from_utf8_lossy(&bytes).into_owned());
		}
		bytes.pop();
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	fn row<'a>(key: &'a str, blob: &'a str, expiration: Option<i64>) -> NewEntryRow<'a> {
		NewEntryRow {
			key,
			blob_id: blob,
			size: 5,
			uploaded: 1_000,
			expiration,
			metadata: None,
			hashes: None,
			version: None,
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn put_get_delete_roundtrip() {
		let store = MetaStore::in_memory().await.unwrap();
		assert!(store.get("k", 0).await.unwrap().is_none());

		assert!(store.put(row("k", "b1", None)).await.unwrap().is_none());
		let entry = store.get("k", 0).await.unwrap().unwrap();
		assert_eq!(entry.blob_id, "b1");

		// Replacing returns the superseded row.
		let previous = store.put(row("k", "b2", None)).await.unwrap().unwrap();
		assert_eq!(previous.blob_id, "b1");

		let removed = store.delete("k").await.unwrap().unwrap();
		assert_eq!(removed.blob_id, "b2");
		assert!(store.delete("k").await.unwrap().is_none());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn expired_rows_are_invisible_but_sweepable() {
		let store = MetaStore::in_memory().await.unwrap();
		store.put(row("k", "b1", Some(500))).await.unwrap();

		assert!(store.get("k", 499).await.unwrap().is_some());
		assert!(store.get("k", 500).await.unwrap().is_none());
		assert!(store.get_ignoring_expiration("k").await.unwrap().is_some());

		let reclaimed = store.sweep_expired(500).await.unwrap();
		assert_eq!(reclaimed, vec!["b1".to_string()]);
		assert!(store.get_ignoring_expiration("k").await.unwrap().is_none());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn list_is_lexicographic_with_prefix_and_cursor() {
		let store = MetaStore::in_memory().await.unwrap();
		for key in ["a/1", "a/2", "a/3", "b/1"] {
			store.put(row(key, "b", None)).await.unwrap();
		}

		let query =
			ListQuery { prefix: Some("a/".into()), after: None, limit: 2, now: 0 };
		let page: Vec<String> =
			store.list(&query).await.unwrap().into_iter().map(|r| r.key).collect();
		assert_eq!(page, vec!["a/1", "a/2"]);

		let query = ListQuery {
			prefix: Some("a/".into()),
			after: Some("a/2".into()),
			limit: 2,
			now: 0,
		};
		let page: Vec<String> =
			store.list(&query).await.unwrap().into_iter().map(|r| r.key).collect();
		assert_eq!(page, vec!["a/3"]);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn multipart_flow() {
		let store = MetaStore::in_memory().await.unwrap();
		store
			.create_upload(NewUploadRow {
				upload_id: "up1",
				key: "k",
				metadata: None,
				state: upload_state::IN_PROGRESS,
			})
			.await
			.unwrap();
		assert_eq!(store.get_upload("up1").await.unwrap().unwrap().state, "in-progress");

		store
			.put_part(NewPartRow { upload_id: "up1", part_number: 1, etag: "e1", blob_id: "p1", size: 5 })
			.await
			.unwrap();
		// Re-uploading part 1 returns the replaced blob.
		let old = store
			.put_part(NewPartRow { upload_id: "up1", part_number: 1, etag: "e2", blob_id: "p2", size: 6 })
			.await
			.unwrap();
		assert_eq!(old, Some("p1".to_string()));
		store
			.put_part(NewPartRow { upload_id: "up1", part_number: 2, etag: "e3", blob_id: "p3", size: 7 })
			.await
			.unwrap();

		let parts = store.parts("up1").await.unwrap();
		assert_eq!(parts.len(), 2);
		assert_eq!(parts[0].part_number, 1);

		let (previous, part_blobs) =
			store.finish_upload("up1", row("k", "stitched", None)).await.unwrap();
		assert!(previous.is_none());
		assert_eq!(part_blobs, vec!["p2".to_string(), "p3".to_string()]);
		assert_eq!(store.get_upload("up1").await.unwrap().unwrap().state, "completed");
		assert!(store.parts("up1").await.unwrap().is_empty());
		assert_eq!(store.get("k", 0).await.unwrap().unwrap().blob_id, "stitched");
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn file_persistence_across_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("ns.sqlite");
		{
			let store = MetaStore::open(Some(&path)).await.unwrap();
			store.put(row("k", "b1", None)).await.unwrap();
		}
		{
			let store = MetaStore::open(Some(&path)).await.unwrap();
			assert_eq!(store.get("k", 0).await.unwrap().unwrap().blob_id, "b1");
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn cloned_handles_share_one_namespace() {
		let store = MetaStore::in_memory().await.unwrap();
		let other = store.clone();
		store.put(row("k", "b1", None)).await.unwrap();
		assert_eq!(other.get("k", 0).await.unwrap().unwrap().blob_id, "b1");
	}
}
