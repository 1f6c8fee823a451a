// SPDX-License-Identifier: GPL-3.0

//! Diesel table definitions for the per-namespace metadata databases.

diesel::table! {
	/// One row per logical key in a namespace.
	entries (key) {
		key -> Text,
		blob_id -> Text,
		size -> BigInt,
		uploaded -> BigInt,
		expiration -> Nullable<BigInt>,
		metadata -> Nullable<Text>,
		hashes -> Nullable<Text>,
		version -> Nullable<Text>,
	}
}

diesel::table! {
	/// In-progress and aborted multipart uploads.
	multipart_uploads (upload_id) {
		upload_id -> Text,
		key -> Text,
		metadata -> Nullable<Text>,
		state -> Text,
	}
}

diesel::table! {
	/// Uploaded parts belonging to a multipart upload.
	multipart_parts (upload_id, part_number) {
		upload_id -> Text,
		part_number -> Integer,
		etag -> Text,
		blob_id -> Text,
		size -> BigInt,
	}
}

diesel::allow_tables_to_appear_in_same_query!(entries, multipart_uploads, multipart_parts);
