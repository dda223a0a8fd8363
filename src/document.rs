// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The in-memory view of a document under collaborative editing.

use derive_more::{AsRef, Deref, Display};
use serde::{Deserialize, Serialize};

/// Identifies a document: the bucket id and the file path within it,
/// joined with a colon. Treat it as opaque; never parse it apart again.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Deref, AsRef,
    Display,
)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(bucket_id: &str, file_path: &str) -> Self {
        Self(format!("{bucket_id}:{file_path}"))
    }
}

/// Routing metadata for the blob store, forwarded untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub bucket_name: String,
    pub region: String,
}

/// A cached document. All mutation happens inside the document's own task;
/// everyone else sees copies handed out through that task.
#[derive(Clone, Debug)]
pub struct Document {
    pub id: DocumentId,
    pub bucket_id: String,
    pub file_path: String,
    pub bucket_info: BucketInfo,
    pub content: String,
    /// Monotonic counter, advanced by exactly one per applied operation.
    /// Zero is the baseline a freshly materialized document starts from.
    pub revision: u64,
}

impl Document {
    pub fn new(
        bucket_id: &str,
        file_path: &str,
        bucket_info: BucketInfo,
        content: String,
    ) -> Self {
        Self {
            id: DocumentId::new(bucket_id, file_path),
            bucket_id: bucket_id.to_owned(),
            file_path: file_path.to_owned(),
            bucket_info,
            content,
            revision: 0,
        }
    }
}

/// Maps CRLF and bare CR to LF. Applied to all bulk content entering the
/// core (snapshot load, blob load, full-content sync), so that documents
/// only ever carry LF internally.
pub fn normalize_line_endings(content: &str) -> String {
    if !content.contains('\r') {
        return content.to_owned();
    }
    content.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn document_id_joins_bucket_and_path() {
        let id = DocumentId::new("course-42", "notes/intro.md");
        assert_eq!(id.to_string(), "course-42:notes/intro.md");
    }

    #[test]
    fn crlf_and_bare_cr_become_lf() {
        assert_eq!(normalize_line_endings("a\r\nb\rc\nd"), "a\nb\nc\nd");
    }

    #[test]
    fn lf_only_content_is_untouched() {
        assert_eq!(normalize_line_endings("a\nb\n"), "a\nb\n");
    }
}
