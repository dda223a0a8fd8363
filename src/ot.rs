// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The operation algebra the server is built on.
//!
//! A [`TextOperation`] describes an edit to a plain-text document as a
//! sequence of components walking the document from start to end: retain a
//! run of characters, insert new text, or delete a run. All counts are
//! *character* counts, never byte offsets.
//!
//! On the wire an operation is a flat JSON array: a positive integer
//! retains, a negative integer deletes, a string inserts. `[5, " world"]`
//! appends `" world"` to a five-character document.

use dissimilar::Chunk;
use serde::de::Error as _;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtError {
    #[error("operation expects a document of length {expected}, got length {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("invalid operation encoding: {0}")]
    InvalidEncoding(String),
    #[error("operation sequences ran out of alignment")]
    InvariantViolation,
}

/// One step of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpComponent {
    Retain(usize),
    Insert(String),
    Delete(usize),
}

/// An edit in canonical form.
///
/// The component sequence never contains a zero-length component, never
/// contains two adjacent components of the same kind, and always places an
/// insert before an adjacent delete. The builder methods maintain this, so
/// two operations with the same effect compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextOperation {
    components: Vec<OpComponent>,
    base_len: usize,
    target_len: usize,
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Splits off and returns the first `n` characters of `s`.
fn take_prefix(s: &mut String, n: usize) -> String {
    let boundary = s.char_indices().nth(n).map_or(s.len(), |(i, _)| i);
    s.drain(..boundary).collect()
}

impl TextOperation {
    /// Length of the document this operation applies to.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the document this operation produces.
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    pub fn components(&self) -> &[OpComponent] {
        &self.components
    }

    /// True iff applying the operation changes nothing.
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|component| matches!(component, OpComponent::Retain(_)))
    }

    /// Skip over `n` characters of the input.
    pub fn retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(OpComponent::Retain(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(OpComponent::Retain(n));
        }
    }

    /// Insert `s` at the current position.
    ///
    /// When the tail of the sequence is a delete, the insert is spliced in
    /// *before* it (or merged into an insert already sitting there). This
    /// ordering is what makes equal edits structurally equal.
    pub fn insert(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        self.target_len += char_len(s);
        match self.components.as_mut_slice() {
            [.., OpComponent::Insert(tail)] => tail.push_str(s),
            [.., OpComponent::Insert(before_delete), OpComponent::Delete(_)] => {
                before_delete.push_str(s);
            }
            [.., OpComponent::Delete(_)] => {
                let at = self.components.len() - 1;
                self.components.insert(at, OpComponent::Insert(s.to_owned()));
            }
            _ => self.components.push(OpComponent::Insert(s.to_owned())),
        }
    }

    /// Delete `n` characters at the current position.
    pub fn delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        if let Some(OpComponent::Delete(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(OpComponent::Delete(n));
        }
    }

    /// Runs the operation against `doc`, producing the edited document.
    pub fn apply(&self, doc: &str) -> Result<String, OtError> {
        let doc_len = char_len(doc);
        if doc_len != self.base_len {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual: doc_len,
            });
        }
        let mut result = String::with_capacity(doc.len());
        let mut chars = doc.chars();
        for component in &self.components {
            match component {
                OpComponent::Retain(n) => result.extend(chars.by_ref().take(*n)),
                OpComponent::Insert(s) => result.push_str(s),
                OpComponent::Delete(n) => {
                    for _ in 0..*n {
                        chars.next();
                    }
                }
            }
        }
        Ok(result)
    }

    /// Combines `self` followed by `other` into a single operation, such
    /// that `self.compose(other)?.apply(doc) == other.apply(&self.apply(doc)?)`.
    pub fn compose(&self, other: &Self) -> Result<Self, OtError> {
        if self.target_len != other.base_len {
            return Err(OtError::LengthMismatch {
                expected: self.target_len,
                actual: other.base_len,
            });
        }

        let mut result = Self::default();
        let mut a_rest = self.components.iter().cloned();
        let mut b_rest = other.components.iter().cloned();
        let mut a = a_rest.next();
        let mut b = b_rest.next();

        loop {
            // A's deletes happened before B saw the document.
            if let Some(OpComponent::Delete(n)) = a {
                result.delete(n);
                a = a_rest.next();
                continue;
            }
            // B's inserts land regardless of what A did.
            if let Some(OpComponent::Insert(s)) = &b {
                result.insert(s);
                b = b_rest.next();
                continue;
            }

            let mut advance_a = false;
            let mut advance_b = false;
            match (&mut a, &mut b) {
                (None, None) => break,
                (Some(OpComponent::Retain(x)), Some(OpComponent::Retain(y))) => {
                    let n = (*x).min(*y);
                    result.retain(n);
                    *x -= n;
                    *y -= n;
                    advance_a = *x == 0;
                    advance_b = *y == 0;
                }
                (Some(OpComponent::Insert(s)), Some(OpComponent::Retain(y))) => {
                    let n = char_len(s).min(*y);
                    result.insert(&take_prefix(s, n));
                    *y -= n;
                    advance_a = s.is_empty();
                    advance_b = *y == 0;
                }
                (Some(OpComponent::Retain(x)), Some(OpComponent::Delete(y))) => {
                    let n = (*x).min(*y);
                    result.delete(n);
                    *x -= n;
                    *y -= n;
                    advance_a = *x == 0;
                    advance_b = *y == 0;
                }
                (Some(OpComponent::Insert(s)), Some(OpComponent::Delete(y))) => {
                    // B deletes what A inserted; both vanish.
                    let n = char_len(s).min(*y);
                    take_prefix(s, n);
                    *y -= n;
                    advance_a = s.is_empty();
                    advance_b = *y == 0;
                }
                _ => return Err(OtError::InvariantViolation),
            }
            if advance_a {
                a = a_rest.next();
            }
            if advance_b {
                b = b_rest.next();
            }
        }

        Ok(result)
    }

    /// Transforms two operations made against the same document into the
    /// pair `(a', b')` with `a'.apply(&b.apply(doc)?) == b'.apply(&a.apply(doc)?)`.
    ///
    /// When both sides insert at the same position, `self`'s insert ends up
    /// first in the converged document.
    pub fn transform(&self, other: &Self) -> Result<(Self, Self), OtError> {
        if self.base_len != other.base_len {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual: other.base_len,
            });
        }

        let mut a_prime = Self::default();
        let mut b_prime = Self::default();
        let mut a_rest = self.components.iter().cloned();
        let mut b_rest = other.components.iter().cloned();
        let mut a = a_rest.next();
        let mut b = b_rest.next();

        loop {
            // Pending inserts on A go first; that is the tie-break.
            if let Some(OpComponent::Insert(s)) = &a {
                a_prime.insert(s);
                b_prime.retain(char_len(s));
                a = a_rest.next();
                continue;
            }
            if let Some(OpComponent::Insert(s)) = &b {
                a_prime.retain(char_len(s));
                b_prime.insert(s);
                b = b_rest.next();
                continue;
            }

            let mut advance_a = false;
            let mut advance_b = false;
            match (&mut a, &mut b) {
                (None, None) => break,
                (Some(OpComponent::Retain(x)), Some(OpComponent::Retain(y))) => {
                    let n = (*x).min(*y);
                    a_prime.retain(n);
                    b_prime.retain(n);
                    *x -= n;
                    *y -= n;
                    advance_a = *x == 0;
                    advance_b = *y == 0;
                }
                (Some(OpComponent::Delete(x)), Some(OpComponent::Delete(y))) => {
                    // Both sides already removed these characters.
                    let n = (*x).min(*y);
                    *x -= n;
                    *y -= n;
                    advance_a = *x == 0;
                    advance_b = *y == 0;
                }
                (Some(OpComponent::Delete(x)), Some(OpComponent::Retain(y))) => {
                    let n = (*x).min(*y);
                    a_prime.delete(n);
                    *x -= n;
                    *y -= n;
                    advance_a = *x == 0;
                    advance_b = *y == 0;
                }
                (Some(OpComponent::Retain(x)), Some(OpComponent::Delete(y))) => {
                    let n = (*x).min(*y);
                    b_prime.delete(n);
                    *x -= n;
                    *y -= n;
                    advance_a = *x == 0;
                    advance_b = *y == 0;
                }
                _ => return Err(OtError::InvariantViolation),
            }
            if advance_a {
                a = a_rest.next();
            }
            if advance_b {
                b = b_rest.next();
            }
        }

        Ok((a_prime, b_prime))
    }

    /// Decodes the wire form, re-establishing canonical form on the way in.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, OtError> {
        serde_json::from_value(value.clone())
            .map_err(|e| OtError::InvalidEncoding(e.to_string()))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("operation serialization cannot fail")
    }
}

impl Serialize for TextOperation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.components.len()))?;
        for component in &self.components {
            match component {
                OpComponent::Retain(n) => seq.serialize_element(&(*n as i64))?,
                OpComponent::Insert(s) => seq.serialize_element(s)?,
                OpComponent::Delete(n) => seq.serialize_element(&-(*n as i64))?,
            }
        }
        seq.end()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireComponent {
    Count(i64),
    Text(String),
}

impl<'de> Deserialize<'de> for TextOperation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let elements = Vec::<WireComponent>::deserialize(deserializer)?;
        let mut operation = Self::default();
        for element in elements {
            match element {
                WireComponent::Count(n) if n > 0 => operation.retain(n as usize),
                WireComponent::Count(n) if n < 0 => operation.delete(n.unsigned_abs() as usize),
                WireComponent::Count(_) => {
                    return Err(D::Error::custom("operation component must be nonzero"));
                }
                WireComponent::Text(s) if !s.is_empty() => operation.insert(&s),
                WireComponent::Text(_) => {
                    return Err(D::Error::custom("operation component must be nonempty"));
                }
            }
        }
        Ok(operation)
    }
}

impl<'a> From<Vec<Chunk<'a>>> for TextOperation {
    fn from(chunks: Vec<Chunk>) -> Self {
        let mut operation = Self::default();
        for chunk in chunks {
            match chunk {
                Chunk::Equal(s) => operation.retain(char_len(s)),
                Chunk::Delete(s) => operation.delete(char_len(s)),
                Chunk::Insert(s) => operation.insert(s),
            }
        }
        operation
    }
}

pub mod factories {
    use super::TextOperation;

    pub fn insert(at: usize, s: &str) -> TextOperation {
        let mut operation = TextOperation::default();
        operation.retain(at);
        operation.insert(s);
        operation
    }

    pub fn delete(from: usize, length: usize) -> TextOperation {
        let mut operation = TextOperation::default();
        operation.retain(from);
        operation.delete(length);
        operation
    }

    pub fn replace(from: usize, length: usize, s: &str) -> TextOperation {
        let mut operation = TextOperation::default();
        operation.retain(from);
        operation.delete(length);
        operation.insert(s);
        operation
    }
}

#[cfg(test)]
mod tests {
    use super::factories::*;
    use super::*;
    use pretty_assertions::assert_eq;

    mod builder {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn zero_length_components_are_dropped() {
            let mut operation = TextOperation::default();
            operation.retain(0);
            operation.insert("");
            operation.delete(0);
            assert!(operation.components().is_empty());
            assert!(operation.is_noop());
        }

        #[test]
        fn adjacent_components_merge() {
            let mut operation = TextOperation::default();
            operation.retain(2);
            operation.retain(3);
            operation.insert("a");
            operation.insert("b");
            operation.delete(1);
            operation.delete(1);
            assert_eq!(
                operation.components(),
                &[
                    OpComponent::Retain(5),
                    OpComponent::Insert("ab".into()),
                    OpComponent::Delete(2),
                ]
            );
        }

        #[test]
        fn insert_is_spliced_before_a_trailing_delete() {
            let mut operation = TextOperation::default();
            operation.retain(1);
            operation.delete(2);
            operation.insert("x");
            assert_eq!(
                operation.components(),
                &[
                    OpComponent::Retain(1),
                    OpComponent::Insert("x".into()),
                    OpComponent::Delete(2),
                ]
            );
        }

        #[test]
        fn insert_after_delete_merges_into_earlier_insert() {
            let mut operation = TextOperation::default();
            operation.insert("a");
            operation.delete(2);
            operation.insert("b");
            assert_eq!(
                operation.components(),
                &[OpComponent::Insert("ab".into()), OpComponent::Delete(2)]
            );
        }

        #[test]
        fn delete_then_insert_equals_insert_then_delete() {
            assert_eq!(replace(2, 3, "new"), {
                let mut operation = TextOperation::default();
                operation.retain(2);
                operation.insert("new");
                operation.delete(3);
                operation
            });
        }

        #[test]
        fn lengths_are_tracked() {
            let operation = replace(2, 3, "néw");
            assert_eq!(operation.base_len(), 5);
            assert_eq!(operation.target_len(), 5);
        }
    }

    mod apply {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn applies_a_mixed_operation() {
            let mut operation = TextOperation::default();
            operation.retain(3);
            operation.insert("m");
            operation.delete(1);
            operation.retain(5);
            operation.delete(4);
            operation.retain(5);
            assert_eq!(
                operation.apply("To be or not to be").unwrap(),
                "To me or to be"
            );
        }

        #[test]
        fn counts_characters_not_bytes() {
            let operation = padded(replace(1, 1, "ö"), 3);
            assert_eq!(operation.apply("t🥕s").unwrap(), "tös");
        }

        #[test]
        fn rejects_wrong_document_length() {
            let operation = insert(5, "!");
            assert_eq!(
                operation.apply("1234"),
                Err(OtError::LengthMismatch {
                    expected: 5,
                    actual: 4
                })
            );
        }

        #[test]
        fn result_has_target_length() {
            let operation = replace(2, 2, "abc");
            let result = operation.apply("wxyz").unwrap();
            assert_eq!(result.chars().count(), operation.target_len());
        }
    }

    /// Pads an operation with a trailing retain so it covers a document of
    /// `doc_len` characters.
    fn padded(mut operation: TextOperation, doc_len: usize) -> TextOperation {
        operation.retain(doc_len - operation.base_len());
        operation
    }

    mod compose {
        use super::*;
        use pretty_assertions::assert_eq;

        fn assert_composes(a: &TextOperation, b: &TextOperation, doc: &str) {
            let sequential = b.apply(&a.apply(doc).unwrap()).unwrap();
            let composed = a.compose(b).unwrap();
            assert_eq!(composed.apply(doc).unwrap(), sequential);
        }

        #[test]
        fn insert_then_delete_of_it_cancels() {
            let a = padded(insert(2, "xy"), 5);
            let b = padded(delete(2, 2), 7);
            let composed = a.compose(&b).unwrap();
            assert!(composed.is_noop());
            assert_eq!(composed.apply("hello").unwrap(), "hello");
        }

        #[test]
        fn retains_split_against_each_other() {
            assert_composes(&padded(insert(0, "ab"), 2), &padded(delete(1, 2), 4), "xy");
            assert_composes(&padded(replace(1, 2, "Q"), 4), &padded(insert(2, "!"), 3), "abcd");
            assert_composes(&padded(delete(0, 1), 4), &padded(insert(3, "end"), 3), "abcd");
        }

        #[test]
        fn rejects_length_mismatch() {
            let a = insert(0, "ab");
            let b = delete(0, 1);
            // a produces 2 characters, b expects 1.
            assert!(matches!(
                a.compose(&b),
                Err(OtError::LengthMismatch { .. })
            ));
        }
    }

    mod transform {
        use super::*;
        use pretty_assertions::assert_eq;

        fn assert_converges(a: &TextOperation, b: &TextOperation, doc: &str) -> String {
            let (a_prime, b_prime) = a.transform(b).unwrap();
            let b_then_a = a_prime.apply(&b.apply(doc).unwrap()).unwrap();
            let a_then_b = b_prime.apply(&a.apply(doc).unwrap()).unwrap();
            assert_eq!(b_then_a, a_then_b);
            b_then_a
        }

        #[test]
        fn concurrent_inserts_at_distinct_positions() {
            assert_eq!(
                assert_converges(&padded(insert(0, "X"), 5), &insert(5, "!"), "hello"),
                "Xhello!"
            );
        }

        #[test]
        fn same_position_inserts_put_the_left_operand_first() {
            assert_eq!(
                assert_converges(&padded(insert(2, "a"), 5), &padded(insert(2, "b"), 5), "hello"),
                "heabllo"
            );
        }

        #[test]
        fn insert_into_concurrently_deleted_range_survives() {
            assert_eq!(
                assert_converges(&padded(insert(3, "X"), 6), &padded(delete(1, 4), 6), "abcdef"),
                "aXf"
            );
        }

        #[test]
        fn overlapping_deletes_remove_the_union() {
            assert_eq!(
                assert_converges(&padded(delete(1, 3), 6), &padded(delete(2, 3), 6), "abcdef"),
                "af"
            );
        }

        #[test]
        fn rejects_different_base_lengths() {
            assert!(matches!(
                insert(3, "x").transform(&insert(4, "y")),
                Err(OtError::LengthMismatch { .. })
            ));
        }
    }

    mod wire {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn serializes_to_flat_array() {
            let operation = replace(5, 1, " world");
            assert_eq!(operation.to_json(), serde_json::json!([5, " world", -1]));
        }

        #[test]
        fn round_trips() {
            let operation = replace(2, 3, "öäü");
            let decoded = TextOperation::from_json(&operation.to_json()).unwrap();
            assert_eq!(decoded, operation);
        }

        #[test]
        fn decoding_recanonicalizes() {
            // Semantically valid but not canonical: delete before insert,
            // split retains.
            let decoded =
                TextOperation::from_json(&serde_json::json!([1, 1, -2, "x"])).unwrap();
            assert_eq!(
                decoded.components(),
                &[
                    OpComponent::Retain(2),
                    OpComponent::Insert("x".into()),
                    OpComponent::Delete(2),
                ]
            );
        }

        #[test]
        fn rejects_invalid_elements() {
            for bad in [
                serde_json::json!([0]),
                serde_json::json!([""]),
                serde_json::json!([true]),
                serde_json::json!([1.5]),
                serde_json::json!([[1]]),
                serde_json::json!({"retain": 1}),
            ] {
                assert!(matches!(
                    TextOperation::from_json(&bad),
                    Err(OtError::InvalidEncoding(_))
                ));
            }
        }
    }

    mod diff {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn chunks_convert_to_an_operation() {
            let chunks = dissimilar::diff("hello world", "hello brave world");
            let operation: TextOperation = chunks.into();
            assert_eq!(operation.apply("hello world").unwrap(), "hello brave world");
        }

        #[test]
        fn identical_documents_diff_to_a_noop() {
            let chunks = dissimilar::diff("tö🥕s\nt", "tö🥕s\nt");
            let operation: TextOperation = chunks.into();
            assert!(operation.is_noop());
        }
    }
}
