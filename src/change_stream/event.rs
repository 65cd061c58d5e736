//! Contains the event types a change stream delivers.

use bson::{Bson, Document, RawBson, RawDocumentBuf, Timestamp};
use serde::{Deserialize, Serialize};

use crate::{
    change_stream::options::ChangeStreamOptions,
    deployment::AggregateResponse,
    error::Result,
};

/// An opaque token used for resuming an interrupted
/// [`ChangeStream`](crate::change_stream::ChangeStream).
///
/// When starting a new change stream, the
/// [`start_after`](crate::client::Watch::start_after) and
/// [`resume_after`](crate::client::Watch::resume_after) options can be specified
/// with instances of `ResumeToken`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumeToken(pub(crate) RawBson);

impl ResumeToken {
    pub(crate) fn initial(
        options: Option<&ChangeStreamOptions>,
        response: &AggregateResponse,
    ) -> Option<ResumeToken> {
        match Self::from_raw(response.post_batch_resume_token.clone()) {
            // Empty batches advance the stream position to the batch boundary.
            Some(token) if response.first_batch.is_empty() => Some(token),
            _ => options.and_then(|o| o.start_after.clone().or_else(|| o.resume_after.clone())),
        }
    }

    pub(crate) fn from_raw(doc: Option<RawDocumentBuf>) -> Option<ResumeToken> {
        doc.map(|doc| ResumeToken(RawBson::Document(doc)))
    }

    /// Convert the token into a [`Bson`] value for inspection or storage.
    pub fn parsed(self) -> Result<Bson> {
        Ok(self.0.try_into()?)
    }
}

/// A `ChangeStreamEvent` represents a single mutation or administrative action
/// visible to the stream. The `full_document` field is parameterized so that a
/// user-specified pipeline reshaping the looked-up document can be deserialized
/// into a custom type.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChangeStreamEvent<T> {
    /// An opaque token for use when resuming an interrupted stream. Present on
    /// every event; a missing token is a protocol violation that closes the
    /// stream.
    #[serde(rename = "_id")]
    pub id: ResumeToken,

    /// Describes the type of operation represented in this change notification.
    pub operation_type: OperationType,

    /// The cluster time at which the change occurred.
    pub cluster_time: Option<Timestamp>,

    /// The transaction number of the transaction the change was part of, if any.
    pub txn_number: Option<i64>,

    /// The session identifier of the session the change was part of, if any.
    pub lsid: Option<Document>,

    /// Identifies the collection or database where the event occurred. For
    /// `dropDatabase` only the `db` component is present; absent on
    /// `invalidate`.
    pub ns: Option<EventNamespace>,

    /// The new namespace of a renamed collection. Only included for
    /// [`OperationType::Rename`].
    pub to: Option<EventNamespace>,

    /// For unsharded collections this contains a single field, `_id`, with the
    /// value of the `_id` of the mutated document. For sharded collections this
    /// contains all the components of the shard key, followed by the `_id` if
    /// the `_id` isn't part of the shard key.
    pub document_key: Option<Document>,

    /// A description of the fields updated and removed by an update operation.
    pub update_description: Option<UpdateDescription>,

    /// For `insert` and `replace`, the document being inserted or the
    /// replacement document, respectively.
    ///
    /// For `update`, a copy of the full document from some point after the
    /// update, present only when full-document lookup was requested at stream
    /// creation.
    pub full_document: Option<T>,
}

/// Describes which fields have been updated or removed from a document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateDescription {
    /// The names of the fields that were changed, with their new values.
    pub updated_fields: Option<Document>,

    /// The names of the fields that were removed.
    pub removed_fields: Option<Vec<String>>,

    /// Arrays that were truncated by the update.
    pub truncated_arrays: Option<Vec<TruncatedArray>>,
}

/// An array truncated by an update operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TruncatedArray {
    /// The name of the truncated field.
    pub field: String,

    /// The number of elements remaining in the array.
    pub new_size: i32,
}

/// The operation type represented in a given change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted.
    Insert,

    /// Fields of a document were updated.
    Update,

    /// A document was replaced.
    Replace,

    /// A document was deleted.
    Delete,

    /// A collection was dropped.
    Drop,

    /// A collection was renamed.
    Rename,

    /// A database was dropped.
    DropDatabase,

    /// The stream reached a point after which it cannot continue; collection
    /// scoped streams receive this after the watched collection is dropped.
    Invalidate,
}

/// Identifies the collection or database where an event occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct EventNamespace {
    /// The database name.
    pub db: String,

    /// The collection name. Absent for database-level events such as
    /// `dropDatabase`.
    pub coll: Option<String>,
}
