//! Options for creating change streams.

use std::time::Duration;

use bson::{Bson, Document, Timestamp};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{change_stream::event::ResumeToken, deployment::AggregateOptions};

/// The options for creating a change stream. The serialized fields form the body
/// of the `$changeStream` pipeline stage; the `serde(skip)` fields are forwarded
/// to the aggregation cursor instead.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ChangeStreamOptions {
    /// Configures how the
    /// [`full_document`](crate::change_stream::event::ChangeStreamEvent::full_document)
    /// field is populated. The value is forwarded to the server verbatim so
    /// that modes introduced by future server versions pass through untouched.
    pub full_document: Option<FullDocumentType>,

    /// Specifies the logical starting point for the new change stream. Note
    /// that if a watched collection is dropped and recreated or newly renamed,
    /// `start_after` should be set instead. `resume_after` and `start_after`
    /// cannot be set simultaneously.
    pub resume_after: Option<ResumeToken>,

    /// Takes a resume token and starts a new change stream returning the first
    /// notification after the token. This allows users to watch collections
    /// that have been dropped and recreated or newly renamed collections
    /// without missing any notifications.
    pub start_after: Option<ResumeToken>,

    /// The change stream will only provide changes that occurred at or after
    /// the specified timestamp. Any command run against the server will return
    /// an operation time that can be used here.
    pub start_at_operation_time: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(setter(skip))]
    pub(crate) all_changes_for_cluster: Option<bool>,

    /// The number of documents to return per batch.
    #[serde(skip)]
    pub batch_size: Option<u32>,

    /// The maximum amount of time for the server to wait on new documents to
    /// satisfy a change stream query.
    #[serde(skip)]
    pub max_await_time: Option<Duration>,

    /// The collation to use for the aggregation.
    #[serde(skip)]
    pub collation: Option<Document>,

    /// Tags the query with an arbitrary comment to help trace the operation
    /// through the database profiler, currentOp and logs.
    #[serde(skip)]
    pub comment: Option<Bson>,

    /// The read preference for the aggregation.
    #[serde(skip)]
    pub read_preference: Option<Document>,
}

impl ChangeStreamOptions {
    pub(crate) fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            batch_size: self.batch_size,
            max_await_time: self.max_await_time,
            collation: self.collation.clone(),
            comment: self.comment.clone(),
            read_preference: self.read_preference.clone(),
        }
    }
}

/// Describes the modes for configuring the
/// [`full_document`](crate::change_stream::event::ChangeStreamEvent::full_document)
/// field of a change stream event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum FullDocumentType {
    /// The field will be populated with a copy of the entire document that was
    /// updated.
    UpdateLookup,

    /// The field will be populated for replace and update events and will
    /// contain the post-image. The stream errors if the post-image is
    /// unavailable.
    Required,

    /// Same as `Required`, except the field is empty rather than erroring when
    /// the post-image is unavailable.
    WhenAvailable,

    /// User-defined other types for forward compatibility.
    #[serde(untagged)]
    Other(String),
}
