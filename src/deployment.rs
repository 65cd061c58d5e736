//! The interface between the change stream core and the deployment it runs against.
//!
//! Everything below this seam (server selection, connection management, and the
//! wire protocol) is the responsibility of the [`Deployment`] implementation.
//! The change stream core only issues the opening `aggregate`, follow-up
//! `getMore` round trips, and best-effort `killCursors` requests through it.

use std::{collections::VecDeque, fmt, time::Duration};

use bson::{Bson, Document, RawDocumentBuf, Timestamp};
use futures_core::future::BoxFuture;

use crate::error::Result;

/// A database-and-collection pair identifying the namespace a cursor iterates.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// The database name.
    pub db: String,

    /// The collection name.
    pub coll: String,
}

impl Namespace {
    /// Construct a `Namespace` from a database and collection name.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// The scope an aggregation runs against.
#[derive(Clone, Debug)]
pub enum AggregateTarget {
    /// Aggregate over a single collection.
    Collection(Namespace),

    /// Aggregate at the database level.
    Database(String),
}

impl AggregateTarget {
    /// The name of the database the aggregation runs against.
    pub fn db_name(&self) -> &str {
        match self {
            AggregateTarget::Collection(ns) => ns.db.as_str(),
            AggregateTarget::Database(db) => db.as_str(),
        }
    }
}

/// Options forwarded to the aggregation unchanged; none of these affect the
/// `$changeStream` stage itself.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct AggregateOptions {
    /// The number of documents the server returns per batch.
    pub batch_size: Option<u32>,

    /// The maximum amount of time for the server to wait on new documents to
    /// satisfy a `getMore` on a tailable cursor.
    pub max_await_time: Option<Duration>,

    /// The collation to use for the aggregation.
    pub collation: Option<Document>,

    /// An arbitrary comment to attach to the operation. Forwarded verbatim,
    /// whether a string or a structured value.
    pub comment: Option<Bson>,

    /// The read preference used to select the server the aggregation runs on.
    pub read_preference: Option<Document>,
}

/// The `aggregate` command that opens a change stream cursor.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct AggregateCommand {
    /// The scope to run against.
    pub target: AggregateTarget,

    /// The full pipeline, beginning with the `$changeStream` stage.
    pub pipeline: Vec<Document>,

    /// Cursor-level options, forwarded as-is.
    pub options: AggregateOptions,
}

/// The server's reply to the `aggregate` that opened a cursor.
#[derive(Clone, Debug)]
pub struct AggregateResponse {
    /// The server cursor id; `0` means the cursor is already exhausted.
    pub cursor_id: i64,

    /// The namespace the cursor iterates.
    pub ns: Namespace,

    /// The documents of `cursor.firstBatch`.
    pub first_batch: VecDeque<RawDocumentBuf>,

    /// The `cursor.postBatchResumeToken` field, if the server returned one.
    pub post_batch_resume_token: Option<RawDocumentBuf>,

    /// The `operationTime` of the aggregate response.
    pub operation_time: Option<Timestamp>,
}

impl AggregateResponse {
    /// Construct a response with the given cursor id and namespace and no batch data.
    pub fn empty(cursor_id: i64, ns: Namespace) -> Self {
        Self {
            cursor_id,
            ns,
            first_batch: VecDeque::new(),
            post_batch_resume_token: None,
            operation_time: None,
        }
    }
}

/// A `getMore` round trip against an open cursor.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct GetMoreRequest {
    /// The id of the cursor to advance.
    pub cursor_id: i64,

    /// The namespace the cursor iterates.
    pub ns: Namespace,

    /// The number of documents to request.
    pub batch_size: Option<u32>,

    /// The server-side await time for tailable cursors.
    pub max_await_time: Option<Duration>,

    /// The operation comment. Populated only when the negotiated wire version
    /// supports comments on `getMore` (4.4+); omitted below that.
    pub comment: Option<Bson>,
}

/// One batch of documents returned by a `getMore`.
#[derive(Clone, Debug)]
pub struct CursorBatch {
    /// The server cursor id; `0` means the cursor is exhausted.
    pub cursor_id: i64,

    /// The documents of `cursor.nextBatch`.
    pub batch: VecDeque<RawDocumentBuf>,

    /// The `cursor.postBatchResumeToken` field, if the server returned one.
    pub post_batch_resume_token: Option<RawDocumentBuf>,
}

/// Handle to the deployment a change stream runs against.
///
/// Implementations are responsible for server selection and the wire protocol,
/// and should attach server-provided error labels and the negotiated wire
/// version to the errors they surface (see [`Error::new`](crate::error::Error::new)
/// and [`Error::with_wire_version`](crate::error::Error::with_wire_version)).
pub trait Deployment: Send + Sync + fmt::Debug {
    /// Run an `aggregate` command, returning the opened cursor.
    fn run_aggregate(&self, command: AggregateCommand) -> BoxFuture<'_, Result<AggregateResponse>>;

    /// Run a `getMore` against an open cursor.
    fn run_get_more(&self, request: GetMoreRequest) -> BoxFuture<'_, Result<CursorBatch>>;

    /// Kill an open server cursor. Failures are ignored by the caller.
    fn kill_cursor(&self, ns: &Namespace, cursor_id: i64) -> BoxFuture<'_, Result<()>>;

    /// Whether the topology currently has a usable connection to the deployment.
    fn is_connected(&self) -> bool;

    /// The maximum wire version negotiated with the deployment, if any server
    /// has been contacted yet.
    fn wire_version(&self) -> Option<i32>;
}
