//! Handles for the scopes a change stream can watch.

use std::{future::IntoFuture, sync::Arc, time::Duration};

use bson::{Bson, Document, Timestamp};
use futures_core::future::BoxFuture;
use futures_util::FutureExt;

use crate::{
    change_stream::{
        event::{ChangeStreamEvent, ResumeToken},
        options::{ChangeStreamOptions, FullDocumentType},
        ChangeStream,
        StreamInner,
        WatchArgs,
    },
    deployment::{AggregateTarget, Deployment, Namespace},
    error::{Error, Result},
    event::{EventHandler, StreamEvent},
};

/// A handle to a deployment, and the scope for cluster-wide change streams.
#[derive(Clone, Debug)]
pub struct Client {
    deployment: Arc<dyn Deployment>,
}

impl Client {
    /// Construct a `Client` over the given deployment.
    pub fn new(deployment: Arc<dyn Deployment>) -> Self {
        Self { deployment }
    }

    /// Gets a handle to a database with the given name.
    pub fn database(&self, name: impl Into<String>) -> Database {
        Database {
            client: self.clone(),
            name: name.into(),
        }
    }

    /// Starts a new [`ChangeStream`] that receives events for all changes in
    /// the cluster. The stream does not observe changes from system
    /// collections or the "config", "local" or "admin" databases.
    ///
    /// Change streams require either a "majority" read concern or no read
    /// concern. Anything else will cause a server error.
    pub fn watch(&self) -> Watch<'_> {
        Watch::new_cluster(self)
    }

    pub(crate) fn deployment(&self) -> &Arc<dyn Deployment> {
        &self.deployment
    }
}

/// A handle to a database, and the scope for database-level change streams.
#[derive(Clone, Debug)]
pub struct Database {
    client: Client,
    name: String,
}

impl Database {
    /// The name of the database.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets a handle to a collection in this database with the given name.
    pub fn collection(&self, name: impl Into<String>) -> Collection {
        Collection {
            client: self.client.clone(),
            ns: Namespace::new(self.name.clone(), name),
        }
    }

    /// Starts a new [`ChangeStream`] that receives events for all changes in
    /// this database. The stream does not observe changes from system
    /// collections and cannot be started on the "config", "local" or "admin"
    /// databases.
    pub fn watch(&self) -> Watch<'_> {
        Watch::new(
            &self.client,
            AggregateTarget::Database(self.name.clone()),
        )
    }
}

/// A handle to a collection, and the scope for collection-level change streams.
#[derive(Clone, Debug)]
pub struct Collection {
    client: Client,
    ns: Namespace,
}

impl Collection {
    /// The namespace of the collection.
    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Starts a new [`ChangeStream`] that receives events for all changes in
    /// this collection. A change stream cannot be started on system
    /// collections.
    pub fn watch(&self) -> Watch<'_> {
        Watch::new(&self.client, AggregateTarget::Collection(self.ns.clone()))
    }
}

/// Starts a new [`ChangeStream`] that receives events for all changes in a
/// given scope. Create by calling [`Client::watch`], [`Database::watch`], or
/// [`Collection::watch`], then `await` to open the stream.
#[must_use]
pub struct Watch<'a> {
    client: &'a Client,
    target: AggregateTarget,
    pipeline: Vec<Document>,
    options: Option<ChangeStreamOptions>,
    monitor: Option<EventHandler<StreamEvent>>,
    cluster: bool,
}

impl<'a> Watch<'a> {
    fn new(client: &'a Client, target: AggregateTarget) -> Self {
        Self {
            client,
            target,
            pipeline: vec![],
            options: None,
            monitor: None,
            cluster: false,
        }
    }

    fn new_cluster(client: &'a Client) -> Self {
        Self {
            client,
            target: AggregateTarget::Database("admin".to_string()),
            pipeline: vec![],
            options: None,
            monitor: None,
            cluster: true,
        }
    }

    fn options(&mut self) -> &mut ChangeStreamOptions {
        self.options.get_or_insert_with(Default::default)
    }

    /// Apply an aggregation pipeline to the change stream.
    ///
    /// Note that using a `$project` stage to remove any of the `_id`,
    /// `operationType` or `ns` fields will cause an error. These fields are
    /// required to support resumability.
    pub fn pipeline(mut self, value: impl IntoIterator<Item = Document>) -> Self {
        self.pipeline = value.into_iter().collect();
        self
    }

    /// Overwrite all options at once. Fields set by earlier calls to the
    /// individual setters are discarded.
    pub fn with_options(mut self, value: impl Into<Option<ChangeStreamOptions>>) -> Self {
        self.options = value.into();
        self
    }

    /// Configures how the `full_document` field of returned events is
    /// populated. The value is forwarded to the server verbatim.
    pub fn full_document(mut self, value: FullDocumentType) -> Self {
        self.options().full_document = Some(value);
        self
    }

    /// Specifies the logical starting point for the new change stream. Note
    /// that if a watched collection is dropped and recreated or newly renamed,
    /// `start_after` should be set instead. `resume_after` and `start_after`
    /// cannot be set simultaneously.
    pub fn resume_after(mut self, value: impl Into<Option<ResumeToken>>) -> Self {
        // Accepts `impl Into<Option<ResumeToken>>` so the output of
        // `ChangeStream::resume_token()` can be passed in directly.
        self.options().resume_after = value.into();
        self
    }

    /// Takes a resume token and starts a new change stream returning the first
    /// notification after the token.
    pub fn start_after(mut self, value: impl Into<Option<ResumeToken>>) -> Self {
        self.options().start_after = value.into();
        self
    }

    /// The change stream will only provide changes that occurred at or after
    /// the specified timestamp.
    pub fn start_at_operation_time(mut self, value: Timestamp) -> Self {
        self.options().start_at_operation_time = Some(value);
        self
    }

    /// The number of documents to return per batch.
    pub fn batch_size(mut self, value: u32) -> Self {
        self.options().batch_size = Some(value);
        self
    }

    /// The maximum amount of time for the server to wait on new documents to
    /// satisfy a change stream query.
    pub fn max_await_time(mut self, value: Duration) -> Self {
        self.options().max_await_time = Some(value);
        self
    }

    /// The collation to use for the aggregation.
    pub fn collation(mut self, value: Document) -> Self {
        self.options().collation = Some(value);
        self
    }

    /// Tags the operation with an arbitrary comment. Forwarded verbatim,
    /// whether a string or a structured value.
    pub fn comment(mut self, value: impl Into<Bson>) -> Self {
        self.options().comment = Some(value.into());
        self
    }

    /// The read preference for the aggregation.
    pub fn read_preference(mut self, value: Document) -> Self {
        self.options().read_preference = Some(value);
        self
    }

    /// Register a handler for cursor instrumentation events.
    pub fn monitor(mut self, value: impl Into<EventHandler<StreamEvent>>) -> Self {
        self.monitor = Some(value.into());
        self
    }

    fn validate(&self) -> Result<()> {
        match &self.target {
            AggregateTarget::Collection(ns) if ns.db.is_empty() || ns.coll.is_empty() => {
                return Err(Error::invalid_argument(
                    "cannot watch a collection with an empty database or collection name",
                ));
            }
            AggregateTarget::Database(db) if db.is_empty() => {
                return Err(Error::invalid_argument(
                    "cannot watch a database with an empty name",
                ));
            }
            _ => {}
        }
        if let Some(options) = &self.options {
            let anchors = usize::from(options.resume_after.is_some())
                + usize::from(options.start_after.is_some())
                + usize::from(options.start_at_operation_time.is_some());
            if anchors > 1 {
                return Err(Error::invalid_argument(
                    "resumeAfter, startAfter, and startAtOperationTime are mutually exclusive",
                ));
            }
        }
        Ok(())
    }

    async fn execute(mut self) -> Result<ChangeStream<ChangeStreamEvent<Document>>> {
        self.validate()?;
        if self.cluster {
            self.options().all_changes_for_cluster = Some(true);
        }
        let args = WatchArgs {
            pipeline: self.pipeline,
            target: self.target,
            options: self.options,
        };
        let inner =
            StreamInner::open(self.client.deployment().clone(), args, self.monitor).await?;
        Ok(ChangeStream::new(inner))
    }
}

impl<'a> IntoFuture for Watch<'a> {
    type Output = Result<ChangeStream<ChangeStreamEvent<Document>>>;
    type IntoFuture = BoxFuture<'a, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.execute().boxed()
    }
}
