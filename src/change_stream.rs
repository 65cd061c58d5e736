//! Contains the functionality for change streams.
pub(crate) mod emitter;
pub mod event;
pub mod options;
pub(crate) mod resume;

use std::{
    marker::PhantomData,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
    },
    task::{Context, Poll},
};

use bson::{Document, RawDocumentBuf};
use derive_where::derive_where;
use futures_core::{future::BoxFuture, Stream};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{
    change_stream::{
        emitter::EmitterHandle,
        event::ResumeToken,
        options::ChangeStreamOptions,
        resume::{build_stage, ResumeState},
    },
    cursor::ChangeStreamCursor,
    deployment::{AggregateCommand, AggregateTarget, Deployment},
    error::{Error, ErrorKind, Result},
    event::{EventHandler, StreamEvent, StreamNotification},
};

/// A `ChangeStream` streams the ongoing changes of its associated collection,
/// database or deployment. `ChangeStream` instances should be created with the
/// `watch` method on the relevant target.
///
/// `ChangeStream`s are "resumable", meaning that they can be restarted at a
/// given place in the stream of events. This is done automatically when the
/// `ChangeStream` encounters certain "resumable" errors, such as transient
/// network failures. It can also be done manually by passing a [`ResumeToken`]
/// retrieved from a past event into either the
/// [`resume_after`](crate::client::Watch::resume_after) or
/// [`start_after`](crate::client::Watch::start_after) options used to create
/// the `ChangeStream`.
///
/// A `ChangeStream` is consumed in exactly one of two modes, chosen by the
/// first consumption call and fixed for the stream's lifetime:
///
/// * **iterator mode**: [`next`](ChangeStream::next),
///   [`try_next`](ChangeStream::try_next), [`has_next`](ChangeStream::has_next),
///   or the [`Stream`] implementation:
///
/// ```no_run
/// # use watchstream::{Client, error::Result};
/// # async fn func(client: Client) -> Result<()> {
/// # let coll = client.database("foo").collection("bar");
/// let mut change_stream = coll.watch().await?;
/// while let Some(event) = change_stream.next_if_any().await? {
///     println!("operation performed: {:?}", event.operation_type);
/// }
/// # Ok(())
/// # }
/// ```
///
/// * **emitter mode**: a push adapter attached with
///   [`subscribe`](ChangeStream::subscribe), which drives the stream from a
///   background task and fans events out to the registered handler.
///
/// Attempting to cross modes fails with
/// [`ErrorKind::ModeConflict`](crate::error::ErrorKind::ModeConflict) and does
/// not change the stream's state.
#[derive_where(Debug)]
pub struct ChangeStream<T>
where
    T: DeserializeOwned,
{
    /// `None` while the stream state is lent out: to an in-flight future of
    /// the `Stream` implementation, or to the emitter task after `subscribe`.
    inner: Option<StreamInner>,

    mode: Mode,

    /// Shared view of the resume record, readable in both modes.
    resume: Arc<Mutex<ResumeState>>,

    closed: Arc<AtomicBool>,

    emitter: Option<EmitterHandle<T>>,

    #[derive_where(skip)]
    poll_future: Option<BoxFuture<'static, NextDone>>,

    _phantom: PhantomData<fn() -> T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unset,
    Iterating,
    Emitting,
}

struct NextDone {
    inner: StreamInner,
    out: Result<Option<RawDocumentBuf>>,
}

impl<T> ChangeStream<T>
where
    T: DeserializeOwned,
{
    pub(crate) fn new(inner: StreamInner) -> Self {
        let resume = inner.resume.clone();
        let closed = inner.closed.clone();
        Self {
            inner: Some(inner),
            mode: Mode::Unset,
            resume,
            closed,
            emitter: None,
            poll_future: None,
            _phantom: PhantomData,
        }
    }

    /// Returns the cached resume token that can be used to resume after the
    /// most recently returned change.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.resume.lock().unwrap().resume_token.clone()
    }

    /// Returns whether the change stream will continue to receive events.
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Update the type streamed values will be parsed as.
    ///
    /// Must be called before the stream is consumed; any consumption state is
    /// discarded.
    pub fn with_type<D: DeserializeOwned>(mut self) -> ChangeStream<D> {
        ChangeStream {
            inner: self.inner.take(),
            mode: self.mode,
            resume: self.resume.clone(),
            closed: self.closed.clone(),
            emitter: None,
            poll_future: None,
            _phantom: PhantomData,
        }
    }

    /// Retrieves the next event from the change stream, waiting for one to
    /// arrive if none is buffered.
    ///
    /// Fails with [`ErrorKind::StreamClosed`] once the stream has been closed,
    /// including by server-side invalidation.
    pub async fn next(&mut self) -> Result<T> {
        self.set_mode(Mode::Iterating)?;
        let inner = self.reclaimed_inner().await?;
        let doc = inner.next().await?;
        bson::from_slice(doc.as_bytes()).map_err(Error::from)
    }

    /// Retrieves the next event from the change stream, if any is available
    /// after at most one request to the server.
    ///
    /// This method should be used when storing the resume token in order to
    /// ensure the most up to date token is received, e.g.
    ///
    /// ```no_run
    /// # use watchstream::{Client, error::Result};
    /// # async fn func(client: Client) -> Result<()> {
    /// # let coll = client.database("foo").collection("bar");
    /// let mut change_stream = coll.watch().await?;
    /// let mut resume_token = None;
    /// while change_stream.is_alive() {
    ///     if let Some(event) = change_stream.next_if_any().await? {
    ///         // process event
    ///     }
    ///     resume_token = change_stream.resume_token();
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn next_if_any(&mut self) -> Result<Option<T>> {
        self.set_mode(Mode::Iterating)?;
        let inner = self.reclaimed_inner().await?;
        match inner.try_next().await? {
            Some(doc) => bson::from_slice(doc.as_bytes())
                .map(Some)
                .map_err(Error::from),
            None => Ok(None),
        }
    }

    /// Alias for [`next_if_any`](ChangeStream::next_if_any), under the name
    /// drivers conventionally give this operation.
    pub async fn try_next(&mut self) -> Result<Option<T>> {
        self.next_if_any().await
    }

    /// Returns whether another event is available, waiting for the server if
    /// necessary. Returns `false` only once the stream has terminated.
    pub async fn has_next(&mut self) -> Result<bool> {
        self.set_mode(Mode::Iterating)?;
        let inner = self.reclaimed_inner().await?;
        inner.has_next().await
    }

    /// Attach a push handler to the stream, switching it into emitter mode.
    ///
    /// A background task drives the cursor and dispatches
    /// [`StreamNotification`]s to the handler: one `Event` per change, then an
    /// `Error` and a final `Closed` on terminal failure, or just `Closed` when
    /// the stream ends. Resumable errors are handled internally, exactly as in
    /// iterator mode.
    ///
    /// Fails with [`ErrorKind::ModeConflict`] if the stream has already been
    /// iterated. Attaching after [`unsubscribe`](ChangeStream::unsubscribe)
    /// re-uses the existing task.
    pub fn subscribe(
        &mut self,
        handler: impl Into<EventHandler<StreamNotification<T>>>,
    ) -> Result<()>
    where
        T: Send + Sync + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ErrorKind::StreamClosed.into());
        }
        self.set_mode(Mode::Emitting)?;
        let handler = handler.into();
        if let Some(emitter) = &self.emitter {
            return emitter.attach(handler);
        }
        let inner = match self.inner.take() {
            Some(inner) => inner,
            None => return Err(ErrorKind::NoCursor.into()),
        };
        self.emitter = Some(emitter::spawn(inner, handler));
        Ok(())
    }

    /// Detach the current push handler. The stream stays alive and in emitter
    /// mode; a later [`subscribe`](ChangeStream::subscribe) resumes delivery.
    pub fn unsubscribe(&mut self) -> Result<()> {
        match &self.emitter {
            Some(emitter) => emitter.detach(),
            None => Err(ErrorKind::ModeConflict {
                message: "no push handler is attached to this change stream".to_string(),
            }
            .into()),
        }
    }

    /// Close the change stream, releasing the server cursor.
    ///
    /// Closing is authoritative: any operation after `close` fails with
    /// [`ErrorKind::StreamClosed`], and no further event is delivered in
    /// either mode.
    pub async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(emitter) = self.emitter.take() {
            emitter.close().await;
            return;
        }
        if self.reclaimed_inner().await.is_err() {
            return;
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.close().await;
        }
    }

    fn set_mode(&mut self, requested: Mode) -> Result<()> {
        match (self.mode, requested) {
            (Mode::Unset, requested) => {
                self.mode = requested;
                Ok(())
            }
            (Mode::Iterating, Mode::Iterating) | (Mode::Emitting, Mode::Emitting) => Ok(()),
            (Mode::Iterating, _) => Err(ErrorKind::ModeConflict {
                message: "cannot attach a push handler to an iterated change stream".to_string(),
            }
            .into()),
            (Mode::Emitting, _) => Err(ErrorKind::ModeConflict {
                message: "cannot iterate a change stream with a push handler attached".to_string(),
            }
            .into()),
        }
    }

    /// Retrieve the stream state, first settling any future left behind by a
    /// cancelled `Stream` poll so its outcome is redelivered rather than lost.
    async fn reclaimed_inner(&mut self) -> Result<&mut StreamInner> {
        if let Some(fut) = self.poll_future.take() {
            let NextDone { mut inner, out } = fut.await;
            match out {
                Ok(None) => {}
                other => inner.pending = Some(other),
            }
            self.inner = Some(inner);
        }
        match self.inner.as_mut() {
            Some(inner) => Ok(inner),
            None => Err(Error::internal("change stream state is lent out")),
        }
    }
}

impl<T> Stream for ChangeStream<T>
where
    T: DeserializeOwned,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = Pin::into_inner(self);
        if let Err(e) = this.set_mode(Mode::Iterating) {
            return Poll::Ready(Some(Err(e)));
        }
        loop {
            if let Some(fut) = this.poll_future.as_mut() {
                let NextDone { inner, out } = match fut.poll_unpin(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(done) => done,
                };
                this.poll_future = None;
                this.inner = Some(inner);
                match out {
                    Ok(Some(doc)) => {
                        return Poll::Ready(Some(
                            bson::from_slice(doc.as_bytes()).map_err(Error::from),
                        ))
                    }
                    Ok(None) => continue,
                    Err(e) => return Poll::Ready(Some(Err(e))),
                }
            }
            if this.closed.load(Ordering::SeqCst) {
                return Poll::Ready(None);
            }
            let mut inner = match this.inner.take() {
                Some(inner) => inner,
                None => {
                    return Poll::Ready(Some(Err(Error::internal(
                        "change stream polled while its state is lent out",
                    ))))
                }
            };
            this.poll_future = Some(
                async move {
                    let out = inner.try_next().await;
                    NextDone { inner, out }
                }
                .boxed(),
            );
        }
    }
}

impl<T> Drop for ChangeStream<T>
where
    T: DeserializeOwned,
{
    fn drop(&mut self) {
        // The emitter task owns its state and tears down when the control
        // channel closes with the handle.
        if let Some(mut inner) = self.inner.take() {
            if inner.is_closed() || inner.cursor.is_exhausted() {
                return;
            }
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { inner.close().await });
            }
        }
    }
}

/// Arguments to the `watch` that created a change stream, captured unchanged
/// to allow resume.
#[derive(Debug, Clone)]
pub(crate) struct WatchArgs {
    /// The pipeline of stages to append to the initial `$changeStream` stage.
    pub(crate) pipeline: Vec<Document>,

    /// The original target of the change stream.
    pub(crate) target: AggregateTarget,

    /// The options provided to the initial `$changeStream` stage.
    pub(crate) options: Option<ChangeStreamOptions>,
}

/// The state of a change stream: the active cursor plus everything needed to
/// replace it after a resumable error.
#[derive(Debug)]
pub(crate) struct StreamInner {
    deployment: Arc<dyn Deployment>,
    pub(crate) cursor: ChangeStreamCursor,
    args: WatchArgs,
    resume: Arc<Mutex<ResumeState>>,
    monitor: Option<EventHandler<StreamEvent>>,
    resume_attempted: bool,
    closed: Arc<AtomicBool>,

    /// Outcome recovered from a cancelled `Stream` poll, redelivered by the
    /// next consumption call.
    pending: Option<Result<Option<RawDocumentBuf>>>,
}

impl StreamInner {
    pub(crate) async fn open(
        deployment: Arc<dyn Deployment>,
        args: WatchArgs,
        monitor: Option<EventHandler<StreamEvent>>,
    ) -> Result<StreamInner> {
        let resume = Arc::new(Mutex::new(ResumeState::default()));
        let cursor = execute_watch(&deployment, &args, &resume, &monitor).await?;
        Ok(StreamInner {
            deployment,
            cursor,
            args,
            resume,
            monitor,
            resume_attempted: false,
            closed: Arc::new(AtomicBool::new(false)),
            pending: None,
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Advance by at most one server round trip. `Ok(None)` means no event was
    /// buffered afterwards; the stream may or may not be able to produce more.
    pub(crate) async fn try_next(&mut self) -> Result<Option<RawDocumentBuf>> {
        if let Some(out) = self.pending.take() {
            return out;
        }
        if self.is_closed() {
            return Err(ErrorKind::StreamClosed.into());
        }
        loop {
            match self.cursor.try_advance().await {
                Ok(doc) => {
                    if doc.is_none() && self.cursor.is_exhausted() && !self.cursor.has_buffered() {
                        // The server released the cursor: implicit close.
                        debug!(
                            target: "watchstream::stream",
                            "change stream cursor exhausted; closing",
                        );
                        self.mark_closed();
                    }
                    return Ok(doc);
                }
                Err(e) => self.handle_error(e).await?,
            }
        }
    }

    /// Block until an event is buffered or the stream terminates.
    pub(crate) async fn has_next(&mut self) -> Result<bool> {
        if let Some(out) = self.pending.take() {
            match out {
                Ok(Some(doc)) => {
                    self.pending = Some(Ok(Some(doc)));
                    return Ok(true);
                }
                Ok(None) => {}
                // Redeliver the recovered failure.
                Err(e) => return Err(e),
            }
        }
        if self.is_closed() {
            return Err(ErrorKind::StreamClosed.into());
        }
        loop {
            if self.cursor.has_buffered() {
                return Ok(true);
            }
            if self.cursor.is_exhausted() {
                self.mark_closed();
                return Ok(false);
            }
            match self.cursor.fetch_more().await {
                Ok(()) => continue,
                Err(e) => self.handle_error(e).await?,
            }
        }
    }

    /// Block until the next event arrives. The stream terminating before one
    /// does is a closed-stream error.
    pub(crate) async fn next(&mut self) -> Result<RawDocumentBuf> {
        loop {
            match self.try_next().await? {
                Some(doc) => return Ok(doc),
                None if self.is_closed() => return Err(ErrorKind::StreamClosed.into()),
                None => continue,
            }
        }
    }

    pub(crate) async fn close(&mut self) {
        self.mark_closed();
        // Nothing may be delivered after close, including recovered outcomes.
        self.pending = None;
        self.cursor.kill().await;
    }

    /// Classify a cursor failure and either recover or close the stream.
    /// Returning `Ok(())` means a new cursor is installed and the caller
    /// should retry.
    async fn handle_error(&mut self, mut error: Error) -> Result<()> {
        error.set_wire_version_if_absent(self.deployment.wire_version());
        if matches!(*error.kind, ErrorKind::MissingResumeToken) {
            self.mark_closed();
            return Err(error);
        }
        if !error.is_resumable() || self.resume_attempted {
            self.mark_closed();
            return Err(error);
        }
        self.resume_attempted = true;
        warn!(
            target: "watchstream::resume",
            error = %error,
            "resumable error on change stream cursor; reopening",
        );
        self.cursor.kill().await;
        match self.resume().await {
            Ok(()) => {
                // A successful resume re-arms the single-attempt guard.
                self.resume_attempted = false;
                Ok(())
            }
            Err(resume_error) => {
                self.mark_closed();
                Err(resume_error.with_source(error))
            }
        }
    }

    async fn resume(&mut self) -> Result<()> {
        crate::topology::wait_for_connected(self.deployment.as_ref()).await?;
        self.cursor = execute_watch(&self.deployment, &self.args, &self.resume, &self.monitor).await?;
        debug!(
            target: "watchstream::resume",
            cursor_id = self.cursor.id(),
            "change stream resumed",
        );
        Ok(())
    }
}

/// Open a server cursor for the given watch, projecting the current resume
/// state into the `$changeStream` stage.
pub(crate) async fn execute_watch(
    deployment: &Arc<dyn Deployment>,
    args: &WatchArgs,
    resume: &Arc<Mutex<ResumeState>>,
    monitor: &Option<EventHandler<StreamEvent>>,
) -> Result<ChangeStreamCursor> {
    let stage_options = {
        let state = resume.lock().unwrap();
        state.stage_options(args.options.as_ref(), deployment.wire_version())
    };
    let mut pipeline = Vec::with_capacity(args.pipeline.len() + 1);
    pipeline.push(build_stage(&stage_options)?);
    pipeline.extend(args.pipeline.iter().cloned());
    let command = AggregateCommand {
        target: args.target.clone(),
        pipeline,
        options: stage_options.aggregate_options(),
    };
    let response = deployment.run_aggregate(command).await.map_err(|mut e| {
        e.set_wire_version_if_absent(deployment.wire_version());
        e
    })?;
    Ok(ChangeStreamCursor::new(
        deployment.clone(),
        response,
        Some(&stage_options),
        resume.clone(),
        monitor.clone(),
    ))
}
