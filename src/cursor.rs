//! The change stream's view of an aggregation cursor.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use bson::{Bson, RawDocumentBuf};
use tracing::debug;

use crate::{
    change_stream::{
        event::ResumeToken,
        options::ChangeStreamOptions,
        resume::{ResumeState, OPERATION_TIME_WIRE_VERSION},
    },
    deployment::{AggregateResponse, CursorBatch, Deployment, GetMoreRequest, Namespace},
    error::{ErrorKind, Result},
    event::{EventHandler, StreamEvent},
};

/// Servers advertising this wire version or newer accept a `comment` on `getMore`.
const GET_MORE_COMMENT_WIRE_VERSION: i32 = 9;

/// Static information about a cursor.
#[derive(Clone, Debug)]
struct CursorInformation {
    ns: Namespace,
    id: i64,
    batch_size: Option<u32>,
    max_await_time: Option<Duration>,
    comment: Option<Bson>,
}

/// The mutable state of a cursor.
#[derive(Debug)]
struct CursorState {
    buffer: VecDeque<RawDocumentBuf>,
    exhausted: bool,
    post_batch_resume_token: Option<ResumeToken>,
}

/// A generic batch cursor specialized for change streams: every batch response
/// is intercepted to track the stream's resume position, and the initial
/// response may contribute an operation time for later resume attempts.
#[derive(Debug)]
pub(crate) struct ChangeStreamCursor {
    deployment: Arc<dyn Deployment>,
    info: CursorInformation,
    state: CursorState,
    resume: Arc<Mutex<ResumeState>>,
    monitor: Option<EventHandler<StreamEvent>>,
}

impl ChangeStreamCursor {
    /// Wrap the response to an opening aggregate. `options` are the projected
    /// stage options the aggregate was built from.
    pub(crate) fn new(
        deployment: Arc<dyn Deployment>,
        response: AggregateResponse,
        options: Option<&ChangeStreamOptions>,
        resume: Arc<Mutex<ResumeState>>,
        monitor: Option<EventHandler<StreamEvent>>,
    ) -> Self {
        let info = CursorInformation {
            ns: response.ns.clone(),
            id: response.cursor_id,
            batch_size: options.and_then(|o| o.batch_size),
            max_await_time: options.and_then(|o| o.max_await_time),
            comment: options.and_then(|o| o.comment.clone()),
        };
        let post_batch_resume_token =
            ResumeToken::from_raw(response.post_batch_resume_token.clone());
        let initial_token = ResumeToken::initial(options, &response);
        let seeded_from_batch =
            response.first_batch.is_empty() && post_batch_resume_token.is_some();

        {
            let mut state = resume.lock().unwrap();
            if let Some(token) = initial_token {
                state.resume_token = Some(token);
            }
            let anchored = options.is_some_and(|o| {
                o.resume_after.is_some()
                    || o.start_after.is_some()
                    || o.start_at_operation_time.is_some()
            });
            if !anchored
                && state.initial_operation_time.is_none()
                && deployment
                    .wire_version()
                    .is_some_and(|v| v >= OPERATION_TIME_WIRE_VERSION)
            {
                state.initial_operation_time = response.operation_time;
            }
        }

        let cursor = Self {
            deployment,
            info,
            state: CursorState {
                buffer: response.first_batch,
                exhausted: response.cursor_id == 0,
                post_batch_resume_token,
            },
            resume,
            monitor,
        };
        cursor.emit(StreamEvent::Init {
            cursor_id: cursor.info.id,
            ns: cursor.info.ns.clone(),
        });
        cursor.emit(StreamEvent::Response {
            cursor_id: cursor.info.id,
            batch_len: cursor.state.buffer.len(),
            has_post_batch_resume_token: cursor.state.post_batch_resume_token.is_some(),
        });
        if seeded_from_batch {
            if let Some(token) = cursor.state.post_batch_resume_token.clone() {
                cursor.emit(StreamEvent::ResumeTokenChanged { token });
            }
        }
        cursor
    }

    pub(crate) fn id(&self) -> i64 {
        self.info.id
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.state.exhausted
    }

    pub(crate) fn has_buffered(&self) -> bool {
        !self.state.buffer.is_empty()
    }

    /// Perform one `getMore` round trip and fold the response into the cursor.
    pub(crate) async fn fetch_more(&mut self) -> Result<()> {
        let comment = match self.deployment.wire_version() {
            Some(v) if v >= GET_MORE_COMMENT_WIRE_VERSION => self.info.comment.clone(),
            _ => None,
        };
        let request = GetMoreRequest {
            cursor_id: self.info.id,
            ns: self.info.ns.clone(),
            batch_size: self.info.batch_size,
            max_await_time: self.info.max_await_time,
            comment,
        };
        self.emit(StreamEvent::More {
            cursor_id: self.info.id,
        });
        match self.deployment.run_get_more(request).await {
            Ok(batch) => {
                self.apply_batch(batch);
                Ok(())
            }
            Err(mut error) => {
                error.set_wire_version_if_absent(self.deployment.wire_version());
                Err(error)
            }
        }
    }

    /// Advance the cursor by at most one round trip, returning the next
    /// buffered document if one is available afterwards.
    pub(crate) async fn try_advance(&mut self) -> Result<Option<RawDocumentBuf>> {
        if self.state.buffer.is_empty() && !self.state.exhausted {
            self.fetch_more().await?;
        }
        self.pop()
    }

    fn apply_batch(&mut self, batch: CursorBatch) {
        self.info.id = batch.cursor_id;
        self.state.exhausted = batch.cursor_id == 0;
        let post = ResumeToken::from_raw(batch.post_batch_resume_token);
        self.emit(StreamEvent::Response {
            cursor_id: batch.cursor_id,
            batch_len: batch.batch.len(),
            has_post_batch_resume_token: post.is_some(),
        });
        if let Some(token) = post {
            self.state.post_batch_resume_token = Some(token);
        }
        self.state.buffer = batch.batch;
        if self.state.buffer.is_empty() {
            // An empty batch still advances the stream position to the batch
            // boundary the server reported.
            if let Some(token) = self.state.post_batch_resume_token.clone() {
                self.cache_token(token, false);
            }
        }
    }

    /// Pop the next buffered document, advancing the cached resume token to its
    /// `_id` first. The batch boundary token only takes over on empty batches.
    pub(crate) fn pop(&mut self) -> Result<Option<RawDocumentBuf>> {
        let doc = match self.state.buffer.pop_front() {
            Some(doc) => doc,
            None => return Ok(None),
        };
        let token = match doc.get("_id")? {
            Some(id) => ResumeToken(id.to_raw_bson()),
            None => return Err(ErrorKind::MissingResumeToken.into()),
        };
        self.cache_token(token, true);
        Ok(Some(doc))
    }

    fn cache_token(&self, token: ResumeToken, surfacing: bool) {
        {
            let mut state = self.resume.lock().unwrap();
            state.resume_token = Some(token.clone());
            if surfacing {
                state.has_received = true;
            }
        }
        self.emit(StreamEvent::ResumeTokenChanged { token });
    }

    /// Best-effort release of the server cursor; errors are ignored.
    pub(crate) async fn kill(&mut self) {
        if self.state.exhausted {
            return;
        }
        if let Err(error) = self
            .deployment
            .kill_cursor(&self.info.ns, self.info.id)
            .await
        {
            debug!(
                target: "watchstream::cursor",
                cursor_id = self.info.id,
                error = %error,
                "ignoring killCursors failure",
            );
        }
        self.state.exhausted = true;
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(monitor) = &self.monitor {
            monitor.handle(event);
        }
    }
}
