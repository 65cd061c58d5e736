//! The per-stream resume record and its projection into a `$changeStream` stage.

use bson::{doc, Document, Timestamp};

use crate::{
    change_stream::{event::ResumeToken, options::ChangeStreamOptions},
    error::Result,
};

/// Servers advertising this wire version or newer accept `startAtOperationTime`.
pub(crate) const OPERATION_TIME_WIRE_VERSION: i32 = 7;

/// Dynamic change stream state needed to reopen the cursor without losing or
/// duplicating events. Owned by the stream, updated by the cursor as batches
/// are processed.
#[derive(Debug, Default)]
pub(crate) struct ResumeState {
    /// The cached resume token, advanced as events are surfaced and empty
    /// batches are processed. Never replaced with an older value; the server
    /// order of batches is the ordering authority.
    pub(crate) resume_token: Option<ResumeToken>,

    /// The `operationTime` captured from the initial `aggregate` response when
    /// the user supplied no anchor and the server supports it.
    pub(crate) initial_operation_time: Option<Timestamp>,

    /// Whether any event has been surfaced to the consumer. Governs the choice
    /// between `startAfter` and `resumeAfter` during resumption.
    pub(crate) has_received: bool,
}

impl ResumeState {
    /// Project this state onto the user's original options, producing the
    /// options for the `$changeStream` stage of a cursor open or reopen.
    ///
    /// At most one anchor survives: the cached token (rendered as `startAfter`
    /// only when the user supplied `startAfter` and nothing has been surfaced
    /// yet, otherwise as `resumeAfter`), else the effective operation time when
    /// the server accepts it, else nothing.
    pub(crate) fn stage_options(
        &self,
        user_options: Option<&ChangeStreamOptions>,
        wire_version: Option<i32>,
    ) -> ChangeStreamOptions {
        let mut options = user_options.cloned().unwrap_or_default();
        match &self.resume_token {
            Some(token) => {
                if !self.has_received && options.start_after.is_some() {
                    options.start_after = Some(token.clone());
                    options.resume_after = None;
                } else {
                    options.resume_after = Some(token.clone());
                    options.start_after = None;
                }
                options.start_at_operation_time = None;
            }
            None => {
                let operation_time = options
                    .start_at_operation_time
                    .or(self.initial_operation_time);
                // An unknown wire version only occurs before any server has
                // been contacted; a user-supplied anchor is passed through and
                // left for the server to validate.
                options.start_at_operation_time = match wire_version {
                    Some(v) if v < OPERATION_TIME_WIRE_VERSION => None,
                    _ => operation_time,
                };
            }
        }
        options
    }
}

/// Render the `$changeStream` stage from projected options.
pub(crate) fn build_stage(options: &ChangeStreamOptions) -> Result<Document> {
    let body = bson::to_document(options)?;
    Ok(doc! { "$changeStream": body })
}
