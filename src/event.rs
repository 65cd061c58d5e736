//! Contains the types used to observe change stream activity.

use std::sync::Arc;

use futures_core::future::BoxFuture;

use crate::{change_stream::event::ResumeToken, deployment::Namespace, error::Error};

/// A destination for events. Allows implicit conversion via [`From`] for concrete
/// types for convenience:
///
/// ```rust
/// # use watchstream::event::{EventHandler, StreamEvent};
/// # fn example() {
/// let (tx, mut rx) = tokio::sync::mpsc::channel::<StreamEvent>(100);
/// tokio::spawn(async move {
///     while let Some(ev) = rx.recv().await {
///         println!("{:?}", ev);
///     }
/// });
/// let handler = EventHandler::from(tx);
/// # }
/// ```
///
/// or explicit construction for `Fn` traits:
///
/// ```rust
/// # use watchstream::event::{EventHandler, StreamEvent};
/// # fn example() {
/// let handler = EventHandler::<StreamEvent>::callback(|ev| println!("{:?}", ev));
/// # }
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub enum EventHandler<T> {
    /// A callback.
    Callback(Arc<dyn Fn(T) + Sync + Send>),
    /// An async callback.
    AsyncCallback(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Sync + Send>),
    /// A `tokio` channel sender.
    TokioMpsc(tokio::sync::mpsc::Sender<T>),
}

impl<T> std::fmt::Debug for EventHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventHandler").finish()
    }
}

impl<T> From<tokio::sync::mpsc::Sender<T>> for EventHandler<T> {
    fn from(value: tokio::sync::mpsc::Sender<T>) -> Self {
        Self::TokioMpsc(value)
    }
}

impl<T: Send + Sync + 'static> EventHandler<T> {
    /// Construct a new event handler with a callback.
    pub fn callback(f: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    /// Construct a new event handler with an async callback.
    pub fn async_callback(f: impl Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Self {
        Self::AsyncCallback(Arc::new(f))
    }

    pub(crate) fn handle(&self, event: T) {
        match self {
            Self::Callback(cb) => (cb)(event),
            Self::AsyncCallback(cb) => {
                tokio::spawn((cb)(event));
            }
            Self::TokioMpsc(sender) => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send(event).await;
                });
            }
        }
    }
}

/// Instrumentation events describing the life of a change stream's server cursor.
///
/// Register a handler with
/// [`Watch::monitor`](crate::client::Watch::monitor) to receive them.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum StreamEvent {
    /// The opening aggregate established a server cursor.
    #[non_exhaustive]
    Init {
        /// The server cursor id.
        cursor_id: i64,
        /// The namespace the cursor iterates.
        ns: Namespace,
    },

    /// A `getMore` was dispatched to the server.
    #[non_exhaustive]
    More {
        /// The server cursor id.
        cursor_id: i64,
    },

    /// A server batch response was processed.
    #[non_exhaustive]
    Response {
        /// The server cursor id.
        cursor_id: i64,
        /// The number of documents in the batch.
        batch_len: usize,
        /// Whether the response carried a post-batch resume token.
        has_post_batch_resume_token: bool,
    },

    /// The stream's cached resume token advanced.
    ///
    /// Emitted strictly after the token is updated and strictly before the event
    /// that produced it is surfaced to the consumer.
    #[non_exhaustive]
    ResumeTokenChanged {
        /// The new resume token.
        token: ResumeToken,
    },
}

/// A notification delivered through the push adapter attached with
/// [`ChangeStream::subscribe`](crate::change_stream::ChangeStream::subscribe).
#[derive(Debug)]
#[non_exhaustive]
pub enum StreamNotification<T> {
    /// The next change event.
    Event(T),

    /// The stream failed. A `Closed` notification follows.
    Error(Error),

    /// The stream terminated and will deliver no further notifications.
    Closed,
}
