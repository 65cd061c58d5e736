//! The push adapter driving a change stream from a background task.

use derive_where::derive_where;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{
    change_stream::StreamInner,
    error::{Error, ErrorKind, Result},
    event::{EventHandler, StreamNotification},
};

pub(crate) enum Control<T> {
    Attach(EventHandler<StreamNotification<T>>),
    Detach,
    Shutdown(oneshot::Sender<()>),
}

/// Control handle to the bridge task. Dropping it closes the control channel,
/// which the task treats as a shutdown request.
#[derive_where(Debug)]
pub(crate) struct EmitterHandle<T> {
    tx: mpsc::UnboundedSender<Control<T>>,
}

impl<T> EmitterHandle<T> {
    pub(crate) fn attach(&self, handler: EventHandler<StreamNotification<T>>) -> Result<()> {
        self.tx
            .send(Control::Attach(handler))
            .map_err(|_| Error::from(ErrorKind::StreamClosed))
    }

    pub(crate) fn detach(&self) -> Result<()> {
        self.tx
            .send(Control::Detach)
            .map_err(|_| Error::from(ErrorKind::StreamClosed))
    }

    pub(crate) async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Control::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Hand the stream state to a background task that pulls events and fans them
/// out to the attached handler.
pub(crate) fn spawn<T>(
    inner: StreamInner,
    handler: EventHandler<StreamNotification<T>>,
) -> EmitterHandle<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(inner, rx, Some(handler)));
    EmitterHandle { tx }
}

async fn run<T>(
    mut inner: StreamInner,
    mut control: mpsc::UnboundedReceiver<Control<T>>,
    mut handler: Option<EventHandler<StreamNotification<T>>>,
) where
    T: DeserializeOwned + Send + Sync + 'static,
{
    loop {
        let active = match &handler {
            Some(handler) => handler.clone(),
            // Dormant: no handler attached. Keep the cursor alive and wait
            // for control traffic only.
            None => match control.recv().await {
                Some(Control::Attach(new_handler)) => {
                    handler = Some(new_handler);
                    continue;
                }
                Some(Control::Detach) => continue,
                Some(Control::Shutdown(ack)) => {
                    inner.close().await;
                    let _ = ack.send(());
                    return;
                }
                None => {
                    inner.close().await;
                    return;
                }
            },
        };
        tokio::select! {
            // Close is authoritative; service control traffic first.
            biased;
            message = control.recv() => match message {
                Some(Control::Attach(new_handler)) => handler = Some(new_handler),
                Some(Control::Detach) => {
                    debug!(
                        target: "watchstream::stream",
                        "push handler detached; change stream idling",
                    );
                    handler = None;
                }
                Some(Control::Shutdown(ack)) => {
                    inner.close().await;
                    active.handle(StreamNotification::Closed);
                    let _ = ack.send(());
                    return;
                }
                None => {
                    inner.close().await;
                    active.handle(StreamNotification::Closed);
                    return;
                }
            },
            result = inner.try_next() => match result {
                Ok(Some(doc)) => match bson::from_slice::<T>(doc.as_bytes()) {
                    Ok(event) => active.handle(StreamNotification::Event(event)),
                    // A malformed event is surfaced without terminating the
                    // stream, mirroring iterator mode.
                    Err(e) => active.handle(StreamNotification::Error(e.into())),
                },
                // An empty batch; poll again.
                Ok(None) if !inner.is_closed() => {}
                Ok(None) => {
                    active.handle(StreamNotification::Closed);
                    return;
                }
                Err(error) => {
                    active.handle(StreamNotification::Error(error));
                    active.handle(StreamNotification::Closed);
                    return;
                }
            },
        }
    }
}
