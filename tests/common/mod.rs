//! A scripted in-process deployment for driving change streams in tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
    },
};

use futures::future::BoxFuture;
use watchstream::{
    bson::{doc, Bson, Document, RawDocumentBuf, Timestamp},
    deployment::{
        AggregateCommand,
        AggregateResponse,
        CursorBatch,
        Deployment,
        GetMoreRequest,
        Namespace,
    },
    error::{CommandError, Error, ErrorKind, Result, RESUMABLE_CHANGE_STREAM_ERROR},
};

/// One scripted reply to a server round trip.
#[derive(Debug)]
pub enum Reply {
    Aggregate(AggregateResponse),
    Batch(CursorBatch),
    Error(Error),
}

/// A request the change stream issued against the deployment.
#[derive(Debug, Clone)]
pub enum Command {
    Aggregate(AggregateCommand),
    GetMore(GetMoreRequest),
    KillCursor { ns: Namespace, cursor_id: i64 },
}

/// A deployment that replays a script of replies and records every request.
#[derive(Debug)]
pub struct ScriptedDeployment {
    replies: Mutex<VecDeque<Reply>>,
    commands: Mutex<Vec<Command>>,
    connected: AtomicBool,
    wire_version: Mutex<Option<i32>>,
}

impl ScriptedDeployment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            commands: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            wire_version: Mutex::new(Some(17)),
        })
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn push_error(&self, error: Error) {
        self.push(Reply::Error(error));
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_wire_version(&self, version: Option<i32>) {
        *self.wire_version.lock().unwrap() = version;
    }

    pub fn aggregates(&self) -> Vec<AggregateCommand> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Command::Aggregate(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn get_mores(&self) -> Vec<GetMoreRequest> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Command::GetMore(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn killed_cursors(&self) -> Vec<i64> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Command::KillCursor { cursor_id, .. } => Some(*cursor_id),
                _ => None,
            })
            .collect()
    }
}

impl Deployment for ScriptedDeployment {
    fn run_aggregate(&self, command: AggregateCommand) -> BoxFuture<'_, Result<AggregateResponse>> {
        self.commands
            .lock()
            .unwrap()
            .push(Command::Aggregate(command));
        let result = match self.replies.lock().unwrap().pop_front() {
            Some(Reply::Aggregate(response)) => Ok(response),
            Some(Reply::Error(error)) => Err(error),
            Some(other) => panic!("aggregate got unexpected scripted reply: {other:?}"),
            None => panic!("no scripted reply for aggregate"),
        };
        Box::pin(async move { result })
    }

    fn run_get_more(&self, request: GetMoreRequest) -> BoxFuture<'_, Result<CursorBatch>> {
        self.commands.lock().unwrap().push(Command::GetMore(request));
        let result = match self.replies.lock().unwrap().pop_front() {
            Some(Reply::Batch(batch)) => Ok(batch),
            Some(Reply::Error(error)) => Err(error),
            Some(other) => panic!("getMore got unexpected scripted reply: {other:?}"),
            // A tailable cursor with nothing to report blocks server-side.
            None => return Box::pin(std::future::pending()),
        };
        Box::pin(async move { result })
    }

    fn kill_cursor(&self, ns: &Namespace, cursor_id: i64) -> BoxFuture<'_, Result<()>> {
        self.commands.lock().unwrap().push(Command::KillCursor {
            ns: ns.clone(),
            cursor_id,
        });
        Box::pin(async { Ok(()) })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn wire_version(&self) -> Option<i32> {
        *self.wire_version.lock().unwrap()
    }
}

/// Build an aggregate response from plain documents.
pub fn aggregate_response(cursor_id: i64, ns: Namespace, batch: &[Document]) -> AggregateResponse {
    let mut response = AggregateResponse::empty(cursor_id, ns);
    response.first_batch = raw_batch(batch);
    response
}

/// Build a getMore batch from plain documents.
pub fn cursor_batch(cursor_id: i64, batch: &[Document]) -> CursorBatch {
    CursorBatch {
        cursor_id,
        batch: raw_batch(batch),
        post_batch_resume_token: None,
    }
}

fn raw_batch(batch: &[Document]) -> VecDeque<RawDocumentBuf> {
    batch
        .iter()
        .map(|doc| RawDocumentBuf::from_document(doc).unwrap())
        .collect()
}

pub fn raw_doc(doc: &Document) -> RawDocumentBuf {
    RawDocumentBuf::from_document(doc).unwrap()
}

pub fn token(seq: i32) -> Document {
    doc! { "_data": format!("82-{seq:04}") }
}

pub fn cluster_time(seq: i32) -> Timestamp {
    Timestamp {
        time: 1_700_000_000 + seq as u32,
        increment: 1,
    }
}

/// An event document with the fields every operation kind carries.
pub fn event_doc(seq: i32, operation_type: &str) -> Document {
    doc! {
        "_id": token(seq),
        "operationType": operation_type,
        "clusterTime": cluster_time(seq),
    }
}

pub fn insert_event(seq: i32, db: &str, coll: &str, doc_id: i32) -> Document {
    let mut event = event_doc(seq, "insert");
    event.insert("ns", doc! { "db": db, "coll": coll });
    event.insert("documentKey", doc! { "_id": doc_id });
    event.insert("fullDocument", doc! { "_id": doc_id });
    event
}

pub fn drop_event(seq: i32, db: &str, coll: &str) -> Document {
    let mut event = event_doc(seq, "drop");
    event.insert("ns", doc! { "db": db, "coll": coll });
    event
}

pub fn drop_database_event(seq: i32, db: &str) -> Document {
    let mut event = event_doc(seq, "dropDatabase");
    event.insert("ns", doc! { "db": db });
    event
}

pub fn rename_event(seq: i32, db: &str, from: &str, to: &str) -> Document {
    let mut event = event_doc(seq, "rename");
    event.insert("ns", doc! { "db": db, "coll": from });
    event.insert("to", doc! { "db": db, "coll": to });
    event
}

pub fn invalidate_event(seq: i32) -> Document {
    event_doc(seq, "invalidate")
}

/// A server error carrying the resumable change stream label, as 4.4+ servers
/// report transient failures.
pub fn resumable_error() -> Error {
    Error::new(
        ErrorKind::Command(CommandError::new(6, "HostUnreachable", "host unreachable")),
        Some([RESUMABLE_CHANGE_STREAM_ERROR.to_string()]),
    )
}

/// A connection-level failure, resumable regardless of server version.
pub fn network_error() -> Error {
    Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
}

/// A server error no change stream may resume from.
pub fn fatal_error() -> Error {
    Error::new(
        ErrorKind::Command(CommandError::new(26, "NamespaceNotFound", "ns not found")),
        None::<Vec<String>>,
    )
}

/// The `$changeStream` stage document of a recorded aggregate.
pub fn stage_body(command: &AggregateCommand) -> Document {
    command.pipeline[0]
        .get_document("$changeStream")
        .expect("first pipeline stage must be $changeStream")
        .clone()
}

pub fn stage_resume_after(command: &AggregateCommand) -> Option<Bson> {
    stage_body(command).get("resumeAfter").cloned()
}

pub fn stage_start_after(command: &AggregateCommand) -> Option<Bson> {
    stage_body(command).get("startAfter").cloned()
}
