//! A resumable change stream core for document database clients.
//!
//! This crate implements the client side of change streams: a long-lived,
//! ordered stream of mutation notifications (inserts, updates, replaces,
//! deletes, drops, renames, database drops, invalidations) scoped to a single
//! collection, a database, or the whole cluster. The stream rides on an
//! aggregation cursor whose first pipeline stage is a synthetic
//! `$changeStream` stage, and transparently survives transient failures: it
//! tracks the server's resume tokens, waits for the topology to recover, and
//! reopens the cursor positioned so that no event is lost or duplicated.
//!
//! The wire protocol, server selection, and connection management are not part
//! of this crate; they sit behind the [`Deployment`](deployment::Deployment)
//! trait.
//!
//! ```no_run
//! use watchstream::{error::Result, Client};
//!
//! # async fn func(client: Client) -> Result<()> {
//! let mut change_stream = client.database("app").collection("orders").watch().await?;
//! while change_stream.has_next().await? {
//!     let event = change_stream.next().await?;
//!     println!("{:?}: {:?}", event.operation_type, event.full_document);
//! }
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]

pub use bson;

pub mod change_stream;
pub mod client;
pub(crate) mod cursor;
pub mod deployment;
pub mod error;
pub mod event;
pub(crate) mod topology;

pub use crate::{
    change_stream::ChangeStream,
    client::{Client, Collection, Database, Watch},
    deployment::{Deployment, Namespace},
    error::{Error, ErrorKind, Result},
};
