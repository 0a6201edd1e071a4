//! Service module: the worker pools that make up the pipeline
//!
//! Flow between services:
//! `generator -> [cache reader] -> task queue -> network -> dispatcher -> parser -> dispatcher`
//!
//! Every hand-off goes through a kanal channel or the task queue. Workers
//! poll their input with `try_recv` and sleep one poll interval when it is
//! empty, so a stop or pause request is seen within that interval.

mod cache;
mod dispatcher;
mod generator;
mod network;
mod parser;
pub mod worker;

pub use cache::{CacheReaderService, CacheWriterService};
pub use dispatcher::DispatcherService;
pub use generator::{TaskGeneratorService, TaskProducer};
pub use network::NetworkService;
pub use parser::ParseService;
pub use worker::{ServiceWorker, Step, UnitFactory, WorkerPool, WorkerState, WorkerUnit};

use crate::crawler::HandlerError;
use crate::task::{Data, Task};
use crate::transport::{NetworkResult, Response};
use async_trait::async_trait;
use kanal::{AsyncReceiver, AsyncSender};
use std::fmt;
use thiserror::Error;

/// What kind of failure reached the fatal channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// A worker step returned an error
    WorkerError,
    /// A worker step panicked
    Panic,
    /// A handler raised an error flagged fatal
    Handler,
    /// Programming error, e.g. an unknown result reaching the dispatcher
    Misuse,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WorkerError => "worker-error",
            Self::Panic => "panic",
            Self::Handler => "handler",
            Self::Misuse => "misuse",
        };
        f.write_str(name)
    }
}

/// An error that must terminate the run
#[derive(Debug, Clone, Error)]
#[error("{kind} in {context}: {error}")]
pub struct FatalError {
    pub kind: FatalKind,
    pub error: String,
    /// Worker or handler the error came from
    pub context: String,
}

impl FatalError {
    pub fn new(kind: FatalKind, error: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            kind,
            error: error.into(),
            context: context.into(),
        }
    }
}

/// Where a dispatch originated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Network,
    Cache,
    Parser,
}

/// Extra routing information attached to a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchMeta {
    pub from: Origin,
}

/// Everything the dispatcher can receive
#[derive(Debug)]
pub enum DispatchItem {
    /// A follow-up task to schedule
    Task(Task),
    /// Terminal handler output
    Data(Data),
    /// A fetch or cache-lookup result for the dispatch's task
    Network(Box<NetworkResult>),
    /// A handler or pipeline error
    Error(HandlerError),
    /// The task exceeded its limits before being fetched
    Rejected { reason: &'static str },
    /// The handler for the dispatch's task ran to completion
    Completed,
    Nothing,
}

/// One `(item, task, meta)` triple for the dispatcher
#[derive(Debug)]
pub struct Dispatch {
    pub item: DispatchItem,
    /// The task the item belongs to
    pub task: Option<Task>,
    pub meta: Option<DispatchMeta>,
}

impl Dispatch {
    /// A network result: always carries its task, never meta
    pub fn network(result: NetworkResult, task: Task) -> Self {
        Self {
            item: DispatchItem::Network(Box::new(result)),
            task: Some(task),
            meta: None,
        }
    }

    pub fn cached(result: NetworkResult, task: Task) -> Self {
        Self {
            item: DispatchItem::Network(Box::new(result)),
            task: Some(task),
            meta: Some(DispatchMeta {
                from: Origin::Cache,
            }),
        }
    }

    /// A task turned away by its try limits before being fetched or served
    pub fn rejected(task: Task, reason: &'static str, from: Origin) -> Self {
        Self {
            item: DispatchItem::Rejected { reason },
            task: Some(task),
            meta: Some(DispatchMeta { from }),
        }
    }

    /// An item produced while parsing `task`
    pub fn from_parser(item: DispatchItem, task: Task) -> Self {
        Self {
            item,
            task: Some(task),
            meta: Some(DispatchMeta {
                from: Origin::Parser,
            }),
        }
    }
}

/// A fetched result waiting for its handler
#[derive(Debug)]
pub struct ParseJob {
    pub result: NetworkResult,
    pub task: Task,
}

/// The channels connecting the services
#[derive(Clone)]
pub struct Channels {
    pub dispatch_tx: AsyncSender<Dispatch>,
    pub dispatch_rx: AsyncReceiver<Dispatch>,
    pub parse_tx: AsyncSender<ParseJob>,
    pub parse_rx: AsyncReceiver<ParseJob>,
    pub cache_read_tx: AsyncSender<Task>,
    pub cache_read_rx: AsyncReceiver<Task>,
    pub cache_write_tx: AsyncSender<(Task, Response)>,
    pub cache_write_rx: AsyncReceiver<(Task, Response)>,
    pub fatal_tx: AsyncSender<FatalError>,
    pub fatal_rx: AsyncReceiver<FatalError>,
}

impl Channels {
    pub fn new() -> Self {
        let (dispatch_tx, dispatch_rx) = kanal::unbounded_async();
        let (parse_tx, parse_rx) = kanal::unbounded_async();
        let (cache_read_tx, cache_read_rx) = kanal::unbounded_async();
        let (cache_write_tx, cache_write_rx) = kanal::unbounded_async();
        let (fatal_tx, fatal_rx) = kanal::unbounded_async();
        Self {
            dispatch_tx,
            dispatch_rx,
            parse_tx,
            parse_rx,
            cache_read_tx,
            cache_read_rx,
            cache_write_tx,
            cache_write_rx,
            fatal_tx,
            fatal_rx,
        }
    }

    /// Items sitting in any inter-service channel
    pub fn pending(&self) -> usize {
        self.dispatch_rx.len() + self.parse_rx.len() + self.cache_read_rx.len() + self.cache_write_rx.len()
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate control over a service's workers
#[async_trait]
pub trait Service: Send + Sync {
    fn pool(&self) -> &WorkerPool;

    fn name(&self) -> &str {
        self.pool().name()
    }

    fn start(&self) {
        self.pool().start();
    }

    fn stop(&self) {
        self.pool().stop();
    }

    /// Returns once every worker is paused or dead
    async fn pause(&self) {
        self.pool().pause().await;
    }

    fn resume(&self) {
        self.pool().resume();
    }

    fn is_busy(&self) -> bool {
        self.pool().is_busy()
    }

    fn is_alive(&self) -> bool {
        self.pool().is_alive()
    }

    async fn join(&self) {
        self.pool().join().await;
    }
}
