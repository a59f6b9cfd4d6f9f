//! Distributed I/O switch for the skein storage system
//!
//! A data transfer is described once, as a [`FromTo`] between sources and
//! targets, and compiled into one plan per participating node. Each plan
//! runs inside a [`Switch`] that wires operations together through
//! single-assignment variables; streams cross node boundaries through
//! paired send/receive operations.
//!
//! # Key Components
//!
//! - **Switch**: per-node runtime of one plan instance
//! - **Manager**: registry of running switches with blocking lookup
//! - **PlanBuilder / Parser**: compile transfer requests into node plans
//! - **Executor**: driver side; dispatches node plans and joins them
//! - **Operations**: transfers, blob store access, split/join, erasure coding
//! - **Transport**: in-process cluster and a framed TCP protocol
//! - **Commands**: upload, download and repair of stored objects

pub mod agent;
pub mod blob;
pub mod builder;
pub mod commands;
pub mod context;
pub mod directory;
pub mod error;
pub mod executor;
pub mod lock;
pub mod manager;
pub mod ops;
pub mod parser;
pub mod plan;
pub mod stream;
pub mod switch;
pub mod transport;
pub mod var;

pub use agent::AgentService;
pub use blob::{BlobStore, LocalBlobStore, MemoryBlobStore};
pub use builder::{CompiledPlan, PlanBuilder, ReadHandle, SignalHandle, WriteHandle};
pub use commands::{
    BlockInfo, CommandContext, DownloadObject, ObjectReader, RepairBlocks, UploadObject,
};
pub use context::{EngineConfig, NodeContext};
pub use directory::{NodeDirectory, NodeInfo, StaticDirectory};
pub use error::{Result, SwitchError, WireError};
pub use executor::Executor;
pub use lock::{Lock, LockRequestBuilder, LockRequestId, LockService, MemoryLockService};
pub use manager::Manager;
pub use ops::Op;
pub use parser::{FromTo, ParsedPlan, Parser, Redundancy, Source, Target};
pub use plan::{Location, NodeId, Plan, PlanId};
pub use stream::ByteStream;
pub use switch::{Results, Switch};
pub use transport::{
    AgentClient, AgentConnector, LocalCluster, TcpAgentConnector, TcpAgentServer,
};
pub use var::{Payload, Value, VarId, VarKind};
