//! Stage orchestration engine for asynchronous document batch pipelines.
//!
//! Batches and transactions move through a fixed stage graph. Each stage is
//! executed by an external worker reached through a [`gateway::StageGateway`];
//! the worker's answer comes back as a [`gateway::CompletionEvent`] that the
//! [`dispatcher::StageDispatcher`] applies against the durable
//! [`store::EntityStore`]. Delivery is at-least-once and unordered, so every
//! step is guarded by a compare-and-set on durable status.

pub mod audit;
pub mod barrier;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod logging;
pub mod model;
pub mod retry;
pub mod simulation;
pub mod state_machine;
pub mod store;
pub mod topic;
