//! Berth Scheduler - Pod to Node placement
//!
//! This crate provides:
//! - The scheduling control loop with detached, cancellable binding
//! - A node cache with assumed pods and expiry
//! - The extension-point pipeline and built-in plugins
//! - Named profiles, HTTP extenders and the legacy policy loader
//! - Event recording and minimal pod status patches

pub mod algorithm;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event_handlers;
pub mod extender;
pub mod framework;
pub mod plugins;
pub mod policy;
pub mod profile;
pub mod queue;
pub mod recorder;
pub mod scheduler;
pub mod status;
pub mod types;

#[cfg(test)]
pub(crate) mod test_util;

// Re-export commonly used types
pub use algorithm::{GenericScheduler, ScheduleAlgorithm};
pub use cache::{CacheStats, NodeInfo, SchedulerCache, Snapshot};
pub use client::{ClusterClient, InMemoryCluster};
pub use config::{ProfileConfig, SchedulerConfiguration};
pub use error::{Result, SchedulerError};
pub use event_handlers::EventHandlers;
pub use extender::{Extender, HttpExtender};
pub use framework::{Framework, FrameworkHandle, Registry, Status};
pub use policy::Policy;
pub use profile::{Profile, ProfileMap};
pub use queue::SchedulingQueue;
pub use recorder::{BroadcastEventSink, EventRecorder, EventSink};
pub use scheduler::{FailureHandler, RequeueOnFailure, Scheduler, SchedulerBuilder};
pub use types::{FitError, QueuedPodInfo, ScheduleResult};
