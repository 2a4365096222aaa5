//! Upstream worker protocol
//!
//! Everything that talks to a worker lives here: the REST client for
//! submit/history/view/stats, the long-lived streaming channel that
//! reports execution progress, and the per-worker pool that lends those
//! channels out one submission at a time.

pub mod client;
pub mod pool;
pub mod stream;

pub use client::{pick_output_image, ComfyClient, ImageRef, PromptResponse};
pub use pool::{spawn_maintenance_task, PoolStatus, PooledStream, StreamPool, StreamPoolConfig, StreamPools};
pub use stream::{parse_event, StreamEvent, WorkerStream};
