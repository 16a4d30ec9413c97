//! `promptload` — a load-testing engine for LLM HTTP endpoints and generic
//! HTTP APIs. See `descriptor::TaskDescriptor` for the task surface and
//! `task_runtime::start` for the entry point that wires everything together.

pub mod aggregator;
pub mod client;
pub mod config;
pub mod connection_pool;
pub mod descriptor;
pub mod errors;
pub mod field_extractor;
pub mod measurement;
pub mod memory_guard;
pub mod metrics;
pub mod payload_shaper;
pub mod percentiles;
pub mod requester;
pub mod sampler;
pub mod scheduler;
pub mod stream_parser;
pub mod task_runtime;
pub mod utils;
pub mod virtual_user;
