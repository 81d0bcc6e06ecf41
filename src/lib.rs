//! Huntmaster real-time capture and analysis pipeline.
//!
//! - [`audio`]: frames, ring buffer, bounded queues, DSP helpers and the
//!   capture backend
//! - [`config`]: [`PipelineConfig`](config::PipelineConfig) with JSON
//!   override merging and TOML persistence
//! - [`events`]: the rate-limited [`EventBus`](events::EventBus)
//! - [`modules`]: the eleven modules composed by the orchestrator
//! - [`pipeline`]: the [`Orchestrator`](pipeline::Orchestrator), sessions,
//!   recovery and adaptation

pub mod audio;
pub mod config;
pub mod events;
pub mod modules;
pub mod pipeline;
