//! # shipwright
//!
//! Build orchestration core for an AI app builder.
//!
//! Provides durable work queues with retries and backoff (in-memory or
//! Postgres + pgmq), a tool-calling iteration agent that turns a
//! conversation into a validated, versioned change set, a deploy worker
//! driving an external provider, live per-project progress fan-out and
//! OpenTelemetry observability.

pub mod agent;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod model;
pub mod progress;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod tools;
pub mod validator;
pub mod worker;
