#![forbid(unsafe_code)]

//! # Renderflow
//!
//! Declarative video-composition orchestration: accept a canvas plus
//! positioned media elements, classify the job, allocate resources, and run
//! it through a resilient workflow (inline for quick jobs, queued for the
//! rest) while streaming status in real time.
//!
//! ## Architecture
//!
//! - **Admission** validates requests and derives a [`model::JobAnalysis`]
//!   (complexity, strategy, resource requirements, duration estimate).
//! - **Orchestration** ([`orchestrator::Orchestrator`]) allocates from the
//!   [`resource::ResourceManager`], materializes a workflow from the
//!   [`workflow::WorkflowEngine`] catalog, consults the
//!   [`balancer::LoadBalancer`], and routes sync or async.
//! - **Execution** runs steps through a dispatch table with per-step
//!   timeouts, retries, and rollback strategies; queued jobs drain through
//!   the bounded [`queue::JobQueue`] worker pool with cooperative
//!   cancellation.
//! - **Resilience** ([`resilience::ResilienceManager`]) wraps every external
//!   call in named circuit breakers, bulkheads, retries, and timeouts.
//! - **Observability** flows through the [`event_bus::EventBus`] and the
//!   [`job_store::JobStore`] broadcast, which the HTTP layer fans out over
//!   SSE.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use renderflow::config::Config;
//! use renderflow::orchestrator::{Collaborators, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let orchestrator = Orchestrator::new(Config::default(), Collaborators::simulated());
//!     orchestrator.start();
//!     let app = renderflow::api::router(orchestrator);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod analyzer;
pub mod api;
pub mod backoff;
pub mod balancer;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod health;
pub mod job_store;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod resilience;
pub mod resource;
pub mod retry;
pub mod services;
pub mod timeout;
pub mod workflow;

pub use error::{Error, ErrorKind};
