//! A process-based discrete-event simulation engine.
//!
//! Simproc models a system as static elements (locations, queues,
//! resources, pools, sources, sinks) traversed by transient entities whose
//! lifetime behavior is an imperative *process*: an `async` body that
//! blocks on simulated (not wall-clock) time and on resource availability.
//! The engine drives simulated time forward one event at a time, switching
//! between suspended processes, and emits per-element time-series and
//! point-value datasets to an injected data sink, ready for batch-means or
//! independent-replication analysis.
//!
//! # A practical overview
//!
//! Building and running a model involves three activities:
//!
//! 1. definition of the static model on a [`SimInit`](simulation::SimInit)
//!    builder: locations and queues, resources and their classes, pools,
//!    sources with entity generators, downtime agents;
//! 2. authoring of process bodies: `async` closures over a
//!    [`ProcessContext`](process::ProcessContext) that move entities, wait,
//!    and acquire and release resources;
//! 3. execution via [`Simulation`](simulation::Simulation), either ad hoc
//!    with [`run_until`](simulation::Simulation::run_until) or as a full
//!    replication (warmup plus batches) with
//!    [`run_single`](simulation::Simulation::run_single).
//!
//! ## Processes
//!
//! A process body suspends at exactly four kinds of operation:
//! [`wait_for`](process::ProcessContext::wait_for),
//! [`acquire`](process::ProcessContext::acquire) /
//! [`acquire_from`](process::ProcessContext::acquire_from), and
//! capacity-limited [`increment`](process::ProcessContext::increment).
//! Nothing else yields: moves, releases, dataset writes and sampling all
//! complete within the current event. Because bodies are ordinary `async`
//! code, acquisition can live inside helper functions that the body simply
//! awaits.
//!
//! ```
//! use simproc::process::ProcessContext;
//! use simproc::resource::ResourceId;
//! use simproc::simulation::SimError;
//! use simproc::time::SimTime;
//!
//! async fn serve(ctx: &ProcessContext, server: ResourceId) -> Result<(), SimError> {
//!     let assignment = ctx.acquire(server, 1).await?;
//!     ctx.wait_for(SimTime::minutes(5.0)).await?;
//!     drop(assignment);
//!     Ok(())
//! }
//! ```
//!
//! ## Resources and assignment
//!
//! Resource requests are queued at an assignment agent and served in
//! priority order during deferred processing rounds, so that all requests,
//! releases and downtime transitions of one simulated instant are visible
//! before any unit is promised. A stand-alone resource applies hard
//! priority: nothing is assigned past the first request that cannot be
//! filled. A [pool](resource::pool) keeps going where that is safe, and
//! its algorithm is replaceable via
//! [`AssignmentPolicy`](resource::pool::AssignmentPolicy).
//!
//! ## Determinism
//!
//! A run is single-threaded and cooperative: event dispatch order is a pure
//! function of the model, the configuration and the replication index.
//! Random numbers come from PCG-64 DXSM streams derived from a fixed base
//! seed by jumped advancement, so two runs of the same replication produce
//! byte-identical dataset emission. Parallelism exists only *across*
//! replications, each a separate process calling
//! [`run_single`](simulation::Simulation::run_single) with its own run
//! index.

#![warn(missing_docs, missing_debug_implementations, unreachable_pub)]

pub mod agent;
pub mod config;
pub mod data;
pub mod downtime;
pub mod element;
pub mod executor;
pub mod process;
pub mod random;
pub mod resource;
pub mod simulation;
pub mod time;
