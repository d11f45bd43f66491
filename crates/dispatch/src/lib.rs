//! Event ingestion and dispatch pipeline.
//!
//! Turns committed changes in the durable change log into at-least-once
//! notifications delivered to per-target-system worker pools, via two
//! cooperating producers:
//!
//! - the **live collector** tails the change log's push notifications for
//!   low latency ([`collector::LiveCollector`]);
//! - the **backfill collector** periodically sweeps for events that were
//!   never delivered, failed and became eligible for retry, or were taken by
//!   a run that never finished ([`collector::BackfillCollector`]).
//!
//! Both push [`campusidm_events::Envelope`]s onto a shared [`queue::EventQueue`];
//! a [`worker::WorkerPool`] consumes them and reports outcomes back to the
//! change log. Every loop polls a shared [`runstate::RunState`] at each
//! bounded wait, so one graceful-stop signal drains the whole pipeline; the
//! [`supervisor::Supervisor`] wires it all together.

pub mod changelog;
pub mod collector;
pub mod config;
pub mod handler;
pub mod notify;
pub mod queue;
pub mod runstate;
pub mod supervisor;
pub mod worker;
