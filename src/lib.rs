//! Sampling profiler for running multi-threaded Linux processes.
//!
//! Attaches to every thread of a target process by pid, periodically stops
//! each thread, walks its user-space stack from outside the address space
//! and aggregates the observed frames over a sliding window into a
//! hottest-functions table.

#[macro_use]
extern crate lazy_static;

pub mod errors;
pub mod frame;
pub mod heartbeat;
pub mod proc;
pub mod profiler;
pub mod screen;
pub mod signals;
pub mod sink;
pub mod statistic;
pub mod symbols;
pub mod thread_tracer;
pub mod unwinder;
