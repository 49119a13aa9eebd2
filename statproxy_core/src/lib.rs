//! The aggregation core of stat-proxy.
//!
//! Applications report counters, gauges and distinct-value events to
//! stat-proxy over a one-way text protocol, see [`protocol`]. Every decoded
//! event lands in the [`registry::Registry`], which keeps one
//! [`accumulator::Accumulator`] per reporting source. A flush cycle that lives
//! outside this crate periodically drains the registry and ships the result
//! downstream.
//!
//! Nothing in this crate performs I/O or suspends. Every operation is a short,
//! lock-held unit of work so the caller decides where threads and tasks live.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![allow(clippy::multiple_crate_versions)]

pub mod accumulator;
pub mod metric;
mod pattern;
pub mod protocol;
pub mod registry;
pub mod sketch;

pub use accumulator::{Accumulator, Limits, Remains, Retired};
pub use metric::{Kind, SketchSet};
pub use protocol::{Event, Op, Opcode};
pub use registry::{Drained, Registry, Snapshot};
pub use sketch::Sketch;
