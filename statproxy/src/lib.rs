//! The stat-proxy metrics collection node.
//!
//! This library supports the `statproxy` binary found elsewhere in this
//! project. Applications fire metric events at the [`listener`] over UDP, the
//! events aggregate in a [`statproxy_core::Registry`] and the [`proxy`]
//! periodically drains the registry to a downstream HTTP sink. Every
//! long-running part is a worker restarted by the [`supervisor`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod emitter;
pub mod listener;
pub mod proxy;
pub mod state;
pub mod supervisor;

#[derive(thiserror::Error, Debug)]
/// Errors a supervised worker fails with.
pub enum Error {
    /// See [`crate::listener::Error`] for details.
    #[error(transparent)]
    Listener(#[from] listener::Error),
    /// See [`crate::proxy::Error`] for details.
    #[error(transparent)]
    Proxy(#[from] proxy::Error),
}
