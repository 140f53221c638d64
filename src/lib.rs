//! connsync — cluster connection reconciliation.
//!
//! Every worker node runs its own loop that keeps the message-queue
//! consumers and producers open on that node equal to the set registered
//! in a shared cluster registry. Nodes do not coordinate; each converges
//! independently against the same desired state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod descriptor;
pub mod lifecycle;
pub mod logging;
pub mod node;
pub mod reconcile;
pub mod registry;
pub mod store;
