//! Multi-tenant key-value store built from message-driven tree nodes.
//!
//! Each tenant owns one binary routing tree. Leaves hold entries; a leaf that
//! grows past its capacity splits by rank into two new leaves and becomes a
//! router that forwards by key. Every node is its own tokio task, so trees of
//! different tenants (and different branches of one tree) make progress
//! concurrently while each node handles one message at a time.
//!
//! - [`node`] holds the leaf/router state machine and the split, routing and
//!   scatter-gather traverse protocol.
//! - [`registry`] owns the tenant table, hands out ids and tokens, and checks
//!   credentials before a request reaches a tree.
//! - [`message`] is the JSON line protocol spoken between `treecli` and
//!   `treeservice`.
//! - [`server`] accepts TCP connections and relays requests to the registry.
//! - [`client`] sends one request and renders its reply for `treecli`.
//! - [`cli`] parses both command lines.
//! - [`error`] is the typed error taxonomy shared by all of the above.

pub mod cli;
pub mod client;
pub mod error;
pub mod message;
pub mod node;
pub mod registry;
pub mod server;
