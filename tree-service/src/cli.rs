use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    error::TreeError,
    registry::{Credentials, TenantId},
    server::ServiceConfig,
};

/// Hosts the tree registry and serves it over TCP.
#[derive(Parser, Debug)]
#[command(name = "treeservice", author, version, about, long_about = None)]
pub struct ServiceArgs {
    /// Socket address the service should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8090")]
    pub listen: SocketAddr,

    /// How long a router waits for its children during traverse, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub traverse_timeout_ms: u64,
}

impl ServiceArgs {
    pub fn config(&self) -> ServiceConfig {
        ServiceConfig {
            listen: self.listen,
            traverse_timeout: Duration::from_millis(self.traverse_timeout_ms),
        }
    }
}

/// Talks to a running treeservice, one request per invocation.
#[derive(Parser, Debug)]
#[command(name = "treecli", author, version, about, long_about = None)]
pub struct ClientArgs {
    /// Address the tree service is bound to.
    #[arg(long, global = true, default_value = "127.0.0.1:8090")]
    pub remote: SocketAddr,

    /// How long to wait for the service to answer, in milliseconds.
    #[arg(long, global = true, default_value_t = 5000)]
    pub timeout_ms: u64,

    /// Id of the tree to operate on.
    #[arg(long, global = true)]
    pub id: Option<TenantId>,

    /// Token returned when the tree was created.
    #[arg(long, global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: ClientCommand,
}

impl ClientArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Both `--id` and `--token`, or `MissingCredentials`.
    pub fn credentials(&self) -> Result<Credentials, TreeError> {
        match (self.id, &self.token) {
            (Some(tenant_id), Some(token)) => Ok(Credentials::new(tenant_id, token.clone())),
            _ => Err(TreeError::MissingCredentials),
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum ClientCommand {
    /// Create a new tree and print its id and token.
    #[command(name = "createtree")]
    CreateTree(CreateTreeArgs),
    /// Insert a key-value pair.
    Insert {
        #[arg(allow_negative_numbers = true)]
        key: i64,
        value: String,
    },
    /// Look up the value stored for a key.
    Search {
        #[arg(allow_negative_numbers = true)]
        key: i64,
    },
    /// Remove a key and print the removed pair.
    Delete {
        #[arg(allow_negative_numbers = true)]
        key: i64,
    },
    /// Print every pair in ascending key order.
    Traverse,
    /// Print the shape of the tree.
    Layout,
    /// Delete the whole tree.
    #[command(name = "deletetree")]
    DeleteTree,
}

#[derive(Args, Debug, Clone)]
pub struct CreateTreeArgs {
    /// Maximal size of a leaf.
    #[arg(long = "maxsize", default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_size: u64,
}
