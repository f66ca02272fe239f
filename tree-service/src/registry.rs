//! Tenant registry: owns every tree's root and guards it with a token.
//!
//! The registry runs as a single task. Its tenant map and id counter are
//! plain fields mutated only inside that task, so no locking is needed.
//! Credentials are checked once here; nodes below never see them.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, TreeError},
    node::{Item, Layout, NodeConfig, NodeId, NodeRef, NodeRequest, Reply},
};

pub type TenantId = i64;

/// What a client needs to address its tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub tenant_id: TenantId,
    pub token: String,
}

impl Credentials {
    pub fn new(tenant_id: TenantId, token: impl Into<String>) -> Self {
        Self {
            tenant_id,
            token: token.into(),
        }
    }
}

struct Tenant {
    token: String,
    root: NodeRef,
}

#[derive(Debug)]
enum Command {
    CreateTree {
        max_size: usize,
        reply: oneshot::Sender<Credentials>,
    },
    Route {
        credentials: Credentials,
        request: NodeRequest,
    },
    DeleteTree {
        credentials: Credentials,
        reply: Reply<TenantId>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct Registry {
    tenants: HashMap<TenantId, Tenant>,
    next_id: TenantId,
    traverse_timeout: Duration,
}

impl Registry {
    pub fn new(traverse_timeout: Duration) -> Self {
        Self {
            tenants: HashMap::new(),
            next_id: 1,
            traverse_timeout,
        }
    }

    /// Moves the registry onto its own task and returns the handle to it.
    pub fn spawn(self) -> RegistryHandle {
        let (inbox, commands) = mpsc::unbounded_channel();
        tokio::spawn(self.run(commands));
        RegistryHandle { inbox }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::CreateTree { max_size, reply } => {
                    let _ = reply.send(self.create_tree(max_size));
                }
                Command::Route {
                    credentials,
                    request,
                } => self.route(&credentials, request),
                Command::DeleteTree { credentials, reply } => {
                    let _ = reply.send(self.delete_tree(&credentials));
                }
                Command::Shutdown { reply } => {
                    self.shutdown();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("registry stopped");
    }

    fn create_tree(&mut self, max_size: usize) -> Credentials {
        let max_size = if max_size == 0 {
            warn!("max_size 0 cannot split, using 1");
            1
        } else {
            max_size
        };

        let tenant_id = self.next_id;
        self.next_id += 1;
        let token = generate_token();
        let root = NodeRef::spawn_leaf(
            NodeId::root(tenant_id),
            NodeConfig {
                max_size,
                traverse_timeout: self.traverse_timeout,
            },
        );
        self.tenants.insert(
            tenant_id,
            Tenant {
                token: token.clone(),
                root,
            },
        );

        info!(tenant_id, max_size, "tree created");
        Credentials { tenant_id, token }
    }

    fn authorize(&self, credentials: &Credentials) -> Result<&Tenant> {
        let tenant = self
            .tenants
            .get(&credentials.tenant_id)
            .ok_or(TreeError::NoSuchTree {
                tenant_id: credentials.tenant_id,
            })?;
        if tenant.token != credentials.token {
            warn!(tenant_id = credentials.tenant_id, "rejected invalid token");
            return Err(TreeError::InvalidToken);
        }
        Ok(tenant)
    }

    fn route(&self, credentials: &Credentials, request: NodeRequest) {
        match self.authorize(credentials) {
            Ok(tenant) => tenant.root.send(request),
            Err(error) => request.reject(error),
        }
    }

    fn delete_tree(&mut self, credentials: &Credentials) -> Result<TenantId> {
        self.authorize(credentials)?;
        if let Some(tenant) = self.tenants.remove(&credentials.tenant_id) {
            tenant.root.teardown();
        }
        info!(tenant_id = credentials.tenant_id, "tree deleted");
        Ok(credentials.tenant_id)
    }

    fn shutdown(&mut self) {
        info!(trees = self.tenants.len(), "registry shutting down");
        for (_, tenant) in self.tenants.drain() {
            tenant.root.teardown();
        }
    }
}

/// Four random bytes as lowercase hex.
fn generate_token() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Cloneable address of the running registry.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    inbox: mpsc::UnboundedSender<Command>,
}

impl RegistryHandle {
    pub async fn create_tree(&self, max_size: usize) -> Result<Credentials> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::CreateTree { max_size, reply })?;
        response.await.map_err(|_| TreeError::Unavailable)
    }

    pub async fn insert(
        &self,
        credentials: &Credentials,
        key: i64,
        value: impl Into<String>,
    ) -> Result<Item> {
        let item = Item::new(key, value);
        self.route(credentials, |reply| NodeRequest::Insert { item, reply })
            .await
    }

    pub async fn search(&self, credentials: &Credentials, key: i64) -> Result<Item> {
        self.route(credentials, |reply| NodeRequest::Search { key, reply })
            .await
    }

    pub async fn delete(&self, credentials: &Credentials, key: i64) -> Result<Item> {
        self.route(credentials, |reply| NodeRequest::Delete { key, reply })
            .await
    }

    pub async fn traverse(&self, credentials: &Credentials) -> Result<Vec<Item>> {
        self.route(credentials, |reply| NodeRequest::Traverse { reply })
            .await
    }

    pub async fn layout(&self, credentials: &Credentials) -> Result<Layout> {
        self.route(credentials, |reply| NodeRequest::Layout { reply })
            .await
    }

    pub async fn delete_tree(&self, credentials: &Credentials) -> Result<TenantId> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::DeleteTree {
            credentials: credentials.clone(),
            reply,
        })?;
        response.await.unwrap_or(Err(TreeError::Unavailable))
    }

    /// Tears down every tree and stops the registry.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.submit(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }

    async fn route<T>(
        &self,
        credentials: &Credentials,
        request: impl FnOnce(Reply<T>) -> NodeRequest,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Route {
            credentials: credentials.clone(),
            request: request(reply),
        })?;
        response.await.unwrap_or(Err(TreeError::Unavailable))
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.inbox
            .send(command)
            .map_err(|_| TreeError::Unavailable)
    }
}
