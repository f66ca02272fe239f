use std::{future::Future, net::SocketAddr, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    error::TreeError,
    message::{Request, Response, read_message, write_message},
    registry::{Registry, RegistryHandle},
};

pub const DEFAULT_TRAVERSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings for `treeservice`.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen: SocketAddr,
    /// How long a router waits for its children during traverse and layout.
    pub traverse_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8090)),
            traverse_timeout: DEFAULT_TRAVERSE_TIMEOUT,
        }
    }
}

/// Accepts TCP clients and feeds their requests to the registry.
pub struct TreeServer {
    listener: TcpListener,
    registry: RegistryHandle,
}

impl TreeServer {
    pub fn new(listener: TcpListener, config: &ServiceConfig) -> Self {
        Self {
            listener,
            registry: Registry::new(config.traverse_timeout).spawn(),
        }
    }

    pub async fn bind(config: &ServiceConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let TreeServer { listener, registry } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("tree service shutting down");
                    registry.shutdown().await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &RegistryHandle,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, registry),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, registry: &RegistryHandle) {
    let registry = registry.clone();
    tokio::spawn(async move {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        debug!(peer = %peer, "client connected");
        if let Err(err) = serve_connection(&mut reader, &mut writer, &registry).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

/// Answers requests from one client, in order, until it hangs up.
///
/// A line that does not parse is answered with a protocol error and ends the
/// connection.
pub async fn serve_connection<R, W>(
    reader: &mut R,
    writer: &mut W,
    registry: &RegistryHandle,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let request = match read_message::<_, Request>(reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(err) => {
                let error = TreeError::Protocol {
                    message: err.to_string(),
                };
                write_message(writer, &Response::Error { error }).await?;
                return Err(err.into());
            }
        };

        let response = dispatch(registry, request).await;
        write_message(writer, &response).await?;
    }
}

/// Executes one wire request against the registry.
pub async fn dispatch(registry: &RegistryHandle, request: Request) -> Response {
    let outcome = match request {
        Request::CreateTree { max_size } => registry
            .create_tree(max_size)
            .await
            .map(|credentials| Response::TreeCreated { credentials }),
        Request::Insert {
            credentials,
            key,
            value,
        } => registry
            .insert(&credentials, key, value)
            .await
            .map(|item| Response::Inserted { item }),
        Request::Search { credentials, key } => registry
            .search(&credentials, key)
            .await
            .map(|item| Response::Found { item }),
        Request::Delete { credentials, key } => registry
            .delete(&credentials, key)
            .await
            .map(|item| Response::Deleted { item }),
        Request::Traverse { credentials } => registry
            .traverse(&credentials)
            .await
            .map(|items| Response::Items { items }),
        Request::Layout { credentials } => registry
            .layout(&credentials)
            .await
            .map(|layout| Response::Layout { layout }),
        Request::DeleteTree { credentials } => registry
            .delete_tree(&credentials)
            .await
            .map(|tenant_id| Response::TreeDeleted { tenant_id }),
    };
    outcome.unwrap_or_else(|error| Response::Error { error })
}
