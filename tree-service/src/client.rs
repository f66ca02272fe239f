use std::fmt::Write as _;

use anyhow::{Context, Result, anyhow};
use tokio::{io::BufReader, net::TcpStream, time::timeout};
use tracing::debug;

use crate::{
    cli::{ClientArgs, ClientCommand},
    error::TreeError,
    message::{Request, Response, read_message, write_message},
    node::Layout,
};

/// Sends the request described by `args` and waits for its single reply.
pub async fn run(args: &ClientArgs) -> Result<Response> {
    let request = build_request(args)?;
    timeout(args.timeout(), exchange(args, &request))
        .await
        .map_err(|_| anyhow!("no reply from {} within {:?}", args.remote, args.timeout()))?
}

async fn exchange(args: &ClientArgs, request: &Request) -> Result<Response> {
    let stream = TcpStream::connect(args.remote)
        .await
        .with_context(|| format!("failed to connect to {}", args.remote))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    debug!(?request, "sending request");
    write_message(&mut writer, request).await?;
    read_message::<_, Response>(&mut reader)
        .await?
        .context("service closed the connection without replying")
}

/// Turns the parsed command line into a wire request.
pub fn build_request(args: &ClientArgs) -> Result<Request, TreeError> {
    let request = match &args.command {
        ClientCommand::CreateTree(create) => Request::CreateTree {
            max_size: usize::try_from(create.max_size).unwrap_or(usize::MAX),
        },
        ClientCommand::Insert { key, value } => Request::Insert {
            credentials: args.credentials()?,
            key: *key,
            value: value.clone(),
        },
        ClientCommand::Search { key } => Request::Search {
            credentials: args.credentials()?,
            key: *key,
        },
        ClientCommand::Delete { key } => Request::Delete {
            credentials: args.credentials()?,
            key: *key,
        },
        ClientCommand::Traverse => Request::Traverse {
            credentials: args.credentials()?,
        },
        ClientCommand::Layout => Request::Layout {
            credentials: args.credentials()?,
        },
        ClientCommand::DeleteTree => Request::DeleteTree {
            credentials: args.credentials()?,
        },
    };
    Ok(request)
}

/// Text shown to the user for a reply; errors are meant for stderr.
pub fn render(response: &Response) -> Result<String, TreeError> {
    match response {
        Response::TreeCreated { credentials } => {
            Ok(format!("{}, {}", credentials.tenant_id, credentials.token))
        }
        Response::Inserted { item } | Response::Found { item } | Response::Deleted { item } => {
            Ok(item.to_string())
        }
        Response::Items { items } if items.is_empty() => Ok("(empty)".to_string()),
        Response::Items { items } => Ok(items
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")),
        Response::Layout { layout } => {
            let mut out = String::new();
            for (depth, node) in layout.preorder() {
                let indent = "  ".repeat(depth);
                let _ = match node {
                    Layout::Leaf { id, len } => writeln!(out, "{indent}{id} leaf ({len} entries)"),
                    Layout::Router { id, split_key, .. } => {
                        writeln!(out, "{indent}{id} router (<= {split_key} left)")
                    }
                };
            }
            Ok(out.trim_end().to_string())
        }
        Response::TreeDeleted { tenant_id } => Ok(format!("tree {tenant_id} deleted")),
        Response::Error { error } => Err(error.clone()),
    }
}
