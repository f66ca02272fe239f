use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::TreeError,
    node::{Item, Layout},
    registry::{Credentials, TenantId},
};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    CreateTree {
        max_size: usize,
    },
    Insert {
        credentials: Credentials,
        key: i64,
        value: String,
    },
    Search {
        credentials: Credentials,
        key: i64,
    },
    Delete {
        credentials: Credentials,
        key: i64,
    },
    Traverse {
        credentials: Credentials,
    },
    Layout {
        credentials: Credentials,
    },
    DeleteTree {
        credentials: Credentials,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    TreeCreated { credentials: Credentials },
    Inserted { item: Item },
    Found { item: Item },
    Deleted { item: Item },
    Items { items: Vec<Item> },
    Layout { layout: Layout },
    TreeDeleted { tenant_id: TenantId },
    Error { error: TreeError },
}

/// Longest request or response line accepted, newline included.
pub const MAX_LINE_BYTES: u64 = 1 << 20;

/// Reads the next non-blank line and decodes it. `Ok(None)` means the peer
/// closed the stream.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let mut limited = (&mut *reader).take(MAX_LINE_BYTES);
        let read = limited.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        if read as u64 == MAX_LINE_BYTES && !line.ends_with('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line longer than {MAX_LINE_BYTES} bytes"),
            ));
        }

        let frame = line.trim_end_matches(LINE_ENDINGS);
        if !frame.is_empty() {
            return serde_json::from_str(frame).map(Some).map_err(invalid_data);
        }
    }
}

/// Encodes `message` as one JSON line and flushes it.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut frame = serde_json::to_vec(message).map_err(invalid_data)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn invalid_data(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
