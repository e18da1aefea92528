use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::{ClusterError, Node};

/// Upper bound on payload frames following a single `User` envelope.
const MAX_USER_PAYLOADS: usize = 4096;

pub(crate) type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// Header frame of every gossip exchange. `PushPull` is followed by exactly one
/// state frame and `User` by `count` payload frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Envelope {
    PushPull {
        cluster: String,
        from: Node,
        join: bool,
        members: Vec<Node>,
    },
    User {
        cluster: String,
        from: String,
        count: usize,
    },
    Leave {
        cluster: String,
        node: Node,
    },
}

impl Envelope {
    pub(crate) fn cluster(&self) -> &str {
        match self {
            Envelope::PushPull { cluster, .. }
            | Envelope::User { cluster, .. }
            | Envelope::Leave { cluster, .. } => cluster,
        }
    }

    pub(crate) fn check_cluster(&self, expected: &str) -> Result<(), ClusterError> {
        if self.cluster() == expected {
            Ok(())
        } else {
            Err(ClusterError::ClusterMismatch {
                expected: expected.to_string(),
                got: self.cluster().to_string(),
            })
        }
    }

    fn payload_count(&self) -> Result<usize, ClusterError> {
        match self {
            Envelope::PushPull { .. } => Ok(1),
            Envelope::User { count, .. } if *count <= MAX_USER_PAYLOADS => Ok(*count),
            Envelope::User { count, .. } => Err(ClusterError::Protocol(format!(
                "too many payloads in one message: {}",
                count
            ))),
            Envelope::Leave { .. } => Ok(0),
        }
    }
}

pub(crate) fn connection(stream: TcpStream, max_frame_size: usize) -> Connection {
    Framed::new(
        stream,
        LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(max_frame_size)
            .new_codec(),
    )
}

/// Write an envelope and its payload frames, then flush.
pub(crate) async fn send(
    conn: &mut Connection,
    envelope: &Envelope,
    payloads: &[Bytes],
) -> Result<(), ClusterError> {
    let expected = envelope.payload_count()?;
    if expected != payloads.len() {
        return Err(ClusterError::Protocol(format!(
            "envelope announces {} payloads, got {}",
            expected,
            payloads.len()
        )));
    }

    conn.feed(Bytes::from(serde_json::to_vec(envelope)?)).await?;
    for payload in payloads {
        conn.feed(payload.clone()).await?;
    }
    SinkExt::<Bytes>::flush(conn).await?;
    Ok(())
}

/// Read an envelope together with the payload frames it announces.
pub(crate) async fn recv(conn: &mut Connection) -> Result<(Envelope, Vec<BytesMut>), ClusterError> {
    let header = next_frame(conn).await?;
    let envelope: Envelope = serde_json::from_slice(&header)?;

    let count = envelope.payload_count()?;
    let mut payloads = Vec::with_capacity(count);
    for _ in 0..count {
        payloads.push(next_frame(conn).await?);
    }
    Ok((envelope, payloads))
}

async fn next_frame(conn: &mut Connection) -> Result<BytesMut, ClusterError> {
    match conn.next().await {
        Some(frame) => Ok(frame?),
        None => Err(ClusterError::Protocol("connection closed mid-message".to_string())),
    }
}
