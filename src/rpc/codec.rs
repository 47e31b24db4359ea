use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::{Request, Response, RpcError};

/// Upper bound for a single frame
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, RpcError> {
    Ok(Bytes::from(bincode::serialize(msg)?))
}

pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, RpcError> {
    Ok(bincode::deserialize(buf)?)
}

/// One framed connection
///
/// Any I/O or codec failure marks the connection unhealthy; the pool never
/// hands an unhealthy connection out again.
pub struct RpcConn {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    peer: String,
    healthy: bool,
}

impl RpcConn {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, RpcError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::ConnectTimeout(addr.to_string()))?
            .map_err(|source| RpcError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Self::from_stream(stream, addr.to_string()))
    }

    pub fn from_stream(stream: TcpStream, peer: String) -> Self {
        Self {
            framed: Framed::new(stream, frame_codec()),
            peer,
            healthy: true,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Write one request and wait for its response
    pub async fn call(&mut self, request: &Request) -> Result<Response, RpcError> {
        self.send(request).await?;
        match self.recv::<Response>().await? {
            Some(response) => Ok(response),
            None => {
                self.healthy = false;
                Err(RpcError::Closed)
            }
        }
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), RpcError> {
        let frame = encode(msg).inspect_err(|_| self.healthy = false)?;
        self.framed
            .send(frame)
            .await
            .inspect_err(|_| self.healthy = false)?;
        Ok(())
    }

    /// Next message, `None` on a clean close
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, RpcError> {
        match self.framed.next().await {
            Some(Ok(frame)) => decode(&frame).map(Some).inspect_err(|_| self.healthy = false),
            Some(Err(e)) => {
                self.healthy = false;
                Err(RpcError::Io(e))
            }
            None => Ok(None),
        }
    }

    /// Raw frame access for servers that answer undecodable requests
    pub async fn recv_frame(&mut self) -> Result<Option<bytes::BytesMut>, RpcError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => {
                self.healthy = false;
                Err(RpcError::Io(e))
            }
            None => Ok(None),
        }
    }
}
