//! TCP side of the framed RPC
//!
//! Each accepted connection is served by its own task handling one request at
//! a time. A frame that does not decode is answered with
//! [`Response::Error`] and the connection stays open.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument, trace, warn};

use super::{Request, Response, RpcConn, decode};
use crate::shutdown::ShutdownSignal;

/// Application side of the RPC server
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// Accept connections until shutdown
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn serve(listener: TcpListener, handler: Arc<dyn RequestHandler>, mut shutdown: ShutdownSignal) {
    info!("rpc server accepting connections");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_conn(stream, peer, handler.clone(), shutdown.clone()));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            },
            _ = shutdown.recv() => break,
        }
    }

    info!("rpc server stopped accepting");
}

async fn serve_conn(stream: TcpStream, peer: SocketAddr, handler: Arc<dyn RequestHandler>, mut shutdown: ShutdownSignal) {
    trace!("rpc connection from {peer}");
    let mut conn = RpcConn::from_stream(stream, peer.to_string());

    loop {
        let frame = tokio::select! {
            frame = conn.recv_frame() => frame,
            _ = shutdown.recv() => break,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("rpc connection from {peer} failed: {e}");
                break;
            }
        };

        let response = match decode::<Request>(&frame) {
            Ok(request) => {
                trace!("{} from {peer}", request.method());
                handler.handle(request).await
            }
            Err(e) => {
                warn!("undecodable request from {peer}: {e}");
                Response::Error(format!("undecodable request: {e}"))
            }
        };

        if let Err(e) = conn.send(&response).await {
            debug!("failed to answer {peer}: {e}");
            break;
        }
    }

    trace!("rpc connection from {peer} closed");
}
