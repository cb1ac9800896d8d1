//! Modbus-TCP listener for upstream clients

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use modbus_core::{MbapCodec, TcpAdu};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::handler::RequestHandler;

/// Accept clients until `shutdown` fires; each client runs on its own task
pub async fn run_accept_loop(
    listener: TcpListener,
    handler: Arc<RequestHandler>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("TCP_NODELAY: {}", e);
                    }
                    debug!("Client connected: {}", peer);
                    tracker.spawn(serve_connection(
                        stream,
                        peer,
                        handler.clone(),
                        shutdown.clone(),
                    ));
                },
                Err(e) => warn!("Accept failed: {}", e),
            },
        }
    }

    // Dropping the listener closes the socket
    drop(listener);
    info!("Listener closed");
}

/// Serve one client connection: frames are answered strictly in order
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<RequestHandler>,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, MbapCodec);

    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = framed.next() => next,
        };

        let request = match next {
            None => {
                debug!("Client {} disconnected", peer);
                break;
            },
            Some(Ok(adu)) => adu,
            Some(Err(e)) => {
                warn!("Client {} framing error, closing: {}", peer, e);
                break;
            },
        };

        let pdu = handler.handle(request.unit_id, &request.pdu).await;
        let reply = TcpAdu::new(request.transaction_id, request.unit_id, pdu);
        if let Err(e) = framed.send(reply).await {
            debug!("Client {} write failed: {}", peer, e);
            break;
        }
    }
}
