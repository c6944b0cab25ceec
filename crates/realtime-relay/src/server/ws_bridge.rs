//! Glue between an upgraded axum socket and a [`RelaySession`].
//!
//! The socket is split: a reader task feeds client frames into the session
//! and a writer task drains the session's outbound commands. The reader
//! ending closes the session's inbound channel, which the session sees as
//! the client leaving.
//!
//! [`RelaySession`]: crate::session::RelaySession

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use crate::event::ClientFrame;
use crate::server::RelayServer;
use crate::session::{ClientCommand, ClientEndpoint};

pub(super) async fn bridge(server: Arc<RelayServer>, socket: WebSocket) {
    let (session, endpoint) = server.accept();
    let session_id = session.id();
    let ClientEndpoint {
        inbound,
        mut outbound,
    } = endpoint;
    let (mut sink, mut stream) = socket.split();

    let reader = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let frame = match msg {
                Ok(Message::Text(text)) => ClientFrame::Text(text.as_str().to_owned()),
                Ok(Message::Binary(data)) => ClientFrame::Binary(data.to_vec()),
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "Client socket error");
                    break;
                }
            };
            if inbound.send(frame).await.is_err() {
                break;
            }
        }
        debug!(session_id = %session_id, "Client reader finished");
    });

    let writer = tokio::spawn(async move {
        while let Some(command) = outbound.recv().await {
            match command {
                ClientCommand::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                ClientCommand::Close => break,
            }
        }
        let _ = sink.close().await;
    });

    let report = session.run().await;
    reader.abort();
    let _ = writer.await;
    debug!(session_id = %session_id, reason = %report.reason, "Client socket released");
}
