//! Outbound WebSocket transport for upstream sessions.
//!
//! Thin wrapper around `tokio-tungstenite` that hands back independent
//! reader/writer halves, so the reader can live in its own task while the
//! relay session keeps the writer.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use super::ConnectError;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// 1000 = normal, 1005 = no code.
        code: u16,
        reason: String,
    },
}

/// Write half of an upstream connection.
pub struct WsWriter {
    sink: SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    pub async fn send_text(&mut self, text: String) -> Result<(), tungstenite::Error> {
        self.sink.send(tungstenite::Message::text(text)).await
    }

    /// Send a close frame and shut the sink.
    pub async fn close(&mut self) -> Result<(), tungstenite::Error> {
        self.sink.close().await
    }
}

/// Read half of an upstream connection.
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Ping/pong and raw frames are handled by tungstenite and skipped here.
    pub async fn recv(&mut self) -> Option<Result<WsMessage, tungstenite::Error>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    return Some(Ok(WsMessage::Text(text.as_str().to_owned())));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    return Some(Ok(WsMessage::Binary(data.to_vec())));
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map_or((1005, String::new()), |cf| {
                            (cf.code.into(), cf.reason.as_str().to_owned())
                        });
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Ok(
                    tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_)
                    | tungstenite::Message::Frame(_),
                ) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Connect to a WebSocket URL with extra request headers.
///
/// An HTTP error response during the handshake (e.g. 401 for a bad key)
/// becomes [`ConnectError::Rejected`] and an unusable URL becomes
/// [`ConnectError::InvalidRequest`]; everything else is a transport error.
pub async fn connect(
    url: &str,
    headers: &[(&str, &str)],
) -> Result<(WsWriter, WsReader), ConnectError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectError::InvalidRequest(format!("{url}: {e}")))?;

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ConnectError::InvalidRequest(format!("header name {name}: {e}")))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .map_err(|e| ConnectError::InvalidRequest(format!("header value for {name}: {e}")))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| match e {
            tungstenite::Error::Http(response) => ConnectError::Rejected {
                status: response.status().as_u16(),
            },
            tungstenite::Error::Url(e) => ConnectError::InvalidRequest(format!("{url}: {e}")),
            other => ConnectError::Transport(other.to_string()),
        })?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}
