//! Live viewer client for `GET /api/v1/live`.

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::ClientError;
use crate::objects::LiveServerMessage;

/// A connected live stream.
///
/// The first message is a snapshot; incremental frames follow.
pub struct LiveClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl LiveClient {
    /// Connect to `{base_url}/api/v1/live`. `base_url` must use `ws://` or `wss://`.
    pub async fn connect(base_url: &Url) -> Result<Self, ClientError> {
        let url = base_url.join("/api/v1/live")?;
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        Ok(Self { stream })
    }

    /// Wait for the next server message.
    ///
    /// Returns `None` once the server closes the connection. Control frames
    /// are skipped.
    pub async fn next_message(&mut self) -> Option<Result<LiveServerMessage, ClientError>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).map_err(ClientError::Json));
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }
}
