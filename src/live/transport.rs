use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Both halves of one open duplex stream.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens the duplex stream behind a live connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Transport>;
}

/// Production connector over tokio-tungstenite.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Transport> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("WebSocket handshake with {} failed", url))?;
        let (sink, stream) = ws_stream.split();
        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// In-memory connector: each `connect` consumes the next queued feed.
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use futures_util::SinkExt;
    use std::collections::VecDeque;
    use std::convert::Infallible;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    pub type Feed = mpsc::UnboundedSender<Result<Message, WsError>>;

    #[derive(Default)]
    pub struct MemoryConnector {
        feeds: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<Message, WsError>>>>,
        urls: Mutex<Vec<String>>,
    }

    impl MemoryConnector {
        /// Queue the stream for the next `connect` and return its sender.
        /// Dropping the sender ends the stream.
        pub fn feed(&self) -> Feed {
            let (tx, rx) = mpsc::unbounded_channel();
            self.feeds.lock().unwrap().push_back(rx);
            tx
        }

        pub fn urls(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, url: &Url) -> Result<Transport> {
            self.urls.lock().unwrap().push(url.to_string());
            let rx = self
                .feeds
                .lock()
                .unwrap()
                .pop_front()
                .context("connection refused: no feed queued")?;
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|msg| (msg, rx))
            });
            let sink = futures_util::sink::drain::<Message>()
                .sink_map_err(|never: Infallible| -> WsError { match never {} });
            Ok(Transport {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
    }
}
