//! A newline-framed message channel over a TCP stream. Both sides agree on
//! frame boundaries, payloads stay opaque at this layer.

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

pub struct Connection {
    lines: Framed<TcpStream, LinesCodec>,
    closed: bool,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            lines: Framed::new(stream, LinesCodec::new()),
            closed: false,
        }
    }

    pub async fn send_message(&mut self, payload: String) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(self.lines.send(payload).await?)
    }

    /// `None` means the remote side closed the connection.
    pub async fn receive_message(&mut self) -> Result<Option<String>, Box<dyn Error + Send + Sync>> {
        match self.lines.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(error)) => {
                self.closed = true;
                Err(error.into())
            }
            None => {
                self.closed = true;
                Ok(None)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn send_json<T: Serialize>(&mut self, value: &T) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.send_message(serde_json::to_string(value)?).await
    }

    pub async fn receive_json<T: DeserializeOwned>(
        &mut self,
    ) -> Result<Option<T>, Box<dyn Error + Send + Sync>> {
        match self.receive_message().await? {
            Some(line) => Ok(Some(serde_json::from_str::<T>(&line)?)),
            None => Ok(None),
        }
    }
}
