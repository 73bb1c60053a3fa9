use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::message::Message;

/// Serialized bytes waiting to go out, with a record of how far writing got.
pub struct ResponseWriter {
    buffer: Vec<u8>,
    written: usize,
}

impl ResponseWriter {
    /// Head and body of `response`.
    pub fn new(response: &Message) -> Self {
        Self::from_bytes(response.message_data())
    }

    /// Head of `response` only; the body is streamed separately.
    pub fn head(response: &Message) -> Self {
        Self::from_bytes(response.header_data())
    }

    pub fn from_bytes(buffer: Vec<u8>) -> Self {
        Self { buffer, written: 0 }
    }

    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while self.written < self.buffer.len() {
            let n = stream.write(&self.buffer[self.written..]).await?;

            if n == 0 {
                return Err(anyhow::anyhow!("connection closed while writing"));
            }

            self.written += n;
        }

        stream.flush().await?;
        Ok(())
    }
}
