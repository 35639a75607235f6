//! ---
//! shem_section: "02-module-messaging"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Async stream framing for the message protocol."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::message::Message;
use crate::{CodecError, MAX_MESSAGE_BYTES};

/// Reads messages from a byte stream, handling the blank-line separation.
///
/// Lines are split on `\n` only; a carriage return stays in the line and is
/// rejected by validation rather than silently stripped.
pub struct MessageReader<R> {
    reader: BufReader<R>,
    body: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            body: Vec::new(),
        }
    }

    /// Read the next message from the stream.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between messages. End
    /// of stream inside a message yields the partial content as the final
    /// message.
    pub async fn read(&mut self) -> Result<Option<Message>, CodecError> {
        self.body.clear();

        // Skip leading empty lines.
        loop {
            match self.next_line().await? {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => {
                    self.body.extend_from_slice(&line);
                    break;
                }
            }
        }

        // Accumulate until an empty line or end of stream.
        loop {
            match self.next_line().await? {
                None => break,
                Some(line) if line.is_empty() => break,
                Some(line) => {
                    self.body.push(b'\n');
                    self.body.extend_from_slice(&line);
                    if self.body.len() > MAX_MESSAGE_BYTES {
                        return Err(CodecError::MessageTooLarge);
                    }
                }
            }
        }

        Message::parse(&self.body).map(Some)
    }

    /// Read one `\n`-terminated line, without the terminator. `None` at end
    /// of stream.
    async fn next_line(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let mut line = Vec::new();
        let read = self.reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Ok(Some(line))
    }
}

/// Writes messages to a byte stream with blank-line separation.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and write a message with the surrounding blank lines, then
    /// flush so short-lived pipes observe it promptly.
    pub async fn write(&mut self, message: &Message) -> Result<(), CodecError> {
        self.inner.write_all(&message.encode_framed()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
