//! Lazy line reader over a decompressing network body.

use std::error::Error as StdError;
use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::proxy::codec::{ContentEncoding, StreamDecoder};

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Newline-delimited text lines read from an upstream body.
///
/// Chunks are pulled from the network only when the buffered bytes hold no
/// complete line, so each `next_line` call is a suspension point. Dropping
/// the stream drops the decoder and the network body with it.
pub struct LineStream {
    source: ByteStream,
    decoder: Option<StreamDecoder>,
    pending: Vec<u8>,
    finished: bool,
}

impl LineStream {
    pub fn new<S, E>(source: S, encoding: ContentEncoding) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let source = source.map(|chunk| chunk.map_err(into_io_error));
        Self {
            source: Box::pin(source),
            decoder: Some(StreamDecoder::new(encoding)),
            pending: Vec::new(),
            finished: false,
        }
    }

    /// Next line without its terminator, `None` at end of data.
    ///
    /// `\n` and `\r\n` both end a line. A trailing line without a
    /// terminator is still returned. After an error the stream is finished.
    pub async fn next_line(&mut self) -> Option<io::Result<String>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Some(Ok(to_text(&line[..line.len() - 1])));
            }

            if self.finished {
                if self.pending.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut self.pending);
                return Some(Ok(to_text(&line)));
            }

            match self.source.next().await {
                Some(Ok(chunk)) => {
                    let decoder = self.decoder.as_mut()?;
                    if let Err(e) = decoder.push(&chunk, &mut self.pending) {
                        return Some(Err(self.fail(e)));
                    }
                }
                Some(Err(e)) => return Some(Err(self.fail(e))),
                None => {
                    self.finished = true;
                    if let Some(decoder) = self.decoder.take() {
                        if let Err(e) = decoder.finish(&mut self.pending) {
                            return Some(Err(self.fail(e)));
                        }
                    }
                }
            }
        }
    }

    fn fail(&mut self, error: io::Error) -> io::Error {
        self.finished = true;
        self.decoder = None;
        self.pending.clear();
        error
    }
}

/// Keep the kind of errors that already are `io::Error`.
fn into_io_error<E: Into<Box<dyn StdError + Send + Sync>>>(error: E) -> io::Error {
    let error: Box<dyn StdError + Send + Sync> = error.into();
    match error.downcast::<io::Error>() {
        Ok(io) => *io,
        Err(other) => io::Error::other(other),
    }
}

fn to_text(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
