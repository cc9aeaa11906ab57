//! Content-Encoding handling and body text decoding.
//!
//! Upstream bodies may arrive gzip, deflate or brotli encoded. Buffered
//! bodies are decoded in one pass; streaming bodies are pushed chunk by
//! chunk through a [`StreamDecoder`].

use std::fmt;
use std::io::{self, Read, Write};

/// Upper bound for a buffered, decompressed body.
pub const MAX_DECOMPRESSED_BYTES: usize = 64 * 1024 * 1024;

/// Content codings the proxy knows how to undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl ContentEncoding {
    /// Select a decoder from a `Content-Encoding` header value.
    ///
    /// Only the first listed coding is considered. Unknown or absent
    /// codings pass the body through unchanged.
    pub fn from_header(value: Option<&str>) -> Self {
        let first = value
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_ascii_lowercase());

        match first.as_deref() {
            Some("gzip") | Some("x-gzip") => ContentEncoding::Gzip,
            Some("deflate") => ContentEncoding::Deflate,
            Some("br") => ContentEncoding::Brotli,
            _ => ContentEncoding::Identity,
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
            ContentEncoding::Brotli => "br",
        };
        f.write_str(name)
    }
}

/// Decompress a fully buffered body.
pub fn decompress(data: &[u8], encoding: ContentEncoding) -> io::Result<Vec<u8>> {
    match encoding {
        ContentEncoding::Identity => Ok(data.to_vec()),
        ContentEncoding::Gzip => read_limited(flate2::read::GzDecoder::new(data)),
        ContentEncoding::Deflate => read_limited(flate2::read::DeflateDecoder::new(data)),
        ContentEncoding::Brotli => read_limited(brotli::Decompressor::new(data, 4096)),
    }
}

fn read_limited<R: Read>(reader: R) -> io::Result<Vec<u8>> {
    let mut result = Vec::new();
    reader
        .take((MAX_DECOMPRESSED_BYTES + 1) as u64)
        .read_to_end(&mut result)?;

    if result.len() > MAX_DECOMPRESSED_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed body exceeds {MAX_DECOMPRESSED_BYTES} bytes"),
        ));
    }
    Ok(result)
}

/// Result of turning body bytes into text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedText {
    pub text: String,
    /// The bytes were not text; `text` is a placeholder.
    pub binary: bool,
}

/// Decode body bytes as UTF-8, then Latin-1, then give up with a
/// placeholder.
///
/// Latin-1 maps every byte, so it is only accepted when the result has no
/// control characters besides tab, CR and LF. This is stricter than a plain
/// Latin-1 fallback on purpose: binary payloads get the placeholder instead
/// of being logged as control-character noise.
pub fn decode_text(bytes: &[u8]) -> DecodedText {
    if bytes.is_empty() {
        return DecodedText {
            text: String::new(),
            binary: false,
        };
    }

    let utf8 = String::from_utf8_lossy(bytes);
    if !utf8.contains('\u{FFFD}') {
        return DecodedText {
            text: utf8.into_owned(),
            binary: false,
        };
    }

    let latin1: String = bytes.iter().map(|&b| b as char).collect();
    if !latin1
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\t' | '\r' | '\n'))
    {
        return DecodedText {
            text: latin1,
            binary: false,
        };
    }

    DecodedText {
        text: format!("[BINARY DATA: {} bytes]", bytes.len()),
        binary: true,
    }
}

/// Push-based decompressor for bodies that arrive in chunks.
pub enum StreamDecoder {
    Identity,
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Deflate(flate2::write::DeflateDecoder<Vec<u8>>),
    Brotli(Box<brotli::DecompressorWriter<Vec<u8>>>),
}

impl StreamDecoder {
    pub fn new(encoding: ContentEncoding) -> Self {
        match encoding {
            ContentEncoding::Identity => StreamDecoder::Identity,
            ContentEncoding::Gzip => StreamDecoder::Gzip(flate2::write::GzDecoder::new(Vec::new())),
            ContentEncoding::Deflate => {
                StreamDecoder::Deflate(flate2::write::DeflateDecoder::new(Vec::new()))
            }
            ContentEncoding::Brotli => {
                StreamDecoder::Brotli(Box::new(brotli::DecompressorWriter::new(Vec::new(), 4096)))
            }
        }
    }

    /// Feed one compressed chunk, appending whatever plain bytes it yields
    /// to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        match self {
            StreamDecoder::Identity => out.extend_from_slice(chunk),
            StreamDecoder::Gzip(decoder) => {
                decoder.write_all(chunk)?;
                decoder.flush()?;
                out.append(decoder.get_mut());
            }
            StreamDecoder::Deflate(decoder) => {
                decoder.write_all(chunk)?;
                decoder.flush()?;
                out.append(decoder.get_mut());
            }
            StreamDecoder::Brotli(decoder) => {
                decoder.write_all(chunk)?;
                decoder.flush()?;
                out.append(decoder.get_mut());
            }
        }
        Ok(())
    }

    /// Signal end of input and collect any trailing plain bytes.
    pub fn finish(self, out: &mut Vec<u8>) -> io::Result<()> {
        match self {
            StreamDecoder::Identity => {}
            StreamDecoder::Gzip(decoder) => out.append(&mut decoder.finish()?),
            StreamDecoder::Deflate(decoder) => out.append(&mut decoder.finish()?),
            StreamDecoder::Brotli(decoder) => {
                let mut rest = decoder.into_inner().map_err(|_| {
                    io::Error::new(io::ErrorKind::UnexpectedEof, "truncated brotli stream")
                })?;
                out.append(&mut rest);
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    const PLAIN: &[u8] = b"{\"objects\":[{\"object_key\":\"device.ABC\"}]}\n{\"next\":true}\n";

    #[test]
    fn test_from_header() {
        assert_eq!(ContentEncoding::from_header(Some("gzip")), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::from_header(Some("GZIP")), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::from_header(Some("br, gzip")), ContentEncoding::Brotli);
        assert_eq!(ContentEncoding::from_header(Some(" deflate ")), ContentEncoding::Deflate);
        assert_eq!(ContentEncoding::from_header(Some("zstd")), ContentEncoding::Identity);
        assert_eq!(ContentEncoding::from_header(None), ContentEncoding::Identity);
    }

    #[test]
    fn test_buffered_decompression() {
        assert_eq!(decompress(&gzip(PLAIN), ContentEncoding::Gzip).unwrap(), PLAIN);
        assert_eq!(decompress(&deflate(PLAIN), ContentEncoding::Deflate).unwrap(), PLAIN);
        assert_eq!(decompress(&brotli(PLAIN), ContentEncoding::Brotli).unwrap(), PLAIN);
        assert_eq!(decompress(PLAIN, ContentEncoding::Identity).unwrap(), PLAIN);
    }

    #[test]
    fn test_corrupt_body_is_an_error() {
        assert!(decompress(b"definitely not gzip", ContentEncoding::Gzip).is_err());
    }

    #[test]
    fn test_stream_decoder_byte_at_a_time() {
        for (encoding, compressed) in [
            (ContentEncoding::Gzip, gzip(PLAIN)),
            (ContentEncoding::Deflate, deflate(PLAIN)),
            (ContentEncoding::Brotli, brotli(PLAIN)),
            (ContentEncoding::Identity, PLAIN.to_vec()),
        ] {
            let mut decoder = StreamDecoder::new(encoding);
            let mut out = Vec::new();
            for byte in &compressed {
                decoder.push(std::slice::from_ref(byte), &mut out).unwrap();
            }
            decoder.finish(&mut out).unwrap();
            assert_eq!(out, PLAIN, "{encoding}");
        }
    }

    #[test]
    fn test_decode_text_utf8() {
        let decoded = decode_text("température 21°C".as_bytes());
        assert_eq!(decoded.text, "température 21°C");
        assert!(!decoded.binary);
    }

    #[test]
    fn test_decode_text_latin1_fallback() {
        let decoded = decode_text(&[b'c', b'a', b'f', 0xE9]);
        assert_eq!(decoded.text, "café");
        assert!(!decoded.binary);
    }

    #[test]
    fn test_decode_text_binary_placeholder() {
        let decoded = decode_text(&[0x00, 0xFF, 0x01, 0x80]);
        assert_eq!(decoded.text, "[BINARY DATA: 4 bytes]");
        assert!(decoded.binary);
    }

    #[test]
    fn test_decode_text_latin1_with_control_byte_is_binary() {
        // Plain Latin-1 would accept this; the stray BEL rules it out.
        let decoded = decode_text(&[b'c', b'a', b'f', 0xE9, 0x07]);
        assert!(decoded.binary);
        assert_eq!(decoded.text, "[BINARY DATA: 5 bytes]");

        let decoded = decode_text(&[b'c', 0xE9, b'\t', b'\r', b'\n']);
        assert!(!decoded.binary);
    }

    #[test]
    fn test_decode_text_empty() {
        assert_eq!(decode_text(&[]).text, "");
    }
}
