//! Reply parsing: a blocking parser for the sync path and a
//! [`ValueCodec`] for the framed async path.
//!
//! Error replies are turned into [`RouterError`] values here, with
//! redirection replies (`MOVED`, `ASK`) and cluster-state replies
//! (`CLUSTERDOWN`, `TRYAGAIN`) classified by their leading token so the
//! routing layers only ever inspect an [`ErrorKind`].

use std::io::BufRead;
use std::str;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{make_reply_error, ErrorKind, RouterError, RouterResult, Value};

/// The reply parser for blocking connections.
pub struct Parser<T> {
    reader: T,
}

impl<T: BufRead> Parser<T> {
    /// Creates a parser that reads from the given stream.
    pub fn new(reader: T) -> Parser<T> {
        Parser { reader }
    }

    /// Parses a single reply.
    ///
    /// Server error replies are returned as `Err` with the kind derived from
    /// the error token; protocol violations surface as `CriticalFailure`.
    pub fn parse_value(&mut self) -> RouterResult<Value> {
        let line = self.read_line()?;
        if line.is_empty() {
            fail!((ErrorKind::CriticalFailure, "Empty reply line"));
        }
        let body = &line[1..];
        match line[0] {
            b'+' => {
                if body == b"OK" {
                    Ok(Value::Okay)
                } else {
                    Ok(Value::Status(str_content(body)?.to_string()))
                }
            }
            b'-' => Err(make_reply_error(str_content(body)?)),
            b':' => Ok(Value::Int(int_content(body)?)),
            b'$' => {
                let len = int_content(body)?;
                if len < 0 {
                    return Ok(Value::Nil);
                }
                let mut data = vec![0; len as usize];
                self.reader.read_exact(&mut data)?;
                let mut crlf = [0; 2];
                self.reader.read_exact(&mut crlf)?;
                if crlf != *b"\r\n" {
                    fail!((ErrorKind::CriticalFailure, "Bulk string not terminated by CRLF"));
                }
                Ok(Value::Data(data))
            }
            b'*' => {
                let len = int_content(body)?;
                if len < 0 {
                    return Ok(Value::Nil);
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(self.parse_value()?);
                }
                Ok(Value::Bulk(items))
            }
            byte => Err(RouterError::from((
                ErrorKind::CriticalFailure,
                "Invalid reply type byte",
                format!("{byte:#04x}"),
            ))),
        }
    }

    // Reads up to and including CRLF, returning the line without it.
    fn read_line(&mut self) -> RouterResult<Vec<u8>> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            fail!((ErrorKind::Disconnected, "Connection closed by peer"));
        }
        if !line.ends_with(b"\r\n") {
            fail!((ErrorKind::CriticalFailure, "Reply line not terminated by CRLF"));
        }
        line.truncate(line.len() - 2);
        Ok(line)
    }
}

fn str_content(bytes: &[u8]) -> RouterResult<&str> {
    str::from_utf8(bytes).map_err(|_| (ErrorKind::CriticalFailure, "Reply line is not utf-8").into())
}

fn int_content(bytes: &[u8]) -> RouterResult<i64> {
    str_content(bytes)?
        .parse()
        .map_err(|_| (ErrorKind::CriticalFailure, "Expected an integer in the reply").into())
}

/// Parses a single reply out of a byte slice.
pub fn parse_reply(bytes: &[u8]) -> RouterResult<Value> {
    Parser::new(bytes).parse_value()
}

/// Frame codec for asynchronous connections.
///
/// Decoded items are `RouterResult<Value>` so that server error replies flow
/// through the stream without tearing the connection down; only IO failures
/// surface as stream errors.
#[derive(Default)]
pub struct ValueCodec {
    _priv: (),
}

impl ValueCodec {
    // Length of the first complete reply in `buf`, or `None` if more bytes
    // are needed.
    fn frame_len(buf: &[u8]) -> RouterResult<Option<usize>> {
        reply_end(buf, 0)
    }
}

fn line_end(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| from + pos + 2)
}

fn reply_end(buf: &[u8], from: usize) -> RouterResult<Option<usize>> {
    let type_byte = match buf.get(from) {
        Some(byte) => *byte,
        None => return Ok(None),
    };
    let header_end = match line_end(buf, from + 1) {
        Some(end) => end,
        None => return Ok(None),
    };
    match type_byte {
        b'+' | b'-' | b':' => Ok(Some(header_end)),
        b'$' => {
            let len = header_int(&buf[from + 1..header_end - 2])?;
            if len < 0 {
                return Ok(Some(header_end));
            }
            let end = header_end + len as usize + 2;
            if buf.len() < end {
                return Ok(None);
            }
            Ok(Some(end))
        }
        b'*' => {
            let len = header_int(&buf[from + 1..header_end - 2])?;
            let mut at = header_end;
            for _ in 0..len.max(0) {
                match reply_end(buf, at)? {
                    Some(end) => at = end,
                    None => return Ok(None),
                }
            }
            Ok(Some(at))
        }
        byte => Err(RouterError::from((
            ErrorKind::CriticalFailure,
            "Invalid reply type byte",
            format!("{byte:#04x}"),
        ))),
    }
}

fn header_int(bytes: &[u8]) -> RouterResult<i64> {
    str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| (ErrorKind::CriticalFailure, "Malformed reply header").into())
}

impl Decoder for ValueCodec {
    type Item = RouterResult<Value>;
    type Error = RouterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match Self::frame_len(src) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(None),
            // Framing is lost; report the violation as an item so the command
            // observes `CriticalFailure`, and let the driver tear down.
            Err(err) => {
                src.clear();
                return Ok(Some(Err(err)));
            }
        };
        let frame = src.split_to(len);
        Ok(Some(Parser::new(&frame[..]).parse_value()))
    }
}

impl Encoder<Vec<u8>> for ValueCodec {
    type Error = RouterError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
