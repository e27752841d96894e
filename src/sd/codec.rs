//! Session protocol framing.
//!
//! Every field travels on its own `\n`-terminated line. Document content is
//! the exception: it follows its byte length line verbatim, with no
//! terminator, so it may itself contain newlines.
//!
//! ```text
//! requests                           responses
//! open\n                             accepted\n<id>\n
//! resume\n<id>\n                     rejected\n<reason>\n
//! close\n<id>\n                      closed\n<id>\n
//! get\n<name>\n                      success\n<name>\n<len>\n<content>
//! post\n<name>\n<len>\n<content>     success\n
//!                                    error\n<message>\n
//! ```
//!
//! [`SdServerCodec`] decodes requests and encodes responses;
//! [`SdClientCodec`] does the reverse. Both return `Ok(None)` until a whole
//! frame is buffered, so reads may be split at any byte.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::VecDeque;
use tokio_util::codec::{Decoder, Encoder};

/// Longest accepted line, terminator excluded.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;
/// Largest accepted document.
pub const MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Open,
    Resume(u64),
    Close(u64),
    Get(String),
    Post { name: String, content: String },
    /// Anything that is not a well-formed request; carries the offending line.
    Invalid(String),
}

/// A server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Accepted(u64),
    Rejected(String),
    Closed(u64),
    /// Reply to a successful `get`.
    Document { name: String, content: String },
    /// Reply to a successful `post`.
    Success,
    Error(String),
}

/// Read position over a buffer that may not hold a full frame yet.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Next line without its terminator, or `None` if not fully buffered.
    fn line(&mut self) -> Result<Option<&'a [u8]>, ProtocolError> {
        let rest = &self.buf[self.pos..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(end) => {
                let line = &rest[..end];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                if line.len() > MAX_LINE_LENGTH {
                    return Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH));
                }
                self.pos += end + 1;
                Ok(Some(line))
            }
            None if rest.len() > MAX_LINE_LENGTH + 1 => Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH)),
            None => Ok(None),
        }
    }

    /// Next `len` raw bytes, or `None` if not fully buffered.
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        if rest.len() < len {
            return None;
        }
        self.pos += len;
        Some(&rest[..len])
    }
}

/// Return `Ok(None)` from the enclosing decoder until more bytes arrive.
macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

fn utf8(bytes: &[u8]) -> Option<String> {
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

fn parse_number<T: std::str::FromStr>(bytes: &[u8]) -> Option<T> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn check_content_length(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_CONTENT_LENGTH {
        return Err(ProtocolError::TooLarge {
            size: len,
            max: MAX_CONTENT_LENGTH,
        });
    }
    Ok(())
}

/// Fields are line-delimited, so text sent in a field must not span lines.
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

fn finish_at_eof<T>(
    decoded: Option<T>,
    buf: &BytesMut,
) -> Result<Option<T>, ProtocolError> {
    match decoded {
        Some(frame) => Ok(Some(frame)),
        None if buf.is_empty() => Ok(None),
        None => Err(ProtocolError::TrailingBytes(buf.len())),
    }
}

/// Server side: decodes [`Request`]s, encodes [`Response`]s.
#[derive(Debug, Default)]
pub struct SdServerCodec;

impl SdServerCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for SdServerCodec {
    type Item = Request;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        let mut cur = Cursor::new(&buf[..]);
        let command = need!(cur.line()?);

        let request = match command {
            b"open" => Request::Open,
            b"resume" | b"close" => {
                let id_line = need!(cur.line()?);
                match parse_number::<u64>(id_line) {
                    Some(id) if command == b"resume" => Request::Resume(id),
                    Some(id) => Request::Close(id),
                    None => Request::Invalid(format!("{} {}", lossy(command), lossy(id_line))),
                }
            }
            b"get" => {
                let name = need!(cur.line()?);
                match utf8(name) {
                    Some(name) => Request::Get(name),
                    None => Request::Invalid(format!("get {}", lossy(name))),
                }
            }
            b"post" => {
                let name = need!(cur.line()?);
                let len_line = need!(cur.line()?);
                match parse_number::<usize>(len_line) {
                    Some(len) => {
                        check_content_length(len)?;
                        let content = need!(cur.take(len));
                        match (utf8(name), utf8(content)) {
                            (Some(name), Some(content)) => Request::Post { name, content },
                            _ => Request::Invalid(format!("post {}", lossy(name))),
                        }
                    }
                    None => Request::Invalid(format!("post {} {}", lossy(name), lossy(len_line))),
                }
            }
            other => Request::Invalid(lossy(other)),
        };

        let consumed = cur.pos;
        buf.advance(consumed);
        Ok(Some(request))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        let decoded = self.decode(buf)?;
        finish_at_eof(decoded, buf)
    }
}

impl Encoder<Response> for SdServerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let header = match &item {
            Response::Accepted(id) => format!("accepted\n{id}\n"),
            Response::Rejected(reason) => format!("rejected\n{}\n", single_line(reason)),
            Response::Closed(id) => format!("closed\n{id}\n"),
            Response::Document { name, content } => {
                format!("success\n{}\n{}\n", single_line(name), content.len())
            }
            Response::Success => "success\n".to_string(),
            Response::Error(message) => format!("error\n{}\n", single_line(message)),
        };
        dst.reserve(header.len());
        dst.put_slice(header.as_bytes());
        if let Response::Document { content, .. } = &item {
            dst.reserve(content.len());
            dst.put_slice(content.as_bytes());
        }
        Ok(())
    }
}

/// What the next response should be read as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// `success` carries a document.
    Document,
    /// `success` stands alone.
    Plain,
}

/// Client side: encodes [`Request`]s, decodes [`Response`]s.
///
/// A `success` reply to `get` carries a document while one to `post` does
/// not, so the codec remembers what each request sent expects back.
#[derive(Debug, Default)]
pub struct SdClientCodec {
    pending: VecDeque<Expect>,
}

impl SdClientCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<Request> for SdClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let check_name = |name: &str| {
            if name.contains('\n') {
                Err(ProtocolError::Malformed(format!(
                    "document name {name:?} contains a newline"
                )))
            } else {
                Ok(())
            }
        };

        let (head, content, expect) = match &item {
            Request::Open => ("open\n".to_string(), None, Expect::Plain),
            Request::Resume(id) => (format!("resume\n{id}\n"), None, Expect::Plain),
            Request::Close(id) => (format!("close\n{id}\n"), None, Expect::Plain),
            Request::Get(name) => {
                check_name(name)?;
                (format!("get\n{name}\n"), None, Expect::Document)
            }
            Request::Post { name, content } => {
                check_name(name)?;
                check_content_length(content.len())?;
                (
                    format!("post\n{name}\n{}\n", content.len()),
                    Some(content),
                    Expect::Plain,
                )
            }
            Request::Invalid(line) => (format!("{}\n", single_line(line)), None, Expect::Plain),
        };

        dst.reserve(head.len() + content.map_or(0, |c| c.len()));
        dst.put_slice(head.as_bytes());
        if let Some(content) = content {
            dst.put_slice(content.as_bytes());
        }
        self.pending.push_back(expect);
        Ok(())
    }
}

impl Decoder for SdClientCodec {
    type Item = Response;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Response>, ProtocolError> {
        let expect = self.pending.front().copied().unwrap_or(Expect::Plain);
        let mut cur = Cursor::new(&buf[..]);
        let status = need!(cur.line()?);

        let response = match status {
            b"accepted" | b"closed" => {
                let id_line = need!(cur.line()?);
                let id = parse_number::<u64>(id_line).ok_or_else(|| ProtocolError::InvalidNumber {
                    field: "session id",
                    value: lossy(id_line),
                })?;
                if status == b"accepted" {
                    Response::Accepted(id)
                } else {
                    Response::Closed(id)
                }
            }
            b"rejected" => Response::Rejected(lossy(need!(cur.line()?))),
            b"error" => Response::Error(lossy(need!(cur.line()?))),
            b"success" if expect == Expect::Document => {
                let name = lossy(need!(cur.line()?));
                let len_line = need!(cur.line()?);
                let len = parse_number::<usize>(len_line).ok_or_else(|| {
                    ProtocolError::InvalidNumber {
                        field: "content length",
                        value: lossy(len_line),
                    }
                })?;
                check_content_length(len)?;
                let content = need!(cur.take(len));
                let content = utf8(content).ok_or(ProtocolError::InvalidUtf8)?;
                Response::Document { name, content }
            }
            b"success" => Response::Success,
            other => return Err(ProtocolError::UnexpectedResponse(lossy(other))),
        };

        let consumed = cur.pos;
        buf.advance(consumed);
        self.pending.pop_front();
        Ok(Some(response))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Response>, ProtocolError> {
        let decoded = self.decode(buf)?;
        finish_at_eof(decoded, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut SdServerCodec, bytes: &[u8]) -> Vec<Request> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(request) = codec.decode(&mut buf).expect("decodes") {
            out.push(request);
        }
        assert!(buf.is_empty(), "left over: {buf:?}");
        out
    }

    fn encode_response(response: Response) -> Vec<u8> {
        let mut buf = BytesMut::new();
        SdServerCodec::new()
            .encode(response, &mut buf)
            .expect("encodes");
        buf.to_vec()
    }

    #[test]
    fn test_decode_every_request() {
        let mut codec = SdServerCodec::new();
        let requests = decode_all(
            &mut codec,
            b"open\nresume\n12\nclose\n12\nget\na.txt\npost\na.txt\n5\nhello",
        );
        assert_eq!(
            requests,
            vec![
                Request::Open,
                Request::Resume(12),
                Request::Close(12),
                Request::Get("a.txt".to_string()),
                Request::Post {
                    name: "a.txt".to_string(),
                    content: "hello".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_post_content_may_contain_newlines() {
        let mut codec = SdServerCodec::new();
        let requests = decode_all(&mut codec, b"post\nnotes\n12\nline1\nline2\nopen\n");
        assert_eq!(
            requests,
            vec![
                Request::Post {
                    name: "notes".to_string(),
                    content: "line1\nline2\n".to_string()
                },
                Request::Open,
            ]
        );
    }

    #[test]
    fn test_empty_post() {
        let mut codec = SdServerCodec::new();
        let requests = decode_all(&mut codec, b"post\nempty\n0\n");
        assert_eq!(
            requests,
            vec![Request::Post {
                name: "empty".to_string(),
                content: String::new()
            }]
        );
    }

    #[test]
    fn test_split_frames_wait_for_more_bytes() {
        let mut codec = SdServerCodec::new();
        let whole: &[u8] = b"post\na.txt\n11\nhello\nworld";
        let mut buf = BytesMut::new();
        for (i, byte) in whole.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = codec.decode(&mut buf).expect("decodes");
            if i + 1 < whole.len() {
                assert_eq!(decoded, None, "frame completed early at byte {i}");
            } else {
                assert_eq!(
                    decoded,
                    Some(Request::Post {
                        name: "a.txt".to_string(),
                        content: "hello\nworld".to_string()
                    })
                );
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_crlf_lines_accepted() {
        let mut codec = SdServerCodec::new();
        let requests = decode_all(&mut codec, b"open\r\nresume\r\n3\r\n");
        assert_eq!(requests, vec![Request::Open, Request::Resume(3)]);
    }

    #[test]
    fn test_unrecognized_and_unparseable_are_invalid() {
        let mut codec = SdServerCodec::new();
        let requests = decode_all(
            &mut codec,
            b"delete\nresume\nabc\nclose\n-1\npost\nx\nlots\n\n",
        );
        assert_eq!(
            requests,
            vec![
                Request::Invalid("delete".to_string()),
                Request::Invalid("resume abc".to_string()),
                Request::Invalid("close -1".to_string()),
                Request::Invalid("post x lots".to_string()),
                Request::Invalid(String::new()),
            ]
        );
    }

    #[test]
    fn test_invalid_utf8_content_is_invalid() {
        let mut codec = SdServerCodec::new();
        let requests = decode_all(&mut codec, b"post\nbin\n2\n\xff\xfe");
        assert_eq!(requests, vec![Request::Invalid("post bin".to_string())]);
    }

    #[test]
    fn test_oversized_line_is_an_error() {
        let mut codec = SdServerCodec::new();
        let mut buf = BytesMut::from(&vec![b'a'; MAX_LINE_LENGTH + 10][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::LineTooLong(_))
        ));
    }

    #[test]
    fn test_oversized_content_is_an_error() {
        let mut codec = SdServerCodec::new();
        let header = format!("post\nbig\n{}\n", MAX_CONTENT_LENGTH + 1);
        let mut buf = BytesMut::from(header.as_bytes());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_at_eof() {
        let mut codec = SdServerCodec::new();
        let mut buf = BytesMut::from(&b"open\nget\n"[..]);
        assert_eq!(codec.decode_eof(&mut buf).expect("frame"), Some(Request::Open));
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(ProtocolError::TrailingBytes(4))
        ));

        let mut empty = BytesMut::new();
        assert_eq!(codec.decode_eof(&mut empty).expect("clean eof"), None);
    }

    #[test]
    fn test_encode_responses() {
        assert_eq!(encode_response(Response::Accepted(1)), b"accepted\n1\n");
        assert_eq!(
            encode_response(Response::Rejected("Unable to resume session".to_string())),
            b"rejected\nUnable to resume session\n"
        );
        assert_eq!(encode_response(Response::Closed(1)), b"closed\n1\n");
        assert_eq!(
            encode_response(Response::Document {
                name: "a.txt".to_string(),
                content: "hello".to_string()
            }),
            b"success\na.txt\n5\nhello"
        );
        assert_eq!(encode_response(Response::Success), b"success\n");
        assert_eq!(
            encode_response(Response::Error("bad\nthing".to_string())),
            b"error\nbad thing\n"
        );
    }

    #[test]
    fn test_content_length_counts_bytes() {
        let encoded = encode_response(Response::Document {
            name: "u".to_string(),
            content: "héllo".to_string(),
        });
        assert_eq!(encoded, "success\nu\n6\nhéllo".as_bytes());
    }

    #[test]
    fn test_client_reads_get_and_post_success_differently() {
        let mut client = SdClientCodec::new();
        let mut out = BytesMut::new();
        client
            .encode(
                Request::Post {
                    name: "a.txt".to_string(),
                    content: "hi\n".to_string(),
                },
                &mut out,
            )
            .expect("encode post");
        client
            .encode(Request::Get("a.txt".to_string()), &mut out)
            .expect("encode get");
        assert_eq!(&out[..], b"post\na.txt\n3\nhi\nget\na.txt\n");

        let mut buf = BytesMut::from(&b"success\nsuccess\na.txt\n3\nhi\n"[..]);
        assert_eq!(client.decode(&mut buf).expect("post reply"), Some(Response::Success));
        assert_eq!(
            client.decode(&mut buf).expect("get reply"),
            Some(Response::Document {
                name: "a.txt".to_string(),
                content: "hi\n".to_string()
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_client_error_reply_to_get() {
        let mut client = SdClientCodec::new();
        let mut out = BytesMut::new();
        client
            .encode(Request::Get("missing".to_string()), &mut out)
            .expect("encode");
        let mut buf = BytesMut::from(&b"error\nNo session open\n"[..]);
        assert_eq!(
            client.decode(&mut buf).expect("decodes"),
            Some(Response::Error("No session open".to_string()))
        );
    }

    #[test]
    fn test_client_rejects_unknown_reply() {
        let mut client = SdClientCodec::new();
        let mut buf = BytesMut::from(&b"maybe\n"[..]);
        assert!(matches!(
            client.decode(&mut buf),
            Err(ProtocolError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_client_refuses_multiline_document_name() {
        let mut client = SdClientCodec::new();
        let mut out = BytesMut::new();
        assert!(matches!(
            client.encode(Request::Get("a\nb".to_string()), &mut out),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(out.is_empty());
    }
}
