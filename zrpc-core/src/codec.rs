//! Multipart frame layouts.
//!
//! Every message is a list of opaque byte frames. The literal `|` frame
//! separates the route prefix (zero or more identity frames prepended by the
//! transport) from the body:
//!
//! ```text
//! REQUEST     : <route...>, "|", req_id, proc_name, <args_frames...>, <ignore_byte>
//! ACK         : <route...>, "|", req_id, "ACK",   service_id
//! OK          : <route...>, "|", req_id, "OK",    <result_frames...>
//! YIELD       : <route...>, "|", req_id, "YIELD", <result_frames...>
//! FAIL        : <route...>, "|", req_id, "FAIL",  <json_error>
//! YIELD_SEND  : <route...>, "|", req_id, "YIELD_SEND",  <arg_frames...>
//! YIELD_THROW : <route...>, "|", req_id, "YIELD_THROW", ename, evalue
//! YIELD_CLOSE : <route...>, "|", req_id, "YIELD_CLOSE"
//! ```
//!
//! Parsers are tolerant: a missing separator, a truncated body or an unknown
//! tag yields `None` and the receiver drops the message.

use crate::error::RemoteError;

/// One transport frame.
pub type Frame = Vec<u8>;

/// The single-byte frame separating the route prefix from the body.
pub const SEPARATOR: &[u8] = b"|";

/// Proc-name slot literal advancing a live generator.
pub const YIELD_SEND: &str = "YIELD_SEND";
/// Proc-name slot literal injecting an error into a live generator.
pub const YIELD_THROW: &str = "YIELD_THROW";
/// Proc-name slot literal closing a live generator.
pub const YIELD_CLOSE: &str = "YIELD_CLOSE";

const TAG_ACK: &[u8] = b"ACK";
const TAG_OK: &[u8] = b"OK";
const TAG_YIELD: &[u8] = b"YIELD";
const TAG_FAIL: &[u8] = b"FAIL";

/// Reply tags a service may send after the ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTag {
    Ok,
    Yield,
    Fail,
}

impl ReplyTag {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            ReplyTag::Ok => TAG_OK,
            ReplyTag::Yield => TAG_YIELD,
            ReplyTag::Fail => TAG_FAIL,
        }
    }
}

/// A parsed inbound request, before argument deserialization.
///
/// The route prefix is opaque: it is extracted here and prepended unchanged
/// to every reply. Payload frames stay raw so a decode failure can still be
/// answered with a FAIL addressed by `req_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub route: Vec<Frame>,
    pub req_id: Frame,
    pub op: RequestOp,
}

/// The operation carried by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOp {
    /// A plain procedure call.
    Call {
        name: String,
        payload: Vec<Frame>,
        ignore: bool,
    },
    /// Advance a live generator with a sent value.
    StreamSend { payload: Vec<Frame> },
    /// Inject an error into a live generator.
    StreamThrow { ename: String, evalue: String },
    /// Close a live generator.
    StreamClose,
}

/// A parsed inbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub req_id: Frame,
    pub body: ReplyBody,
}

/// The body of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Ack,
    Ok(Vec<Frame>),
    Yield(Vec<Frame>),
    Fail(RemoteError),
}

/// Commands an open client stream can push to its generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    Send(Vec<Frame>),
    Throw(String, String),
    Close,
}

/// Build a request as sent by a DEALER socket (no route prefix; the
/// transport supplies identities along the way).
pub fn build_request(req_id: &[u8], proc_name: &str, payload: Vec<Frame>, ignore: bool) -> Vec<Frame> {
    let mut msg = Vec::with_capacity(payload.len() + 4);
    msg.push(SEPARATOR.to_vec());
    msg.push(req_id.to_vec());
    msg.push(proc_name.as_bytes().to_vec());
    msg.extend(payload);
    msg.push(vec![u8::from(ignore)]);
    msg
}

/// Build a stream command reusing the req_id of the originating request.
/// Stream commands carry no ignore byte.
pub fn build_stream_command(req_id: &[u8], command: StreamCommand) -> Vec<Frame> {
    let mut msg = vec![SEPARATOR.to_vec(), req_id.to_vec()];
    match command {
        StreamCommand::Send(payload) => {
            msg.push(YIELD_SEND.as_bytes().to_vec());
            msg.extend(payload);
        }
        StreamCommand::Throw(ename, evalue) => {
            msg.push(YIELD_THROW.as_bytes().to_vec());
            msg.push(ename.into_bytes());
            msg.push(evalue.into_bytes());
        }
        StreamCommand::Close => {
            msg.push(YIELD_CLOSE.as_bytes().to_vec());
        }
    }
    msg
}

/// Build the immediate receipt acknowledgement for a request.
pub fn build_ack(route: &[Frame], req_id: &[u8], service_id: &[u8]) -> Vec<Frame> {
    let mut msg = Vec::with_capacity(route.len() + 4);
    msg.extend(route.iter().cloned());
    msg.push(SEPARATOR.to_vec());
    msg.push(req_id.to_vec());
    msg.push(TAG_ACK.to_vec());
    msg.push(service_id.to_vec());
    msg
}

/// Build an OK, YIELD or FAIL reply addressed back along `route`.
pub fn build_reply(route: &[Frame], req_id: &[u8], tag: ReplyTag, payload: Vec<Frame>) -> Vec<Frame> {
    let mut msg = Vec::with_capacity(route.len() + payload.len() + 3);
    msg.extend(route.iter().cloned());
    msg.push(SEPARATOR.to_vec());
    msg.push(req_id.to_vec());
    msg.push(tag.as_bytes().to_vec());
    msg.extend(payload);
    msg
}

fn separator_index(frames: &[Frame]) -> Option<usize> {
    frames.iter().position(|f| f == SEPARATOR)
}

/// Parse an inbound request. Returns `None` for anything malformed; this
/// function never fails with an error.
pub fn parse_request(frames: &[Frame]) -> Option<RequestEnvelope> {
    let boundary = separator_index(frames)?;
    // at minimum: separator, req_id, proc_name
    if frames.len() < boundary + 3 {
        return None;
    }

    let route = frames[..boundary].to_vec();
    let req_id = frames[boundary + 1].clone();
    let name = String::from_utf8(frames[boundary + 2].clone()).ok()?;
    let rest = &frames[boundary + 3..];

    let op = match name.as_str() {
        YIELD_SEND => RequestOp::StreamSend {
            payload: rest.to_vec(),
        },
        YIELD_THROW => {
            if rest.len() < 2 {
                return None;
            }
            RequestOp::StreamThrow {
                ename: String::from_utf8(rest[0].clone()).ok()?,
                evalue: String::from_utf8(rest[1].clone()).ok()?,
            }
        }
        YIELD_CLOSE => RequestOp::StreamClose,
        _ => {
            // a plain call additionally carries the trailing ignore byte
            let (ignore_frame, payload) = rest.split_last()?;
            RequestOp::Call {
                name,
                payload: payload.to_vec(),
                ignore: ignore_frame.first().is_some_and(|b| *b != 0),
            }
        }
    };

    Some(RequestEnvelope { route, req_id, op })
}

/// Parse an inbound reply. Returns `None` for anything malformed or for an
/// unknown tag; the caller drops such messages and continues.
pub fn parse_reply(frames: &[Frame]) -> Option<ReplyEnvelope> {
    let boundary = separator_index(frames)?;
    if frames.len() < boundary + 3 {
        return None;
    }

    let req_id = frames[boundary + 1].clone();
    let tag = frames[boundary + 2].as_slice();
    let payload = &frames[boundary + 3..];

    let body = match tag {
        TAG_ACK => ReplyBody::Ack,
        TAG_OK => ReplyBody::Ok(payload.to_vec()),
        TAG_YIELD => ReplyBody::Yield(payload.to_vec()),
        TAG_FAIL => {
            let body = payload.first()?;
            let error: RemoteError = serde_json::from_slice(body).ok()?;
            ReplyBody::Fail(error)
        }
        _ => return None,
    };

    Some(ReplyEnvelope { req_id, body })
}
