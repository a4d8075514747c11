use crate::codec::Frame;
use crate::error::{Result, RpcError};

/// Dynamically typed value passed between client and service.
pub type Value = serde_json::Value;

/// Keyword arguments: a string-keyed mapping of values.
pub type Kwargs = serde_json::Map<String, Value>;

/// Encodes argument tuples, keyword mappings and results to opaque byte
/// frames, and back.
///
/// Both sides of a conversation must use the same serializer; there is no
/// negotiation on the wire.
pub trait Serializer: Send + Sync {
    /// Encode positional and keyword arguments. The frames are appended to
    /// the request in order.
    fn serialize_args_kwargs(&self, args: &[Value], kwargs: &Kwargs) -> Result<Vec<Frame>>;

    /// Inverse of [`serialize_args_kwargs`](Self::serialize_args_kwargs).
    fn deserialize_args_kwargs(&self, frames: &[Frame]) -> Result<(Vec<Value>, Kwargs)>;

    /// Encode a single result value.
    fn serialize_result(&self, value: &Value) -> Result<Vec<Frame>>;

    /// Inverse of [`serialize_result`](Self::serialize_result).
    fn deserialize_result(&self, frames: &[Frame]) -> Result<Value>;
}

fn frame_count_error(expected: usize, got: usize) -> RpcError {
    RpcError::Decode(format!("expected {expected} payload frame(s), got {got}"))
}

/// JSON serializer: one frame for the argument array, one for the keyword
/// object, one for a result. Interoperable with any peer that can speak JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize_args_kwargs(&self, args: &[Value], kwargs: &Kwargs) -> Result<Vec<Frame>> {
        let args = serde_json::to_vec(args)
            .map_err(|e| RpcError::Decode(format!("args did not encode: {e}")))?;
        let kwargs = serde_json::to_vec(kwargs)
            .map_err(|e| RpcError::Decode(format!("kwargs did not encode: {e}")))?;
        Ok(vec![args, kwargs])
    }

    fn deserialize_args_kwargs(&self, frames: &[Frame]) -> Result<(Vec<Value>, Kwargs)> {
        if frames.len() != 2 {
            return Err(frame_count_error(2, frames.len()));
        }
        let args: Vec<Value> = serde_json::from_slice(&frames[0])
            .map_err(|e| RpcError::Decode(format!("args did not decode: {e}")))?;
        let kwargs: Kwargs = serde_json::from_slice(&frames[1])
            .map_err(|e| RpcError::Decode(format!("kwargs did not decode: {e}")))?;
        Ok((args, kwargs))
    }

    fn serialize_result(&self, value: &Value) -> Result<Vec<Frame>> {
        let result = serde_json::to_vec(value)
            .map_err(|e| RpcError::Decode(format!("result did not encode: {e}")))?;
        Ok(vec![result])
    }

    fn deserialize_result(&self, frames: &[Frame]) -> Result<Value> {
        if frames.len() != 1 {
            return Err(frame_count_error(1, frames.len()));
        }
        serde_json::from_slice(&frames[0])
            .map_err(|e| RpcError::Decode(format!("result did not decode: {e}")))
    }
}

/// CBOR serializer: the native binary format. Same frame shape as JSON but
/// denser on the wire; CBOR is self-describing, so dynamically typed values
/// decode without a schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborSerializer;

impl CborSerializer {
    fn encode<T: serde::Serialize>(value: &T, what: &str) -> Result<Frame> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf)
            .map_err(|e| RpcError::Decode(format!("{what} did not encode: {e}")))?;
        Ok(buf)
    }

    fn decode<T: serde::de::DeserializeOwned>(frame: &[u8], what: &str) -> Result<T> {
        ciborium::de::from_reader(frame)
            .map_err(|e| RpcError::Decode(format!("{what} did not decode: {e}")))
    }
}

impl Serializer for CborSerializer {
    fn serialize_args_kwargs(&self, args: &[Value], kwargs: &Kwargs) -> Result<Vec<Frame>> {
        Ok(vec![
            Self::encode(&args, "args")?,
            Self::encode(kwargs, "kwargs")?,
        ])
    }

    fn deserialize_args_kwargs(&self, frames: &[Frame]) -> Result<(Vec<Value>, Kwargs)> {
        if frames.len() != 2 {
            return Err(frame_count_error(2, frames.len()));
        }
        let args: Vec<Value> = Self::decode(&frames[0], "args")?;
        let kwargs: Kwargs = Self::decode(&frames[1], "kwargs")?;
        Ok((args, kwargs))
    }

    fn serialize_result(&self, value: &Value) -> Result<Vec<Frame>> {
        Ok(vec![Self::encode(value, "result")?])
    }

    fn deserialize_result(&self, frames: &[Frame]) -> Result<Value> {
        if frames.len() != 1 {
            return Err(frame_count_error(1, frames.len()));
        }
        Self::decode(&frames[0], "result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_kwargs() -> Kwargs {
        let mut kwargs = Kwargs::new();
        kwargs.insert("flag".into(), json!(true));
        kwargs.insert("depth".into(), json!([1, 2, {"k": null}]));
        kwargs
    }

    #[test]
    fn json_args_kwargs_round_trip() {
        let ser = JsonSerializer;
        let args = vec![json!("Hi there"), json!(42.5)];
        let kwargs = sample_kwargs();

        let frames = ser.serialize_args_kwargs(&args, &kwargs).unwrap();
        assert_eq!(frames.len(), 2);
        let (args2, kwargs2) = ser.deserialize_args_kwargs(&frames).unwrap();
        assert_eq!(args2, args);
        assert_eq!(kwargs2, kwargs);
    }

    #[test]
    fn cbor_result_round_trip() {
        let ser = CborSerializer;
        let value = json!({"nested": {"list": [1, "two", 3.0]}, "none": null});
        let frames = ser.serialize_result(&value).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(ser.deserialize_result(&frames).unwrap(), value);
    }

    #[test]
    fn wrong_frame_count_is_a_decode_error() {
        let ser = JsonSerializer;
        let err = ser.deserialize_args_kwargs(&[b"[]".to_vec()]).unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }

    #[test]
    fn garbage_frames_are_a_decode_error() {
        let ser = CborSerializer;
        let frames = vec![b"\xff\xff\xff".to_vec()];
        assert!(matches!(
            ser.deserialize_result(&frames),
            Err(RpcError::Decode(_))
        ));
    }
}
