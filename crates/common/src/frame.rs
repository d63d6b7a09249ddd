//! Length-prefixed binary frame codec.
//!
//! Every steady-state message is a single binary frame:
//!
//! ```text
//! u32 method | u32 argc | argc x (u32 len | bytes)
//! ```
//!
//! All integers are little-endian. Arguments are opaque byte strings; the
//! typed accessors decode the conventions used by the higher layers (UTF-8
//! text, 8-byte little-endian u64).

use thiserror::Error;

/// Upper bound on arguments per frame.
pub const MAX_ARGS: u32 = 64;
/// Upper bound on a single argument's length.
pub const MAX_ARG_LEN: u32 = 16 * 1024 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,

    #[error("trailing bytes after last argument")]
    TrailingBytes,

    #[error("argument count {0} exceeds limit")]
    TooManyArgs(u32),

    #[error("argument length {0} exceeds limit")]
    ArgTooLong(u32),

    #[error("missing argument {0}")]
    MissingArg(usize),

    #[error("argument {0} is not valid UTF-8")]
    BadUtf8(usize),

    #[error("argument {0} is not a u64")]
    BadU64(usize),
}

/// A decoded wire frame: a method tag and an ordered argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub method: u32,
    pub args: Vec<Vec<u8>>,
}

impl Frame {
    pub fn new(method: u32) -> Self {
        Frame {
            method,
            args: Vec::new(),
        }
    }

    pub fn push_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.args.push(bytes.into());
        self
    }

    pub fn push_str(self, s: &str) -> Self {
        self.push_bytes(s.as_bytes())
    }

    pub fn push_u64(self, v: u64) -> Self {
        self.push_bytes(v.to_le_bytes())
    }

    pub fn arg(&self, index: usize) -> Result<&[u8], FrameError> {
        self.args
            .get(index)
            .map(Vec::as_slice)
            .ok_or(FrameError::MissingArg(index))
    }

    pub fn arg_str(&self, index: usize) -> Result<&str, FrameError> {
        std::str::from_utf8(self.arg(index)?).map_err(|_| FrameError::BadUtf8(index))
    }

    pub fn arg_u64(&self, index: usize) -> Result<u64, FrameError> {
        let bytes: [u8; 8] = self
            .arg(index)?
            .try_into()
            .map_err(|_| FrameError::BadU64(index))?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload: usize = self.args.iter().map(|a| 4 + a.len()).sum();
        let mut out = Vec::with_capacity(8 + payload);
        out.extend_from_slice(&self.method.to_le_bytes());
        out.extend_from_slice(&(self.args.len() as u32).to_le_bytes());
        for arg in &self.args {
            out.extend_from_slice(&(arg.len() as u32).to_le_bytes());
            out.extend_from_slice(arg);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let method = cursor.read_u32()?;
        let argc = cursor.read_u32()?;
        if argc > MAX_ARGS {
            return Err(FrameError::TooManyArgs(argc));
        }
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            let len = cursor.read_u32()?;
            if len > MAX_ARG_LEN {
                return Err(FrameError::ArgTooLong(len));
            }
            args.push(cursor.read_bytes(len as usize)?.to_vec());
        }
        if cursor.pos != bytes.len() {
            return Err(FrameError::TrailingBytes);
        }
        Ok(Frame { method, args })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        let end = self.pos.checked_add(len).ok_or(FrameError::Truncated)?;
        if end > self.bytes.len() {
            return Err(FrameError::Truncated);
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u32(&mut self) -> Result<u32, FrameError> {
        let bytes: [u8; 4] = self.read_bytes(4)?.try_into().expect("read_bytes length");
        Ok(u32::from_le_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method;

    #[test]
    fn round_trip() {
        let frame = Frame::new(method::STATE_SET)
            .push_str("worldApps")
            .push_str("x1")
            .push_str("position")
            .push_u64(7)
            .push_str("[0,1,0]");

        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.arg_str(0).unwrap(), "worldApps");
        assert_eq!(decoded.arg_u64(3).unwrap(), 7);
    }

    #[test]
    fn empty_args_round_trip() {
        let frame = Frame::new(method::LEAVE);
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let encoded = Frame::new(method::CHAT).push_str("hello").encode();
        for cut in 0..encoded.len() {
            assert!(
                Frame::decode(&encoded[..cut]).is_err(),
                "prefix of {cut} bytes decoded"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = Frame::new(method::CHAT).push_str("hello").encode();
        encoded.push(0);
        assert_eq!(Frame::decode(&encoded), Err(FrameError::TrailingBytes));
    }

    #[test]
    fn oversized_arg_count_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&method::CHAT.to_le_bytes());
        bytes.extend_from_slice(&(MAX_ARGS + 1).to_le_bytes());
        assert_eq!(Frame::decode(&bytes), Err(FrameError::TooManyArgs(MAX_ARGS + 1)));
    }

    #[test]
    fn missing_and_mistyped_args_error() {
        let frame = Frame::new(method::LOCK_REQUEST).push_str("p1");
        assert_eq!(frame.arg_str(1), Err(FrameError::MissingArg(1)));
        assert_eq!(frame.arg_u64(0), Err(FrameError::BadU64(0)));

        let frame = Frame::new(method::CHAT).push_bytes(vec![0xff, 0xfe]);
        assert_eq!(frame.arg_str(0), Err(FrameError::BadUtf8(0)));
    }
}
