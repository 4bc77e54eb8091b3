use std::fmt;
use std::io::{self, BufRead, Read};

pub const MAX_PAYLOAD_SIZE_BYTES: usize = 16 * 1024 * 1024;
pub const MAX_LINE_SIZE_BYTES: usize = 64 * 1024;
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Simple(String),
    Bulk(Option<Vec<u8>>),
    Integer(i64),
    Error(String),
}

#[derive(Debug)]
pub enum CodecError {
    Io(io::Error),
    ConnectionClosed,
    EmptyVerb,
    LineTerminatorInCommand { part: String },
    WhitespaceInArgument { argument: String },
    MissingLineTerminator,
    LineTooLong { limit: usize },
    UnknownMarker { marker: u8 },
    InvalidLength { raw: String },
    InvalidInteger { raw: String },
    PayloadTooLarge { size: usize, limit: usize },
    InvalidUtf8,
    UnexpectedResponse { expected: &'static str, actual: String },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "wire I/O error: {source}"),
            Self::ConnectionClosed => write!(f, "connection closed by broker"),
            Self::EmptyVerb => write!(f, "command verb must not be empty"),
            Self::LineTerminatorInCommand { part } => {
                write!(f, "command part {part:?} contains a line terminator")
            }
            Self::WhitespaceInArgument { argument } => {
                write!(f, "command argument {argument:?} contains whitespace")
            }
            Self::MissingLineTerminator => write!(f, "response line is not CRLF terminated"),
            Self::LineTooLong { limit } => {
                write!(f, "response line exceeds {limit} bytes")
            }
            Self::UnknownMarker { marker } => {
                write!(f, "unknown response marker byte 0x{marker:02x}")
            }
            Self::InvalidLength { raw } => write!(f, "invalid bulk length '{raw}'"),
            Self::InvalidInteger { raw } => write!(f, "invalid integer response '{raw}'"),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::InvalidUtf8 => write!(f, "response line is not valid UTF-8"),
            Self::UnexpectedResponse { expected, actual } => {
                write!(f, "expected {expected} response, got {actual}")
            }
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(source) => Some(source),
            _ => None,
        }
    }
}

/// Encodes `VERB arg1 arg2 [payload]\r\n`.
///
/// The payload is appended verbatim after a single space; it must already be
/// serialized without raw line terminators (compact JSON escapes them).
pub fn encode_command(
    verb: &str,
    args: &[&str],
    payload: Option<&[u8]>,
) -> Result<Vec<u8>, CodecError> {
    if verb.is_empty() {
        return Err(CodecError::EmptyVerb);
    }
    ensure_single_line(verb.as_bytes(), verb)?;

    let payload_len = payload.map_or(0, <[u8]>::len);
    if payload_len > MAX_PAYLOAD_SIZE_BYTES {
        return Err(CodecError::PayloadTooLarge {
            size: payload_len,
            limit: MAX_PAYLOAD_SIZE_BYTES,
        });
    }

    let mut frame = Vec::with_capacity(verb.len() + payload_len + 16);
    frame.extend_from_slice(verb.as_bytes());

    for arg in args {
        ensure_single_line(arg.as_bytes(), arg)?;
        if arg.is_empty() || arg.chars().any(char::is_whitespace) {
            return Err(CodecError::WhitespaceInArgument {
                argument: (*arg).to_owned(),
            });
        }
        frame.push(b' ');
        frame.extend_from_slice(arg.as_bytes());
    }

    if let Some(payload) = payload {
        ensure_single_line(payload, "payload")?;
        frame.push(b' ');
        frame.extend_from_slice(payload);
    }

    frame.extend_from_slice(LINE_TERMINATOR);
    Ok(frame)
}

pub fn read_response<R: BufRead>(reader: &mut R) -> Result<Response, CodecError> {
    let line = read_line(reader)?;
    let Some((&marker, rest)) = line.split_first() else {
        return Err(CodecError::UnknownMarker { marker: b'\r' });
    };
    let text = std::str::from_utf8(rest).map_err(|_| CodecError::InvalidUtf8)?;

    match marker {
        b'+' => Ok(Response::Simple(text.to_owned())),
        b'-' => Ok(Response::Error(text.to_owned())),
        b':' => text
            .parse::<i64>()
            .map(Response::Integer)
            .map_err(|_| CodecError::InvalidInteger {
                raw: text.to_owned(),
            }),
        b'$' => read_bulk(reader, text),
        other => Err(CodecError::UnknownMarker { marker: other }),
    }
}

fn read_bulk<R: BufRead>(reader: &mut R, raw_len: &str) -> Result<Response, CodecError> {
    let declared = raw_len
        .parse::<i64>()
        .map_err(|_| CodecError::InvalidLength {
            raw: raw_len.to_owned(),
        })?;
    if declared == -1 {
        return Ok(Response::Bulk(None));
    }
    let size = usize::try_from(declared).map_err(|_| CodecError::InvalidLength {
        raw: raw_len.to_owned(),
    })?;
    if size > MAX_PAYLOAD_SIZE_BYTES {
        return Err(CodecError::PayloadTooLarge {
            size,
            limit: MAX_PAYLOAD_SIZE_BYTES,
        });
    }

    let mut payload = vec![0_u8; size + LINE_TERMINATOR.len()];
    reader.read_exact(&mut payload).map_err(map_read_error)?;
    if !payload.ends_with(LINE_TERMINATOR) {
        return Err(CodecError::MissingLineTerminator);
    }
    payload.truncate(size);

    Ok(Response::Bulk(Some(payload)))
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let mut line = Vec::new();
    let limit = (MAX_LINE_SIZE_BYTES + LINE_TERMINATOR.len()) as u64;
    let read = reader
        .by_ref()
        .take(limit)
        .read_until(b'\n', &mut line)
        .map_err(CodecError::Io)?;

    if read == 0 {
        return Err(CodecError::ConnectionClosed);
    }
    if !line.ends_with(b"\n") {
        if read as u64 >= limit {
            return Err(CodecError::LineTooLong {
                limit: MAX_LINE_SIZE_BYTES,
            });
        }
        return Err(CodecError::ConnectionClosed);
    }
    if !line.ends_with(LINE_TERMINATOR) {
        return Err(CodecError::MissingLineTerminator);
    }

    line.truncate(line.len() - LINE_TERMINATOR.len());
    Ok(line)
}

fn map_read_error(error: io::Error) -> CodecError {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        CodecError::ConnectionClosed
    } else {
        CodecError::Io(error)
    }
}

fn ensure_single_line(bytes: &[u8], part: &str) -> Result<(), CodecError> {
    if bytes.iter().any(|byte| *byte == b'\r' || *byte == b'\n') {
        return Err(CodecError::LineTerminatorInCommand {
            part: part.to_owned(),
        });
    }
    Ok(())
}
