//! The line oriented SASL handshake that precedes binary framing.
//!
//! Only the `EXTERNAL` mechanism is spoken: the client proves its identity
//! with the credentials of the unix socket and announces its uid.

use std::io::{Read, Write};

use tracing::debug;

use crate::error::AuthError;
use crate::Result;

/// Default upper bound for a single server response line.
pub const DEFAULT_MAX_AUTH_LINE: usize = 16 * 1024;

/// The outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Server guid from the `OK` line
    pub guid: String,
    /// Bytes received after the `OK` line, the start of the binary stream
    pub leftover: Vec<u8>,
}

/// Accumulates reads until a `\r\n` terminated line is complete.
struct LineReader {
    buf: Vec<u8>,
    max_line: usize,
}

impl LineReader {
    fn new(max_line: usize) -> Self {
        LineReader {
            buf: Vec::new(),
            max_line,
        }
    }

    fn read_line<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<String> {
        let mut chunk = [0u8; 256];
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                if pos > self.max_line {
                    return Err(AuthError::LineTooLong(self.max_line).into());
                }
                let line: Vec<u8> = self.buf.drain(..pos + 2).take(pos).collect();
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.buf.len() > self.max_line {
                return Err(AuthError::LineTooLong(self.max_line).into());
            }
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                return Err(AuthError::Eof.into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// The `AUTH EXTERNAL` command for `uid`: the decimal uid, hex encoded.
pub fn auth_external_line(uid: u32) -> String {
    let hex: String = uid
        .to_string()
        .bytes()
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("AUTH EXTERNAL {}\r\n", hex)
}

fn parse_response(line: &str) -> std::result::Result<String, AuthError> {
    if let Some(guid) = line.strip_prefix("OK ") {
        let guid = guid.trim();
        if !guid.is_empty() && guid.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(guid.into());
        }
    }
    if let Some(rest) = line.strip_prefix("REJECTED") {
        return Err(AuthError::Rejected(rest.trim().into()));
    }
    Err(AuthError::UnexpectedResponse(line.into()))
}

/// Run the client side of the handshake for the current user.
///
/// On success `BEGIN` has been sent and the stream carries binary messages.
/// On any failure `BEGIN` is never sent.
pub fn authenticate<R, W>(
    reader: &mut R,
    writer: &mut W,
    expected_guid: Option<&str>,
    max_line: usize,
) -> Result<Handshake>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    authenticate_as(uid, reader, writer, expected_guid, max_line)
}

pub(crate) fn authenticate_as<R, W>(
    uid: u32,
    reader: &mut R,
    writer: &mut W,
    expected_guid: Option<&str>,
    max_line: usize,
) -> Result<Handshake>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    writer.write_all(b"\0")?;
    writer.write_all(auth_external_line(uid).as_bytes())?;
    writer.flush()?;

    let mut lines = LineReader::new(max_line);
    let line = lines.read_line(reader)?;
    debug!("Auth response: {}", line);
    let guid = parse_response(&line)?;

    if let Some(expected) = expected_guid {
        if !expected.eq_ignore_ascii_case(&guid) {
            return Err(AuthError::GuidMismatch {
                server: guid,
                address: expected.into(),
            }
            .into());
        }
    }

    writer.write_all(b"BEGIN\r\n")?;
    writer.flush()?;
    Ok(Handshake {
        guid,
        leftover: lines.buf,
    })
}
