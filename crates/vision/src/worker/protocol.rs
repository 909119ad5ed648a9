//! Framing between the pipeline and an encoder child process.
//!
//! The child writes a handshake on stdout once it is ready, then answers
//! every frame read from stdin with one result message. All integers are
//! little-endian.
//!
//! ```text
//! handshake  b"ENCW" u32:version
//! frame      u64:sequence u32:width u32:height u32:len [len bytes BGR8]
//! result     u64:sequence u8:status u32:len [len bytes]
//! ```
//!
//! A frame with zero width or height asks the child to exit. A result with
//! status 1 carries a UTF-8 error message instead of an encoded image.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use video_ingest::Frame;

pub const MAGIC: [u8; 4] = *b"ENCW";
pub const VERSION: u32 = 1;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;
/// Largest payload accepted from the other side (an 8K BGR frame fits).
const MAX_PAYLOAD: u32 = 128 * 1024 * 1024;

pub fn write_handshake<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&MAGIC)?;
    writer.write_u32::<LittleEndian>(VERSION)?;
    writer.flush()
}

pub fn read_handshake<R: Read>(reader: &mut R) -> io::Result<()> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(invalid(format!("bad handshake magic {magic:02x?}")));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(invalid(format!(
            "unsupported protocol version {version}, expected {VERSION}"
        )));
    }
    Ok(())
}

pub fn write_frame<W: Write>(writer: &mut W, sequence: u64, frame: &Frame) -> io::Result<()> {
    let len = u32::try_from(frame.data.len())
        .map_err(|_| invalid(format!("frame of {} bytes is too large", frame.data.len())))?;
    writer.write_u64::<LittleEndian>(sequence)?;
    writer.write_u32::<LittleEndian>(frame.width)?;
    writer.write_u32::<LittleEndian>(frame.height)?;
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_all(&frame.data)?;
    writer.flush()
}

pub fn write_stop<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(0)?;
    writer.write_u32::<LittleEndian>(0)?;
    writer.write_u32::<LittleEndian>(0)?;
    writer.write_u32::<LittleEndian>(0)?;
    writer.flush()
}

/// Read the next frame. `None` means the stop sentinel or a clean end of
/// stream between messages.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<(u64, Frame)>> {
    let Some(sequence) = read_leading_u64(reader)? else {
        return Ok(None);
    };
    let width = reader.read_u32::<LittleEndian>()?;
    let height = reader.read_u32::<LittleEndian>()?;
    let payload = read_payload(reader)?;
    if width == 0 || height == 0 {
        return Ok(None);
    }
    let frame = Frame::from_bgr(payload, width, height, chrono::Utc::now().timestamp_millis())
        .map_err(|err| invalid(err.to_string()))?;
    Ok(Some((sequence, frame)))
}

pub fn write_result<W: Write>(
    writer: &mut W,
    sequence: u64,
    result: Result<&[u8], &str>,
) -> io::Result<()> {
    let (status, payload) = match result {
        Ok(bytes) => (STATUS_OK, bytes),
        Err(message) => (STATUS_ERROR, message.as_bytes()),
    };
    let len = u32::try_from(payload.len())
        .map_err(|_| invalid(format!("result of {} bytes is too large", payload.len())))?;
    writer.write_u64::<LittleEndian>(sequence)?;
    writer.write_u8(status)?;
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Encoded image or the child's error message for one frame.
pub type EncodedResult = Result<Vec<u8>, String>;

/// Read the next result; `None` on a clean end of stream.
pub fn read_result<R: Read>(reader: &mut R) -> io::Result<Option<(u64, EncodedResult)>> {
    let Some(sequence) = read_leading_u64(reader)? else {
        return Ok(None);
    };
    let status = reader.read_u8()?;
    let payload = read_payload(reader)?;
    let result = match status {
        STATUS_OK => Ok(payload),
        STATUS_ERROR => Err(String::from_utf8_lossy(&payload).into_owned()),
        other => return Err(invalid(format!("unknown result status {other}"))),
    };
    Ok(Some((sequence, result)))
}

/// First field of a message; EOF before any byte of it is a clean close.
fn read_leading_u64<R: Read>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(Some(u64::from_le_bytes(buf)))
}

fn read_payload<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = reader.read_u32::<LittleEndian>()?;
    if len > MAX_PAYLOAD {
        return Err(invalid(format!("payload of {len} bytes exceeds limit")));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
