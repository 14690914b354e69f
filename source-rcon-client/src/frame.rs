//! Wire framing for Source RCON packets.
//!
//! ```text
//! +--------+--------+--------+-----------------+------+
//! | length | id     | type   | payload (UTF-8) | 0 0  |
//! | i32 LE | i32 LE | i32 LE | length - 10     | 2    |
//! +--------+--------+--------+-----------------+------+
//! ```
//!
//! `length` counts everything after itself: id, type, payload and both terminators.

use crate::RconError;
use std::fmt::{Display, Formatter};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Port Source servers listen for RCON on unless told otherwise.
pub const DEFAULT_PORT: u16 = 27015;

/// Largest `length` field accepted from a peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const LEN_PREFIX: usize = std::mem::size_of::<i32>();
/// id + type + two terminating NULs.
const MIN_FRAME_LEN: usize = 10;
const READ_CHUNK_LEN: usize = 4096;

/// Numeric packet type code.
///
/// Codes overlap between directions (`EXEC_COMMAND` and `AUTH_RESPONSE` are both 2), so this
/// is a thin wrapper around the raw value rather than an enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketType(i32);

impl PacketType {
    /// Login request carrying the password.
    pub const AUTH: PacketType = PacketType(3);
    /// Console command request.
    pub const EXEC_COMMAND: PacketType = PacketType(2);
    /// Server answer to [`PacketType::AUTH`].
    pub const AUTH_RESPONSE: PacketType = PacketType(2);
    /// Server answer to a command.
    pub const RESPONSE_VALUE: PacketType = PacketType(0);

    pub const fn new(code: i32) -> Self {
        PacketType(code)
    }

    pub const fn code(self) -> i32 {
        self.0
    }
}

impl Display for PacketType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded inbound packet.
///
/// [`Response::empty`] is the "no answer" value: it stands for timeouts, failed sends and
/// rejected logins alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: i32,
    pub kind: PacketType,
    pub payload: String,
}

impl Response {
    /// Sequence id servers use for "no such request", most notably a rejected login.
    pub const EMPTY_ID: i32 = -1;

    pub fn empty() -> Self {
        Response {
            id: Self::EMPTY_ID,
            kind: PacketType::RESPONSE_VALUE,
            payload: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id == Self::EMPTY_ID
    }
}

/// Appends one encoded packet to `buf`.
pub fn serialize_packet(
    id: i32,
    kind: PacketType,
    payload: &str,
    buf: &mut Vec<u8>,
) -> crate::Result<()> {
    let len = MIN_FRAME_LEN + payload.len();
    if len > MAX_FRAME_LEN {
        return Err(RconError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        }
        .into());
    }

    buf.reserve(LEN_PREFIX + len);
    buf.extend_from_slice(&(len as i32).to_le_bytes());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&kind.code().to_le_bytes());
    buf.extend_from_slice(payload.as_bytes());
    buf.extend_from_slice(&[0, 0]);

    Ok(())
}

/// Decodes one packet from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not hold a complete packet yet, otherwise the packet and
/// the bytes following it.
pub fn deserialize_packet(buf: &[u8]) -> crate::Result<Option<(Response, &[u8])>> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }

    let (len_bytes, remaining_bytes) = buf.split_at(LEN_PREFIX);
    let len = read_i32(len_bytes);

    if len < MIN_FRAME_LEN as i32 {
        return Err(RconError::MalformedFrame("length shorter than packet header").into());
    }
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(RconError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        }
        .into());
    }

    if remaining_bytes.len() < len {
        return Ok(None);
    }

    let (packet_bytes, after_bytes) = remaining_bytes.split_at(len);
    let id = read_i32(&packet_bytes[0..4]);
    let kind = PacketType(read_i32(&packet_bytes[4..8]));
    let payload = String::from_utf8_lossy(&packet_bytes[8..len - 2]).into_owned();

    Ok(Some((Response { id, kind, payload }, after_bytes)))
}

fn read_i32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Buffered packet reader over the inbound half of a connection.
#[derive(Debug)]
pub(crate) struct FrameReader<R> {
    read: R,
    buffer: Vec<u8>,
    read_offset: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(read: R) -> Self {
        FrameReader {
            read,
            buffer: Vec::new(),
            read_offset: 0,
        }
    }

    pub async fn receive(&mut self) -> crate::Result<Response> {
        // Repeatedly fetch data from the remote until a whole packet is buffered
        loop {
            if let Some((response, remaining_buffer)) =
                deserialize_packet(&self.buffer[self.read_offset..])?
            {
                self.read_offset = self.buffer.len() - remaining_buffer.len();
                return Ok(response);
            }

            // If all of the buffer has been consumed, it can be completely re-used
            if self.read_offset == self.buffer.len() {
                self.buffer.clear();
                self.read_offset = 0;
            }

            // Add some space to write into
            let write_start = self.buffer.len();
            self.buffer.resize(write_start + READ_CHUNK_LEN, 0);

            let write_len = match self.read.read(&mut self.buffer[write_start..]).await {
                Ok(len) => len,
                Err(err) => {
                    self.buffer.truncate(write_start);
                    return Err(err.into());
                }
            };

            // Shrink the buffer again so it only contains written data
            self.buffer.truncate(write_start + write_len);

            if write_len == 0 {
                return if self.read_offset == self.buffer.len() {
                    Err(RconError::ConnectionClosed.into())
                } else {
                    Err(RconError::MalformedFrame("stream closed mid-frame").into())
                };
            }
        }
    }
}

/// Packet writer over the outbound half of a connection.
#[derive(Debug)]
pub(crate) struct FrameWriter<W> {
    write: W,
    buffer: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(write: W) -> Self {
        FrameWriter {
            write,
            buffer: Vec::new(),
        }
    }

    pub async fn send(&mut self, id: i32, kind: PacketType, payload: &str) -> crate::Result<()> {
        self.buffer.clear();
        serialize_packet(id, kind, payload, &mut self.buffer)?;
        self.write.write_all(&self.buffer).await?;
        self.write.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> crate::Result<()> {
        self.write.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(id: i32, kind: PacketType, payload: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        serialize_packet(id, kind, payload, &mut buf).unwrap();
        buf
    }

    #[test]
    fn encodes_help_command() {
        assert_eq!(
            encode(7, PacketType::EXEC_COMMAND, "help"),
            [
                0x0E, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x68,
                0x65, 0x6C, 0x70, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn decodes_what_it_encodes() {
        let buf = encode(42, PacketType::EXEC_COMMAND, "hello");
        let (response, rest) = deserialize_packet(&buf).unwrap().unwrap();

        assert_eq!(response.id, 42);
        assert_eq!(response.payload, "hello");
        assert!(rest.is_empty());
    }

    #[test]
    fn length_counts_utf8_bytes() {
        let buf = encode(1, PacketType::EXEC_COMMAND, "é");
        assert_eq!(read_i32(&buf[..4]), 12);
    }

    #[test]
    fn partial_packet_needs_more_data() {
        let buf = encode(3, PacketType::RESPONSE_VALUE, "partial");
        assert!(deserialize_packet(&buf[..3]).unwrap().is_none());
        assert!(deserialize_packet(&buf[..buf.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn leaves_following_packets_in_place() {
        let mut buf = encode(1, PacketType::RESPONSE_VALUE, "one");
        buf.extend(encode(2, PacketType::RESPONSE_VALUE, "two"));

        let (first, rest) = deserialize_packet(&buf).unwrap().unwrap();
        let (second, rest) = deserialize_packet(rest).unwrap().unwrap();

        assert_eq!(first.payload, "one");
        assert_eq!(second.id, 2);
        assert!(rest.is_empty());
    }

    #[test]
    fn rejects_short_length() {
        let mut buf = encode(1, PacketType::RESPONSE_VALUE, "");
        buf[..4].copy_from_slice(&9i32.to_le_bytes());
        let err = deserialize_packet(&buf).unwrap_err();
        assert!(matches!(err.0, RconError::MalformedFrame(_)));

        buf[..4].copy_from_slice(&(-5i32).to_le_bytes());
        assert!(deserialize_packet(&buf).is_err());
    }

    #[test]
    fn rejects_huge_length() {
        let buf = ((MAX_FRAME_LEN + 1) as i32).to_le_bytes();
        let err = deserialize_packet(&buf).unwrap_err();
        assert!(matches!(err.0, RconError::FrameTooLarge { .. }));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut buf = encode(1, PacketType::RESPONSE_VALUE, "ab");
        buf[12] = 0xFF;
        let (response, _) = deserialize_packet(&buf).unwrap().unwrap();
        assert_eq!(response.payload, "\u{FFFD}b");
    }

    #[test]
    fn empty_response_sentinel() {
        let empty = Response::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.payload, "");
    }

    #[tokio::test]
    async fn reader_yields_packets_then_closed() {
        let mut bytes = encode(5, PacketType::RESPONSE_VALUE, "first");
        bytes.extend(encode(6, PacketType::AUTH_RESPONSE, ""));
        let mut reader = FrameReader::new(&bytes[..]);

        assert_eq!(reader.receive().await.unwrap().payload, "first");
        let second = reader.receive().await.unwrap();
        assert_eq!(second.id, 6);
        assert_eq!(second.kind, PacketType::AUTH_RESPONSE);

        let err = reader.receive().await.unwrap_err();
        assert!(matches!(err.0, RconError::ConnectionClosed));
    }

    #[tokio::test]
    async fn reader_reports_truncated_packet() {
        let bytes = encode(5, PacketType::RESPONSE_VALUE, "truncated");
        let mut reader = FrameReader::new(&bytes[..bytes.len() - 4]);

        let err = reader.receive().await.unwrap_err();
        assert!(matches!(err.0, RconError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn writer_emits_one_packet_per_send() {
        let mut out = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut out);
            writer.send(1, PacketType::AUTH, "secret").await.unwrap();
            writer.send(2, PacketType::EXEC_COMMAND, "status").await.unwrap();
        }

        let (login, rest) = deserialize_packet(&out).unwrap().unwrap();
        let (command, _) = deserialize_packet(rest).unwrap().unwrap();
        assert_eq!(login.kind, PacketType::AUTH);
        assert_eq!(login.payload, "secret");
        assert_eq!(command.id, 2);
    }
}
