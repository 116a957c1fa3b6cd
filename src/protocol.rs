use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::ApplicationError;

/// The BitTorrent protocol identifier string
pub const PROTOCOL_STR: &str = "BitTorrent protocol";

/// Length of the full handshake message (always 68 bytes)
pub const HANDSHAKE_LEN: usize = 68;

/// Largest frame body (tag + payload) accepted from a peer.
pub const MAX_MESSAGE_LEN: u32 = 1 << 20;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

/// Represents a BitTorrent handshake message.
///
/// A handshake is the first message sent in a connection and is always 68 bytes.
/// It identifies the torrent being requested (`info_hash`) and the client (`peer_id`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// SHA1 hash of the info dictionary from the .torrent file
    pub info_hash: [u8; 20],
    /// 20-byte string used to identify the client
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Encodes the handshake into a 68-byte array.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STR.len() as u8;
        buf[1..1 + PROTOCOL_STR.len()].copy_from_slice(PROTOCOL_STR.as_bytes());
        // reserved bytes [20..28] stay zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Decodes a 68-byte handshake message.
    pub fn decode(buf: &[u8]) -> Result<Self, ApplicationError> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(ApplicationError::HandshakeError(format!(
                "invalid handshake length {}",
                buf.len()
            )));
        }

        let pstrlen = buf[0] as usize;
        if pstrlen != PROTOCOL_STR.len() || &buf[1..1 + pstrlen] != PROTOCOL_STR.as_bytes() {
            return Err(ApplicationError::HandshakeError(
                "invalid protocol string".into(),
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self { info_hash, peer_id })
    }
}

/// A protocol message exchanged after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// zero-length frame, no tag
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    /// bitmap of pieces the sender has, most significant bit first
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel { index: u32, begin: u32, length: u32 },
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn malformed(reason: impl Into<String>) -> ApplicationError {
    ApplicationError::MalformedMessage(reason.into())
}

impl Message {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request { .. } => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel { .. } => "cancel",
        }
    }

    /// Serializes a `Message` into a length-prefixed frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::KeepAlive => put_u32(&mut buf, 0),
            Message::Choke => Self::put_tag(&mut buf, 0, ID_CHOKE),
            Message::Unchoke => Self::put_tag(&mut buf, 0, ID_UNCHOKE),
            Message::Interested => Self::put_tag(&mut buf, 0, ID_INTERESTED),
            Message::NotInterested => Self::put_tag(&mut buf, 0, ID_NOT_INTERESTED),
            Message::Have(index) => {
                Self::put_tag(&mut buf, 4, ID_HAVE);
                put_u32(&mut buf, *index);
            }
            Message::Bitfield(bitfield) => {
                Self::put_tag(&mut buf, bitfield.len(), ID_BITFIELD);
                buf.extend_from_slice(bitfield);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                Self::put_tag(&mut buf, 12, ID_REQUEST);
                put_u32(&mut buf, *index);
                put_u32(&mut buf, *begin);
                put_u32(&mut buf, *length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                Self::put_tag(&mut buf, 8 + block.len(), ID_PIECE);
                put_u32(&mut buf, *index);
                put_u32(&mut buf, *begin);
                buf.extend_from_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                Self::put_tag(&mut buf, 12, ID_CANCEL);
                put_u32(&mut buf, *index);
                put_u32(&mut buf, *begin);
                put_u32(&mut buf, *length);
            }
        }
        buf
    }

    fn put_tag(buf: &mut Vec<u8>, payload_len: usize, id: u8) {
        put_u32(buf, (1 + payload_len) as u32);
        buf.push(id);
    }

    /// Parses one length-prefixed frame.
    ///
    /// The declared length must fit in `buf` and match the payload shape of
    /// the tag; anything else is a `MalformedMessage`.
    pub fn decode(buf: &[u8]) -> Result<Self, ApplicationError> {
        let mut rd = buf;
        let len = rd
            .read_u32::<BigEndian>()
            .map_err(|_| malformed("buffer too short to read length"))?;

        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        if len > MAX_MESSAGE_LEN {
            return Err(malformed(format!("declared length {} exceeds limit", len)));
        }
        if rd.len() < len as usize {
            return Err(malformed(format!(
                "declared length {} but only {} bytes framed",
                len,
                rd.len()
            )));
        }

        let mut body = &rd[..len as usize];
        let id = body.read_u8().map_err(|_| malformed("missing message id"))?;
        let payload_len = len as usize - 1;

        let expect = |want: usize, what: &str| {
            if payload_len == want {
                Ok(())
            } else {
                Err(malformed(format!(
                    "invalid {} payload length {} (expected {})",
                    what, payload_len, want
                )))
            }
        };

        let msg = match id {
            ID_CHOKE => expect(0, "choke").map(|_| Message::Choke)?,
            ID_UNCHOKE => expect(0, "unchoke").map(|_| Message::Unchoke)?,
            ID_INTERESTED => expect(0, "interested").map(|_| Message::Interested)?,
            ID_NOT_INTERESTED => expect(0, "not-interested").map(|_| Message::NotInterested)?,
            ID_HAVE => {
                expect(4, "have")?;
                Message::Have(read_u32(&mut body)?)
            }
            ID_BITFIELD => {
                let mut bitfield = vec![0u8; payload_len];
                body.read_exact(&mut bitfield)
                    .map_err(|e| malformed(format!("bitfield: {}", e)))?;
                Message::Bitfield(bitfield)
            }
            ID_REQUEST | ID_CANCEL => {
                expect(12, if id == ID_REQUEST { "request" } else { "cancel" })?;
                let index = read_u32(&mut body)?;
                let begin = read_u32(&mut body)?;
                let length = read_u32(&mut body)?;
                if id == ID_REQUEST {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            ID_PIECE => {
                if payload_len < 8 {
                    return Err(malformed(format!(
                        "invalid piece payload length {}",
                        payload_len
                    )));
                }
                let index = read_u32(&mut body)?;
                let begin = read_u32(&mut body)?;
                Message::Piece {
                    index,
                    begin,
                    block: body.to_vec(),
                }
            }
            other => return Err(malformed(format!("unknown message id: {}", other))),
        };

        Ok(msg)
    }
}

fn read_u32(body: &mut &[u8]) -> Result<u32, ApplicationError> {
    body.read_u32::<BigEndian>()
        .map_err(|e| malformed(format!("protocol: {}", e)))
}

/// Reads one frame from `reader`.
///
/// The length prefix is checked against `MAX_MESSAGE_LEN` before the body is
/// allocated, so a hostile peer cannot make us reserve arbitrary memory.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, ApplicationError>
where
    R: AsyncRead + Unpin,
{
    // named explicitly: byteorder's ReadBytesExt is in scope too
    let mut length = [0u8; 4];
    tokio::io::AsyncReadExt::read_exact(&mut *reader, &mut length).await?;

    let size = u32::from_be_bytes(length);
    if size > MAX_MESSAGE_LEN {
        return Err(malformed(format!("declared length {} exceeds limit", size)));
    }

    let mut frame = vec![0u8; 4 + size as usize];
    frame[..4].copy_from_slice(&length);
    tokio::io::AsyncReadExt::read_exact(&mut *reader, &mut frame[4..]).await?;

    Message::decode(&frame)
}

/// Writes and flushes one frame.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&msg.encode()).await?;
    writer.flush().await
}
