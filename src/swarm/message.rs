use anyhow::{bail, ensure, Context, Result};
use bit_vec::BitVec;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;
pub const BLOCK_LENGTH: u32 = 16384;
/// Largest frame we accept; a bitfield for a million pieces still fits.
pub const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Reserved byte 5, bit 0x10: extension protocol (BEP 10).
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MessageKind {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl MessageKind {
    fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => MessageKind::Choke,
            1 => MessageKind::Unchoke,
            2 => MessageKind::Interested,
            3 => MessageKind::NotInterested,
            4 => MessageKind::Have,
            5 => MessageKind::Bitfield,
            6 => MessageKind::Request,
            7 => MessageKind::Piece,
            8 => MessageKind::Cancel,
            9 => MessageKind::Port,
            20 => MessageKind::Extended,
            _ => return None,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(BitVec),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        data: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    Port(u16),
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    pub fn tag(&self) -> Option<MessageKind> {
        match &self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageKind::Choke),
            Message::Unchoke => Some(MessageKind::Unchoke),
            Message::Interested => Some(MessageKind::Interested),
            Message::NotInterested => Some(MessageKind::NotInterested),
            Message::Have(_) => Some(MessageKind::Have),
            Message::Bitfield(_) => Some(MessageKind::Bitfield),
            Message::Request { .. } => Some(MessageKind::Request),
            Message::Piece { .. } => Some(MessageKind::Piece),
            Message::Cancel { .. } => Some(MessageKind::Cancel),
            Message::Port(_) => Some(MessageKind::Port),
            Message::Extended { .. } => Some(MessageKind::Extended),
        }
    }

    /// Writes the length-prefixed frame.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let body_len: usize = match self {
            Message::KeepAlive => return w.write_u32::<BigEndian>(0),
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 0,
            Message::Have(_) => 4,
            Message::Bitfield(bits) => bits.to_bytes().len(),
            Message::Request { .. } | Message::Cancel { .. } => 12,
            Message::Piece { data, .. } => 8 + data.len(),
            Message::Port(_) => 2,
            Message::Extended { payload, .. } => 1 + payload.len(),
        };
        w.write_u32::<BigEndian>(1 + body_len as u32)?;
        if let Some(tag) = self.tag() {
            w.write_u8(tag as u8)?;
        }
        match self {
            Message::Have(index) => w.write_u32::<BigEndian>(*index)?,
            Message::Bitfield(bits) => w.write_all(&bits.to_bytes())?,
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                w.write_u32::<BigEndian>(*index)?;
                w.write_u32::<BigEndian>(*begin)?;
                w.write_u32::<BigEndian>(*length)?;
            }
            Message::Piece { index, begin, data } => {
                w.write_u32::<BigEndian>(*index)?;
                w.write_u32::<BigEndian>(*begin)?;
                w.write_all(data)?;
            }
            Message::Port(port) => w.write_u16::<BigEndian>(*port)?,
            Message::Extended { id, payload } => {
                w.write_u8(*id)?;
                w.write_all(payload)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Decodes one frame body (everything after the length prefix).
    pub fn parse(buf: &[u8]) -> Result<Message> {
        let mut cursor = Cursor::new(buf);
        let id = cursor.read_u8().context("Empty message")?;
        let kind = match MessageKind::from_id(id) {
            Some(kind) => kind,
            None => bail!("Unknown message id {}", id),
        };
        let msg = match kind {
            MessageKind::Choke => Message::Choke,
            MessageKind::Unchoke => Message::Unchoke,
            MessageKind::Interested => Message::Interested,
            MessageKind::NotInterested => Message::NotInterested,
            MessageKind::Have => Message::Have(cursor.read_u32::<BigEndian>()?),
            MessageKind::Bitfield => Message::Bitfield(BitVec::from_bytes(&buf[1..])),
            MessageKind::Request => Message::Request {
                index: cursor.read_u32::<BigEndian>()?,
                begin: cursor.read_u32::<BigEndian>()?,
                length: cursor.read_u32::<BigEndian>()?,
            },
            MessageKind::Piece => {
                let index = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()?;
                let mut data = Vec::with_capacity(buf.len().saturating_sub(9));
                cursor.read_to_end(&mut data)?;
                Message::Piece { index, begin, data }
            }
            MessageKind::Cancel => Message::Cancel {
                index: cursor.read_u32::<BigEndian>()?,
                begin: cursor.read_u32::<BigEndian>()?,
                length: cursor.read_u32::<BigEndian>()?,
            },
            MessageKind::Port => Message::Port(cursor.read_u16::<BigEndian>()?),
            MessageKind::Extended => {
                let id = cursor.read_u8().context("Extended message without id")?;
                Message::Extended {
                    id,
                    payload: buf[2..].to_vec(),
                }
            }
        };
        Ok(msg)
    }
}

/// Pops one complete frame off the front of `inbox`, if there is one.
pub fn take_frame(inbox: &mut Vec<u8>) -> Result<Option<Message>> {
    if inbox.len() < 4 {
        return Ok(None);
    }
    let len = BigEndian::read_u32(&inbox[..4]) as usize;
    ensure!(
        len <= MAX_MESSAGE_LEN,
        "Advisory length is bigger than the frame limit: advisory_length={}",
        len
    );
    if inbox.len() < 4 + len {
        return Ok(None);
    }
    let frame: Vec<u8> = inbox.drain(..4 + len).skip(4).collect();
    if frame.is_empty() {
        return Ok(Some(Message::KeepAlive));
    }
    Message::parse(&frame).map(Some)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub extensions: bool,
}

impl Handshake {
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        if self.extensions {
            buf[20 + EXTENSION_BYTE] |= EXTENSION_BIT;
        }
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn parse(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        if buf[0] as usize != PROTOCOL.len() || &buf[1..20] != PROTOCOL {
            bail!(
                "Received wrong handshake:\nexpected=\t{:?}\ngot=\t{:?}",
                &PROTOCOL[..],
                &buf[1..20]
            );
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Handshake {
            info_hash,
            peer_id,
            extensions: buf[20 + EXTENSION_BYTE] & EXTENSION_BIT != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(msg: &Message) -> Vec<u8> {
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn request_wire_format() {
        let buf = frame(&Message::Request {
            index: 1,
            begin: 16384,
            length: BLOCK_LENGTH,
        });
        assert_eq!(
            buf,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn piece_carries_payload() {
        let body = [7u8, 0, 0, 0, 2, 0, 0, 0, 0, 0xaa, 0xbb];
        assert_eq!(
            Message::parse(&body).unwrap(),
            Message::Piece {
                index: 2,
                begin: 0,
                data: vec![0xaa, 0xbb]
            }
        );
    }

    #[test]
    fn bitfield_is_msb_first() {
        let msg = Message::parse(&[5, 0b1010_0000]).unwrap();
        match msg {
            Message::Bitfield(bits) => {
                assert_eq!(bits.get(0), Some(true));
                assert_eq!(bits.get(1), Some(false));
                assert_eq!(bits.get(2), Some(true));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn frames_split_across_reads() {
        let mut inbox = frame(&Message::Have(9));
        inbox.extend(frame(&Message::KeepAlive));
        inbox.extend(&frame(&Message::Unchoke)[..3]);

        assert_eq!(take_frame(&mut inbox).unwrap(), Some(Message::Have(9)));
        assert_eq!(take_frame(&mut inbox).unwrap(), Some(Message::KeepAlive));
        assert_eq!(take_frame(&mut inbox).unwrap(), None);
        inbox.extend(&frame(&Message::Unchoke)[3..]);
        assert_eq!(take_frame(&mut inbox).unwrap(), Some(Message::Unchoke));
        assert!(inbox.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut inbox = vec![0xff, 0xff, 0xff, 0xff, 0];
        assert!(take_frame(&mut inbox).is_err());
    }

    #[test]
    fn unknown_id_is_an_error() {
        assert!(Message::parse(&[42]).is_err());
        assert!(Message::parse(&[]).is_err());
    }

    #[test]
    fn handshake_advertises_extensions() {
        let hs = Handshake {
            info_hash: [1; 20],
            peer_id: [2; 20],
            extensions: true,
        };
        let bytes = hs.to_bytes();
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL);
        assert_eq!(Handshake::parse(&bytes).unwrap(), hs);

        let mut bad = bytes;
        bad[3] = b'x';
        assert!(Handshake::parse(&bad).is_err());
    }
}
