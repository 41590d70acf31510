//! Wire format for channel and stream packets.
//!
//! Every datagram carries one channel header; data-bearing channel packets
//! carry one stream header as their payload. Integer fields are unsigned
//! LEB128 varints, so header size varies with field values. Payloads are the
//! remainder of the enclosing buffer — no length prefix needed because the
//! datagram substrate preserves message boundaries.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, SstError};

/// Flag bit on DATAGRAM packets: more fragments follow.
pub const FLAG_CONTINUES: u8 = 0x1;

/// Stream packet type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamPacketType {
    Init = 0x01,
    Reply = 0x02,
    Data = 0x03,
    Ack = 0x04,
    Datagram = 0x05,
}

impl TryFrom<u8> for StreamPacketType {
    type Error = SstError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(StreamPacketType::Init),
            0x02 => Ok(StreamPacketType::Reply),
            0x03 => Ok(StreamPacketType::Data),
            0x04 => Ok(StreamPacketType::Ack),
            0x05 => Ok(StreamPacketType::Datagram),
            other => Err(SstError::UnknownPacketType(other)),
        }
    }
}

/// Channel header: wraps the payload of every datagram on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHeader {
    pub channel_id: u32,
    pub transmit_seq: u64,
    pub ack_count: u32,
    pub ack_seq: u64,
    pub payload: Bytes,
}

impl ChannelHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        put_varint(&mut buf, u64::from(self.channel_id));
        put_varint(&mut buf, self.transmit_seq);
        put_varint(&mut buf, u64::from(self.ack_count));
        put_varint(&mut buf, self.ack_seq);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn encoded_len(&self) -> usize {
        varint_len(u64::from(self.channel_id))
            + varint_len(self.transmit_seq)
            + varint_len(u64::from(self.ack_count))
            + varint_len(self.ack_seq)
            + self.payload.len()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let channel_id = get_varint_u32(&mut data)?;
        let transmit_seq = get_varint(&mut data)?;
        let ack_count = get_varint_u32(&mut data)?;
        let ack_seq = get_varint(&mut data)?;
        Ok(ChannelHeader {
            channel_id,
            transmit_seq,
            ack_count,
            ack_seq,
            payload: Bytes::copy_from_slice(data),
        })
    }
}

/// Stream header: carried inside the payload of data-bearing channel packets.
///
/// `psid` is meaningful only on INIT (parent LSID), `rsid` only on REPLY
/// (the initiator's LSID), and `bsn` is 0 for INIT/REPLY/ACK. All fields are
/// present on the wire regardless of type; the varint encoding keeps the
/// unused ones at one byte each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub lsid: u32,
    pub packet_type: StreamPacketType,
    pub flags: u8,
    /// log2 of the advertised receive window, truncated.
    pub window: u8,
    pub src_port: u16,
    pub dest_port: u16,
    pub psid: u32,
    pub rsid: u32,
    /// Stream byte offset of the first payload byte.
    pub bsn: u64,
    pub payload: Bytes,
}

impl StreamHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        put_varint(&mut buf, u64::from(self.lsid));
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.flags);
        buf.put_u8(self.window);
        put_varint(&mut buf, u64::from(self.src_port));
        put_varint(&mut buf, u64::from(self.dest_port));
        put_varint(&mut buf, u64::from(self.psid));
        put_varint(&mut buf, u64::from(self.rsid));
        put_varint(&mut buf, self.bsn);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn encoded_len(&self) -> usize {
        varint_len(u64::from(self.lsid))
            + 3
            + varint_len(u64::from(self.src_port))
            + varint_len(u64::from(self.dest_port))
            + varint_len(u64::from(self.psid))
            + varint_len(u64::from(self.rsid))
            + varint_len(self.bsn)
            + self.payload.len()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let lsid = get_varint_u32(&mut data)?;
        if data.len() < 3 {
            return Err(SstError::PacketTooShort {
                expected: 3,
                actual: data.len(),
            });
        }
        let packet_type = StreamPacketType::try_from(data[0])?;
        let flags = data[1];
        let window = data[2];
        data = &data[3..];
        let src_port = get_varint_u16(&mut data)?;
        let dest_port = get_varint_u16(&mut data)?;
        let psid = get_varint_u32(&mut data)?;
        let rsid = get_varint_u32(&mut data)?;
        let bsn = get_varint(&mut data)?;
        Ok(StreamHeader {
            lsid,
            packet_type,
            flags,
            window,
            src_port,
            dest_port,
            psid,
            rsid,
            bsn,
            payload: Bytes::copy_from_slice(data),
        })
    }
}

fn put_varint(buf: &mut BytesMut, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn varint_len(mut v: u64) -> usize {
    let mut len = 1;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

fn get_varint(data: &mut &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i >= 10 {
            return Err(SstError::MalformedPacket("varint too long"));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            *data = &data[i + 1..];
            return Ok(value);
        }
    }
    Err(SstError::PacketTooShort {
        expected: data.len() + 1,
        actual: data.len(),
    })
}

fn get_varint_u32(data: &mut &[u8]) -> Result<u32> {
    let v = get_varint(data)?;
    u32::try_from(v).map_err(|_| SstError::MalformedPacket("field exceeds u32"))
}

fn get_varint_u16(data: &mut &[u8]) -> Result<u16> {
    let v = get_varint(data)?;
    u16::try_from(v).map_err(|_| SstError::MalformedPacket("field exceeds u16"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_header_round_trip() {
        let hdr = ChannelHeader {
            channel_id: 7,
            transmit_seq: 1_000_000,
            ack_count: 1,
            ack_seq: 999_999,
            payload: Bytes::from_static(b"payload bytes"),
        };
        let encoded = hdr.encode();
        assert_eq!(encoded.len(), hdr.encoded_len());
        let decoded = ChannelHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn stream_header_round_trip() {
        let hdr = StreamHeader {
            lsid: 42,
            packet_type: StreamPacketType::Data,
            flags: 0,
            window: 16,
            src_port: 300,
            dest_port: 9,
            psid: 0,
            rsid: 0,
            bsn: 123_456_789,
            payload: Bytes::from_static(b"stream data"),
        };
        let decoded = StreamHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn header_size_varies_with_field_values() {
        let small = StreamHeader {
            lsid: 1,
            packet_type: StreamPacketType::Data,
            flags: 0,
            window: 10,
            src_port: 1,
            dest_port: 1,
            psid: 0,
            rsid: 0,
            bsn: 0,
            payload: Bytes::new(),
        };
        let large = StreamHeader {
            bsn: u64::MAX,
            lsid: u32::MAX,
            src_port: u16::MAX,
            dest_port: u16::MAX,
            ..small.clone()
        };
        assert!(large.encoded_len() > small.encoded_len());
    }

    #[test]
    fn truncated_input_is_an_error() {
        let hdr = StreamHeader {
            lsid: 9,
            packet_type: StreamPacketType::Ack,
            flags: 0,
            window: 12,
            src_port: 4,
            dest_port: 5,
            psid: 0,
            rsid: 0,
            bsn: 0,
            payload: Bytes::new(),
        };
        let encoded = hdr.encode();
        assert!(StreamHeader::decode(&encoded[..2]).is_err());
        assert!(ChannelHeader::decode(&[]).is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        let mut encoded = BytesMut::new();
        put_varint(&mut encoded, 1); // lsid
        encoded.put_u8(0x7f); // bogus type
        encoded.put_u8(0);
        encoded.put_u8(0);
        assert!(matches!(
            StreamHeader::decode(&encoded),
            Err(SstError::UnknownPacketType(0x7f))
        ));
    }

    #[test]
    fn varint_boundaries() {
        for v in [0u64, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, v);
            assert_eq!(buf.len(), varint_len(v));
            let mut slice = &buf[..];
            assert_eq!(get_varint(&mut slice).unwrap(), v);
            assert!(slice.is_empty());
        }
    }
}
