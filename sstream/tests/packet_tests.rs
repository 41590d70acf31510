//! Wire-format tests for the channel and stream headers.

use bytes::Bytes;

use sstream::packet::{ChannelHeader, StreamHeader, StreamPacketType, FLAG_CONTINUES};

fn data_header(payload: &'static [u8]) -> StreamHeader {
    StreamHeader {
        lsid: 3,
        packet_type: StreamPacketType::Data,
        flags: 0,
        window: 16,
        src_port: 10,
        dest_port: 20,
        psid: 0,
        rsid: 0,
        bsn: 0,
        payload: Bytes::from_static(payload),
    }
}

#[test]
fn channel_packet_carries_stream_packet() {
    let stream = StreamHeader {
        lsid: 77,
        packet_type: StreamPacketType::Init,
        flags: 0,
        window: 15,
        src_port: 5,
        dest_port: 42,
        psid: 12,
        rsid: 0,
        bsn: 0,
        payload: Bytes::from_static(b"initial data"),
    };
    let channel = ChannelHeader {
        channel_id: 9,
        transmit_seq: 1,
        ack_count: 1,
        ack_seq: 1,
        payload: stream.encode(),
    };

    let decoded_channel = ChannelHeader::decode(&channel.encode()).unwrap();
    assert_eq!(decoded_channel.channel_id, 9);
    let decoded_stream = StreamHeader::decode(&decoded_channel.payload).unwrap();
    assert_eq!(decoded_stream, stream);
}

#[test]
fn all_packet_types_round_trip() {
    for packet_type in [
        StreamPacketType::Init,
        StreamPacketType::Reply,
        StreamPacketType::Data,
        StreamPacketType::Ack,
        StreamPacketType::Datagram,
    ] {
        let header = StreamHeader {
            packet_type,
            ..data_header(b"x")
        };
        let decoded = StreamHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.packet_type, packet_type);
    }
}

#[test]
fn continues_flag_survives() {
    let header = StreamHeader {
        packet_type: StreamPacketType::Datagram,
        flags: FLAG_CONTINUES,
        ..data_header(b"fragment")
    };
    let decoded = StreamHeader::decode(&header.encode()).unwrap();
    assert_ne!(decoded.flags & FLAG_CONTINUES, 0);
}

#[test]
fn large_offsets_and_seqnos() {
    let stream = StreamHeader {
        bsn: u64::MAX - 1,
        ..data_header(b"tail")
    };
    assert_eq!(StreamHeader::decode(&stream.encode()).unwrap().bsn, u64::MAX - 1);

    let channel = ChannelHeader {
        channel_id: u32::MAX,
        transmit_seq: u64::MAX,
        ack_count: 1,
        ack_seq: u64::MAX - 7,
        payload: Bytes::new(),
    };
    let decoded = ChannelHeader::decode(&channel.encode()).unwrap();
    assert_eq!(decoded.transmit_seq, u64::MAX);
    assert_eq!(decoded.ack_seq, u64::MAX - 7);
}

#[test]
fn empty_payloads_are_legal() {
    let header = StreamHeader {
        packet_type: StreamPacketType::Ack,
        payload: Bytes::new(),
        ..data_header(b"")
    };
    let decoded = StreamHeader::decode(&header.encode()).unwrap();
    assert!(decoded.payload.is_empty());
}

#[test]
fn truncation_anywhere_is_an_error_not_a_panic() {
    let encoded = ChannelHeader {
        channel_id: 1,
        transmit_seq: 300,
        ack_count: 1,
        ack_seq: 299,
        payload: data_header(b"payload").encode(),
    }
    .encode();

    for len in 0..encoded.len() {
        // Some prefixes decode to a header with a shorter payload, which is
        // fine; none may panic.
        let _ = ChannelHeader::decode(&encoded[..len]);
    }

    let stream_encoded = data_header(b"payload").encode();
    for len in 0..3 {
        assert!(StreamHeader::decode(&stream_encoded[..len]).is_err());
    }
}

#[test]
fn max_payload_stream_packet_fits_channel_budget() {
    // A full stream packet (1000 B payload) plus both headers must stay
    // within the channel payload cap of 1300 B.
    let stream = StreamHeader {
        lsid: u32::MAX,
        packet_type: StreamPacketType::Data,
        flags: 0,
        window: 31,
        src_port: u16::MAX,
        dest_port: u16::MAX,
        psid: u32::MAX,
        rsid: u32::MAX,
        bsn: u64::MAX,
        payload: Bytes::from(vec![0u8; 1000]),
    };
    assert!(stream.encoded_len() <= 1300);
}
