use danmaku::packet::{HEADER_LEN, Packet, decode_frame, op, ver};
use proptest::prelude::*;

fn operation() -> impl Strategy<Value = u32> {
    prop_oneof![
        Just(op::HEARTBEAT),
        Just(op::HEARTBEAT_REPLY),
        Just(op::MESSAGE),
        Just(op::AUTH),
        Just(op::AUTH_REPLY),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn plain_packet_roundtrip(
        version in prop_oneof![Just(ver::PLAIN_JSON), Just(ver::PLAIN)],
        operation in operation(),
        sequence in any::<u32>(),
        body in proptest::collection::vec(any::<u8>(), 0..64 * 1024),
    ) {
        let packet = Packet::new(version, operation, body).with_sequence(sequence);
        let encoded = packet.encode();
        prop_assert_eq!(encoded.len(), HEADER_LEN + packet.body.len());

        let decoded = decode_frame(&encoded).unwrap();
        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(&decoded[0], &packet);
    }

    #[test]
    fn truncated_frames_never_panic(
        body in proptest::collection::vec(any::<u8>(), 0..512),
        cut in 1usize..64,
    ) {
        let encoded = Packet::new(ver::PLAIN, op::MESSAGE, body).encode();
        let cut = cut.min(encoded.len() - 1);
        prop_assert!(decode_frame(&encoded[..encoded.len() - cut]).is_err());
    }
}
