//! Property tests covering every packet kind.

use kvsync_protocol::*;
use proptest::collection::{btree_map, vec};
use proptest::prelude::*;

fn sync_mode() -> impl Strategy<Value = SyncMode> {
    prop_oneof![
        Just(SyncMode::Push),
        Just(SyncMode::Pull),
        Just(SyncMode::PushAndPull),
        Just(SyncMode::AutoPush),
        Just(SyncMode::AutoPull),
        Just(SyncMode::ResponsePull),
    ]
}

fn security() -> impl Strategy<Value = SecurityOption> {
    (prop::sample::select(SecurityLabel::ALL.to_vec()), any::<i32>())
        .prop_map(|(label, flag)| SecurityOption::new(label, flag))
}

fn data_item() -> impl Strategy<Value = DataItem> {
    (
        vec(any::<u8>(), 0..64),
        vec(any::<u8>(), 0..256),
        any::<u64>(),
        any::<u64>(),
        any::<u64>(),
        "[a-z0-9]{0,12}",
    )
        .prop_map(|(key, value, timestamp, write_timestamp, flag, origin_device)| DataItem {
            key,
            value,
            timestamp,
            write_timestamp,
            flag,
            origin_device,
        })
}

fn commit_node() -> impl Strategy<Value = CommitNode> {
    (
        vec(any::<u8>(), 0..32),
        vec(any::<u8>(), 0..32),
        vec(any::<u8>(), 0..32),
        any::<u64>(),
        any::<u64>(),
        "[a-z]{0,8}",
    )
        .prop_map(
            |(commit_id, left_parent, right_parent, timestamp, version, device_id)| CommitNode {
                commit_id,
                left_parent,
                right_parent,
                timestamp,
                version,
                device_id,
            },
        )
}

fn multi_ver_entry() -> impl Strategy<Value = MultiVerEntry> {
    (
        vec(any::<u8>(), 0..32),
        vec(any::<[u8; 32]>(), 0..4),
        any::<bool>(),
        any::<u64>(),
    )
        .prop_map(|(key, slices, deleted, timestamp)| MultiVerEntry {
            key,
            slices,
            deleted,
            timestamp,
        })
}

fn single_ver_payload() -> impl Strategy<Value = (MessageType, Payload)> {
    prop_oneof![
        (any::<u64>(), any::<u64>(), any::<u64>(), any::<u64>(), any::<bool>()).prop_map(
            |(a, b, c, d, is_request)| {
                let packet = TimeSyncPacket {
                    source_time_begin: a,
                    source_time_end: b,
                    target_time_begin: c,
                    target_time_end: d,
                };
                let ty = if is_request {
                    MessageType::Request
                } else {
                    MessageType::Response
                };
                (ty, Payload::TimeSync(packet))
            }
        ),
        (any::<u32>(), any::<i32>(), any::<u32>(), ".{0,40}", security(), any::<u32>(), sync_mode())
            .prop_map(|(protocol_version, send_code, software_version, schema, security, schema_type, mode)| {
                (
                    MessageType::Request,
                    Payload::AbilityRequest(AbilitySyncRequestPacket {
                        protocol_version,
                        send_code,
                        software_version,
                        schema,
                        security,
                        schema_type,
                        mode,
                    }),
                )
            }),
        (any::<u32>(), any::<u32>(), any::<i32>(), ".{0,40}", security(), any::<u32>(), any::<bool>(), any::<bool>())
            .prop_map(|(protocol_version, software_version, ack_code, schema, security, schema_type, permit_sync, require_peer_convert)| {
                (
                    MessageType::Response,
                    Payload::AbilityAck(AbilitySyncAckPacket {
                        protocol_version,
                        software_version,
                        ack_code,
                        schema,
                        security,
                        schema_type,
                        permit_sync,
                        require_peer_convert,
                    }),
                )
            }),
        (vec(data_item(), 0..8), any::<u64>(), any::<u64>(), any::<u64>(), any::<i32>(), sync_mode(), any::<u32>())
            .prop_map(|(data, end_watermark, local_watermark, peer_watermark, send_code, mode, flag)| {
                (
                    MessageType::Request,
                    Payload::DataRequest(DataRequestPacket {
                        data,
                        end_watermark,
                        local_watermark,
                        peer_watermark,
                        send_code,
                        mode,
                        flag,
                    }),
                )
            }),
        (any::<u64>(), any::<i32>()).prop_map(|(data, recv_code)| {
            (MessageType::Response, Payload::DataAck(DataAckPacket { data, recv_code }))
        }),
        Just((MessageType::Notify, Payload::DataChanged)),
    ]
}

fn multi_ver_payload() -> impl Strategy<Value = (MessageType, Payload)> {
    prop_oneof![
        btree_map("[a-z]{1,8}", commit_node(), 0..4).prop_map(|latest_commits| {
            (
                MessageType::Request,
                Payload::CommitHistoryRequest(CommitHistoryRequestPacket { latest_commits }),
            )
        }),
        (any::<i32>(), vec(commit_node(), 0..4)).prop_map(|(err_code, commits)| {
            (
                MessageType::Response,
                Payload::CommitHistoryAck(CommitHistoryAckPacket { err_code, commits }),
            )
        }),
        (any::<i32>(), commit_node()).prop_map(|(err_code, commit)| {
            (
                MessageType::Request,
                Payload::MultiVerRequest(MultiVerRequestPacket { err_code, commit }),
            )
        }),
        (any::<i32>(), vec(multi_ver_entry(), 0..4)).prop_map(|(err_code, entries)| {
            (
                MessageType::Response,
                Payload::MultiVerAck(MultiVerAckPacket { err_code, entries }),
            )
        }),
        (any::<i32>(), any::<[u8; 32]>()).prop_map(|(err_code, hash)| {
            (
                MessageType::Request,
                Payload::ValueSliceRequest(ValueSliceHashPacket { err_code, hash }),
            )
        }),
        (any::<i32>(), vec(any::<u8>(), 0..512)).prop_map(|(err_code, slice)| {
            (
                MessageType::Response,
                Payload::ValueSliceAck(ValueSlicePacket { err_code, slice }),
            )
        }),
    ]
}

fn payload() -> impl Strategy<Value = (MessageType, Payload)> {
    prop_oneof![single_ver_payload(), multi_ver_payload()]
}

fn message() -> impl Strategy<Value = Message> {
    (payload(), any::<u32>(), any::<u32>(), any::<i32>()).prop_map(
        |((message_type, payload), session_id, sequence_id, error_no)| {
            let mut message = Message::new(message_type, session_id, sequence_id, payload);
            message.error_no = error_no;
            message
        },
    )
}

proptest! {
    #[test]
    fn message_roundtrip(message in message()) {
        let bytes = message.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, message);
    }

    #[test]
    fn calculated_len_matches_encoding(message in message()) {
        let bytes = message.encode().unwrap();
        prop_assert_eq!(message.calculate_len(), bytes.len());
        prop_assert_eq!(bytes.len() % 8, 0);
    }

    #[test]
    fn any_length_change_is_rejected(message in message(), cut in 1usize..16) {
        let bytes = message.encode().unwrap();
        if cut < bytes.len() {
            prop_assert!(Message::decode(&bytes[..bytes.len() - cut]).is_err());
        }
        let mut longer = bytes.clone();
        longer.extend(std::iter::repeat(0u8).take(cut));
        prop_assert!(Message::decode(&longer).is_err());
    }

    #[test]
    fn header_decodes_from_prefix(message in message()) {
        let bytes = message.encode().unwrap();
        let header = MessageHeader::decode(&bytes).unwrap();
        prop_assert_eq!(header.message_id, message.message_id());
        prop_assert_eq!(header.session_id, message.session_id);
        prop_assert_eq!(header.body_len as usize, bytes.len() - HEADER_LEN);
    }
}
