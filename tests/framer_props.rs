//! Property tests for the stream framer
//!
//! The framer's contract: for any list of messages encoded, concatenated,
//! and split at arbitrary byte boundaries, it yields the original messages,
//! in order, without losing or duplicating bytes.

use bytes::Bytes;
use pglink::protocol::{BackendMessage, Framer, Notification, TransactionStatus};
use proptest::prelude::*;

/// A generated message together with its wire frame.
#[derive(Debug, Clone)]
struct WireMessage {
    expected: BackendMessage,
    frame: Vec<u8>,
}

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn command_tag() -> impl Strategy<Value = String> {
    "[A-Z][A-Z0-9 ]{0,18}"
}

fn arb_message() -> impl Strategy<Value = WireMessage> {
    prop_oneof![
        // zero-byte body
        Just(WireMessage {
            expected: BackendMessage::ParseComplete,
            frame: frame(b'1', b""),
        }),
        Just(WireMessage {
            expected: BackendMessage::BindComplete,
            frame: frame(b'2', b""),
        }),
        prop_oneof![Just(b'I'), Just(b'T'), Just(b'E')].prop_map(|status| WireMessage {
            expected: BackendMessage::ReadyForQuery(TransactionStatus::from_byte(status)),
            frame: frame(b'Z', &[status]),
        }),
        command_tag().prop_map(|tag| {
            let mut body = tag.clone().into_bytes();
            body.push(0);
            WireMessage {
                expected: BackendMessage::CommandComplete(tag),
                frame: frame(b'C', &body),
            }
        }),
        prop::collection::vec(
            prop::option::of(prop::collection::vec(any::<u8>(), 0..32)),
            0..6
        )
        .prop_map(|columns| {
            let mut body = (columns.len() as i16).to_be_bytes().to_vec();
            for column in &columns {
                match column {
                    Some(data) => {
                        body.extend_from_slice(&(data.len() as i32).to_be_bytes());
                        body.extend_from_slice(data);
                    }
                    None => body.extend_from_slice(&(-1i32).to_be_bytes()),
                }
            }
            WireMessage {
                expected: BackendMessage::DataRow(
                    columns
                        .into_iter()
                        .map(|c| c.map(Bytes::from))
                        .collect(),
                ),
                frame: frame(b'D', &body),
            }
        }),
        ("[a-z_]{1,12}", "[a-z0-9./]{0,16}").prop_map(|(channel, payload)| {
            let mut body = 7i32.to_be_bytes().to_vec();
            body.extend_from_slice(channel.as_bytes());
            body.push(0);
            body.extend_from_slice(payload.as_bytes());
            body.push(0);
            WireMessage {
                expected: BackendMessage::NotificationResponse(Notification {
                    process_id: 7,
                    channel,
                    payload,
                }),
                frame: frame(b'A', &body),
            }
        }),
        // a tag this client does not interpret
        prop::collection::vec(any::<u8>(), 0..24).prop_map(|body| WireMessage {
            expected: BackendMessage::Unknown {
                tag: b'V',
                body: Bytes::from(body.clone()),
            },
            frame: frame(b'V', &body),
        }),
    ]
}

proptest! {
    #[test]
    fn reassembles_any_chunk_splitting(
        messages in prop::collection::vec(arb_message(), 1..16),
        cut_points in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
    ) {
        let stream: Vec<u8> = messages.iter().flat_map(|m| m.frame.clone()).collect();

        let mut cuts: Vec<usize> = cut_points.iter().map(|i| i.index(stream.len() + 1)).collect();
        cuts.push(0);
        cuts.push(stream.len());
        cuts.sort_unstable();
        cuts.dedup();

        let mut framer = Framer::new();
        let mut decoded = Vec::new();
        for window in cuts.windows(2) {
            framer.extend(&stream[window[0]..window[1]]);
            while let Some(msg) = framer.next_message().unwrap() {
                decoded.push(msg);
            }
        }

        let expected: Vec<BackendMessage> = messages.into_iter().map(|m| m.expected).collect();
        prop_assert_eq!(decoded, expected);
        prop_assert_eq!(framer.pending_bytes(), 0);
    }

    #[test]
    fn byte_at_a_time_never_loses_a_message(messages in prop::collection::vec(arb_message(), 1..8)) {
        let stream: Vec<u8> = messages.iter().flat_map(|m| m.frame.clone()).collect();

        let mut framer = Framer::new();
        let mut decoded = Vec::new();
        for byte in &stream {
            framer.extend(std::slice::from_ref(byte));
            while let Some(msg) = framer.next_message().unwrap() {
                decoded.push(msg);
            }
        }

        let expected: Vec<BackendMessage> = messages.into_iter().map(|m| m.expected).collect();
        prop_assert_eq!(decoded, expected);
    }
}
