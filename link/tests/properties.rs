use std::net::Ipv4Addr;

use proptest::prelude::*;

use rtlink::net::{build_udp_over_ip_frame, fold, internet_checksum, sum_words, validate_frame};
use rtlink::protocol::wire::{HEADERS_LEN, IP_HDR_LEN};
use rtlink::ring::loopback::Side;
use rtlink::ring::RingCursor;
use rtlink::{Endpoint, FaultPolicy, MacAddr, PacketType, RingTransport, SpikeRecord};

/// Straightforward RFC 1071: pad, add 16-bit words in a wide accumulator,
/// fold until no carry is left, complement.
fn reference_checksum(data: &[u8]) -> u16 {
    let mut padded = data.to_vec();
    if padded.len() % 2 == 1 {
        padded.push(0);
    }
    let mut sum: u64 = padded.chunks(2).map(|w| ((w[0] as u64) << 8) | w[1] as u64).sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn endpoint_strategy() -> impl Strategy<Value = Endpoint> {
    (any::<u32>(), any::<u32>(), any::<u16>(), any::<u16>())
        .prop_filter("distinct addresses", |(a, b, _, _)| a != b)
        .prop_map(|(a, b, sp, dp)| Endpoint {
            local_ip: Ipv4Addr::from(a),
            remote_ip: Ipv4Addr::from(b),
            src_port: sp,
            dst_port: dp,
            remote_mac: MacAddr([2, 0, 0, 0, 0, 2]),
        })
}

proptest! {
    #[test]
    fn checksum_matches_reference(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
        prop_assert_eq!(internet_checksum(&data), reference_checksum(&data));
    }

    #[test]
    fn built_frames_verify(ep in endpoint_strategy(), payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut buf = vec![0u8; HEADERS_LEN + payload.len()];
        buf[HEADERS_LEN..].copy_from_slice(&payload);
        let len = build_udp_over_ip_frame(&mut buf, payload.len(), &ep);
        prop_assert_eq!(len, buf.len());
        prop_assert_eq!(internet_checksum(&buf[..IP_HDR_LEN]), 0);

        let mut pseudo = buf[12..20].to_vec();
        pseudo.extend_from_slice(&[0, 17]);
        pseudo.extend_from_slice(&buf[24..26]);
        prop_assert_eq!(fold(sum_words(&buf[IP_HDR_LEN..], sum_words(&pseudo, 0))), 0);
    }

    #[test]
    fn filter_rejects_any_single_field_change(
        ep in endpoint_strategy(),
        field in 0usize..4,
        delta in 1u32..,
    ) {
        let peer = ep.mirrored(MacAddr([2, 0, 0, 0, 0, 1]));
        let mut buf = vec![0u8; HEADERS_LEN + 20];
        build_udp_over_ip_frame(&mut buf, 20, &peer);
        prop_assert!(validate_frame(&buf, &ep));

        match field {
            0 => {
                let v = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]) ^ delta;
                buf[12..16].copy_from_slice(&v.to_be_bytes());
            }
            1 => {
                let v = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]) ^ delta;
                buf[16..20].copy_from_slice(&v.to_be_bytes());
            }
            2 => {
                let v = u16::from_be_bytes([buf[20], buf[21]]) ^ (delta as u16 | 1);
                buf[20..22].copy_from_slice(&v.to_be_bytes());
            }
            _ => {
                let v = u16::from_be_bytes([buf[22], buf[23]]) ^ (delta as u16 | 1);
                buf[22..24].copy_from_slice(&v.to_be_bytes());
            }
        }
        prop_assert!(!validate_frame(&buf, &ep));
    }

    #[test]
    fn cursor_never_laps_release(depth in 1usize..16, ops in proptest::collection::vec(any::<bool>(), 0..200)) {
        let mut c = RingCursor::new(depth);
        let mut expected_release = 0u64;
        for advance in ops {
            if advance && !c.is_full() {
                let idx = c.index();
                c.advance();
                prop_assert_eq!(idx as u64, (c.current() - 1) % depth as u64);
            } else if let Some(idx) = c.release() {
                prop_assert_eq!(idx as u64, expected_release % depth as u64);
                expected_release += 1;
            }
            prop_assert!(c.released() <= c.current());
            prop_assert!(c.current() - c.released() <= depth as u64);
            prop_assert_eq!(c.released(), expected_release);
        }
    }

    #[test]
    fn transport_delivers_in_order_without_duplicates(
        ops in proptest::collection::vec(prop_oneof![(1usize..6).prop_map(Some), Just(None)], 1..40),
        noise in any::<bool>(),
    ) {
        let ep = Endpoint {
            local_ip: Ipv4Addr::new(10, 1, 0, 1),
            remote_ip: Ipv4Addr::new(10, 1, 0, 2),
            src_port: 4000,
            dst_port: 4001,
            remote_mac: MacAddr([2, 0, 0, 0, 0, 2]),
        };
        let (mut tx, mut rx, wire) = RingTransport::pair(ep, MacAddr([2, 0, 0, 0, 0, 1]), 8, FaultPolicy::Strict).unwrap();
        // Noise differs from real traffic only in its source port.
        let stranger = Endpoint { src_port: 9, ..ep };
        let mut genuine = vec![0u8; HEADERS_LEN + 20];
        build_udp_over_ip_frame(&mut genuine, 20, &ep);
        let mut junk = genuine.clone();
        build_udp_over_ip_frame(&mut junk, 20, &stranger);
        prop_assert!(validate_frame(&genuine, rx.endpoint()));
        prop_assert!(!validate_frame(&junk, rx.endpoint()));
        prop_assert_eq!(&genuine[..20], &junk[..20]);

        let mut next = 0u64;
        let mut last_seen: Option<u64> = None;

        for op in ops {
            match op {
                Some(n) => {
                    for _ in 0..n {
                        tx.send(&SpikeRecord::new(next, 0, 0, PacketType::Spikes)).unwrap();
                        next += 1;
                    }
                    if noise {
                        wire.inject(Side::B, &junk);
                    }
                }
                None => {
                    let seen: Vec<u64> = rx.receive_nonblocking::<SpikeRecord>().unwrap().into_iter().map(|r| r.timestamp0).collect();
                    for id in seen {
                        prop_assert!(id < next);
                        prop_assert!(last_seen.map_or(true, |l| id > l), "{} after {:?}", id, last_seen);
                        last_seen = Some(id);
                    }
                    prop_assert!(rx.pending_receive() <= rx.depth());
                    rx.free_receive();
                    prop_assert_eq!(rx.pending_receive(), 0);
                }
            }
        }
    }
}
