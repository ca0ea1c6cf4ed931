// RTLINK — NETWORK MODULE
// Pure IPv4/UDP framing plus the cold-path helpers that find addresses.

pub mod frame;
pub mod resolve;

pub use frame::{
    build_udp_over_ip_frame, fold, internet_checksum, sum_words, udp_payload, validate_frame,
    Endpoint, FrameTemplate,
};
pub use resolve::{interface_index, interface_ipv4, interface_mtu, resolve_link_address, MacAddr};
