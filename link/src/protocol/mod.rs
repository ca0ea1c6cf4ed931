// RTLINK — PROTOCOL MODULE
// On-wire header sizes and the fixed-layout records carried in UDP payloads.

pub mod wire;
