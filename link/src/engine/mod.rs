// RTLINK — ENGINE
// Clock, clock-sync protocol and real-time process setup.

pub mod clock;
pub mod realtime;
pub mod sync;
