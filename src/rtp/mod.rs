//! RTP transport plumbing
//!
//! Two-way audio and video transport needs a multiplexed RTP/RTCP stream
//! split across two local ports, plus ephemeral UDP ports handed out
//! without double allocation.

pub mod demuxer;
pub mod ports;

pub use demuxer::RtpDemuxer;
pub use ports::PortAllocator;
