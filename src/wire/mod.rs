//! The frame format shared by all transports: a fixed 16 byte header followed by a body of
//!  the length declared in the header. UDP datagrams carry exactly one frame, on TCP the
//!  header's length delimits consecutive frames.

pub mod frame_header;
pub mod message;
pub mod tcp;
