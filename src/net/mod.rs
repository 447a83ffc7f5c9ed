pub mod send_socket;
pub mod udp;
