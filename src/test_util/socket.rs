use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::net::send_socket::SendSocket;
use crate::wire::message::Frame;

/// A [SendSocket] that keeps everything sent through it, decoded into frames
#[derive(Default)]
pub struct RecordingSocket {
    sent: Mutex<Vec<(SocketAddr, Frame)>>,
}

impl RecordingSocket {
    pub fn frames(&self) -> Vec<(SocketAddr, Frame)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl SendSocket for RecordingSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        match Frame::decode(packet_buf) {
            Ok(frame) => self.sent.lock().unwrap().push((to, frame)),
            Err(e) => panic!("sent an undecodable packet: {}", e),
        }
    }
}
