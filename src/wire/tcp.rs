use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::frame_header::FrameHeader;
use crate::wire::message::Frame;

/// Reads the next frame from a TCP stream. The header's length field delimits frames.
///
/// Returns `None` if the peer closed the connection cleanly at a frame boundary, and an error
///  if it closed in the middle of a frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Option<Frame>> {
    let mut header_buf = [0u8; FrameHeader::SERIALIZED_LEN];

    let mut num_read = 0;
    while num_read < header_buf.len() {
        let n = reader.read(&mut header_buf[num_read..]).await?;
        if n == 0 {
            if num_read == 0 {
                return Ok(None);
            }
            bail!("connection closed after {} bytes of a frame header", num_read);
        }
        num_read += n;
    }

    let header = FrameHeader::deser(&mut header_buf.as_slice())?;

    let mut body = BytesMut::zeroed(header.len as usize);
    reader.read_exact(&mut body).await?;

    Ok(Some(Frame {
        header,
        body: Bytes::from(body),
    }))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> anyhow::Result<()> {
    writer.write_all(&frame.to_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::wire::message::ControlMessage;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_write_read_sequence() {
        let (mut client, mut server) = duplex(1024);

        let frames = vec![
            Frame::control(&ControlMessage::Login { username: "u".to_string(), password: "p".to_string() }, 0),
            Frame::data(1, 2, vec![1u8, 2, 3, 4]).unwrap(),
            Frame::data(1, 2, Vec::<u8>::new()).unwrap(),
            Frame::control(&ControlMessage::EndOfSnapshot { id: ChannelId::new("md1"), seq_no: 5, ok: true }, 0),
        ];
        for frame in &frames {
            write_frame(&mut client, frame).await.unwrap();
        }
        drop(client);

        for frame in &frames {
            assert_eq!(read_frame(&mut server).await.unwrap().as_ref(), Some(frame));
        }
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eof_inside_header() {
        let (mut client, mut server) = duplex(1024);
        let bytes = Frame::data(1, 2, vec![1u8]).unwrap().to_bytes();
        client.write_all(&bytes[..5]).await.unwrap();
        drop(client);

        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_inside_body() {
        let (mut client, mut server) = duplex(1024);
        let bytes = Frame::data(1, 2, vec![1u8, 2, 3]).unwrap().to_bytes();
        client.write_all(&bytes[..bytes.len() - 1]).await.unwrap();
        drop(client);

        assert!(read_frame(&mut server).await.is_err());
    }
}
