//! Length-prefixed envelope framing.
//!
//! # Wire Protocol
//!
//! Frames are sent with a 4-byte length prefix (big-endian u32) followed by
//! the postcard-encoded envelope:
//!
//! ```text
//! [4-byte length] [envelope data]
//! ```
//!
//! The same framing is used on every peer connection, TCP or Unix socket.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GridError, Result};
use crate::protocol::envelope::Envelope;
use crate::protocol::registration::{RegistrationData, REGISTRATION_LEN};

/// Maximum frame size (100 MB).
///
/// Rejects frames that would allocate excessively large buffers before the
/// allocation happens.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Writes one envelope as a length-prefixed frame and flushes.
pub async fn write_frame<W>(stream: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let data = postcard::to_stdvec(envelope)?;
    let len = data.len() as u32;

    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing length prefix"))?;
    stream
        .write_all(&data)
        .await
        .map_err(|e| map_io_error(e, "writing frame data"))?;
    stream
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;

    Ok(())
}

/// Reads one length-prefixed envelope frame.
///
/// # Errors
///
/// Returns an error if the peer closed the connection, the frame exceeds
/// [`MAX_FRAME_SIZE`], or decoding fails.
pub async fn read_frame<R>(stream: &mut R) -> Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| map_io_error(e, "reading length prefix"))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(GridError::Transport(format!(
            "frame too large: {} bytes (max {} bytes)",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading frame data"))?;

    Ok(postcard::from_bytes(&buf)?)
}

/// Writes the fixed-size registration block.
pub async fn write_registration<W>(stream: &mut W, reg: &RegistrationData) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = reg.to_bytes();
    stream
        .write_all(&bytes)
        .await
        .map_err(|e| map_io_error(e, "writing registration block"))?;
    stream
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing registration block"))?;
    Ok(())
}

/// Reads and validates the fixed-size registration block.
///
/// The caller is responsible for bounding this with a deadline; a peer that
/// never identifies itself is a failed connection.
pub async fn read_registration<R>(stream: &mut R) -> Result<RegistrationData>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; REGISTRATION_LEN];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading registration block"))?;
    RegistrationData::from_bytes(&buf)
}

/// Map IO errors to transport error variants.
///
/// Timeouts become `Timeout`, connection-loss kinds become `Connection`,
/// everything else stays an IO error.
fn map_io_error(err: std::io::Error, context: &str) -> GridError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => GridError::Timeout(0),
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::NotConnected => {
            GridError::Connection(format!("{}: connection lost", context))
        }
        _ => GridError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ControlMessage, RouterInfoMessage};
    use crate::protocol::registration::RegistrationData;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let env = Envelope::pack(&ControlMessage::new("go", "{}")).unwrap();
        write_frame(&mut a, &env).await.unwrap();

        let back = read_frame(&mut b).await.unwrap();
        assert_eq!(back.routing_name, "ControlMessage");
        let msg: ControlMessage = back.unpack().unwrap();
        assert_eq!(msg.command, "go");
    }

    #[tokio::test]
    async fn test_frames_preserve_order() {
        let (mut a, mut b) = tokio::io::duplex(65536);

        for port in 0..50u16 {
            let env = Envelope::pack(&RouterInfoMessage { message_port: port }).unwrap();
            write_frame(&mut a, &env).await.unwrap();
        }
        for port in 0..50u16 {
            let env = read_frame(&mut b).await.unwrap();
            let msg: RouterInfoMessage = env.unpack().unwrap();
            assert_eq!(msg.message_port, port);
        }
    }

    #[tokio::test]
    async fn test_registration_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(256);

        let reg = RegistrationData::executor(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        write_registration(&mut a, &reg).await.unwrap();

        let back = read_registration(&mut b).await.unwrap();
        assert_eq!(back, reg);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(256);

        let len = (MAX_FRAME_SIZE as u32) + 1;
        tokio::io::AsyncWriteExt::write_all(&mut a, &len.to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("frame too large"));
    }

    #[tokio::test]
    async fn test_closed_stream_is_connection_error() {
        let (a, mut b) = tokio::io::duplex(256);
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, GridError::Connection(_)));
    }
}
