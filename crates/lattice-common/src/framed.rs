// Length-framed command IO over any async byte stream.
//
// Every connection in the system has exactly one reader and one writer
// task; the writer is fed through an mpsc channel so sends never block
// the reader side.
use lattice_wire::{Command, DEFAULT_MAX_FRAME_BYTES, HEAD_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Reads one complete frame and decodes it. Returns `Ok(None)` on a clean
/// peer close. The frame length is validated against `max_frame_bytes`
/// before the body is allocated.
pub async fn read_command<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Command>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEAD_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if declared < HEAD_LEN {
        return Err(Error::Wire(lattice_wire::Error::LengthMismatch {
            declared: declared as u32,
            actual: HEAD_LEN,
        }));
    }
    if declared > max_frame_bytes {
        return Err(Error::Wire(lattice_wire::Error::FrameTooLarge(declared)));
    }
    let mut frame = vec![0u8; declared];
    frame[..HEAD_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEAD_LEN..]).await?;
    Ok(Some(Command::decode(&frame)?))
}

/// Convenience wrapper using the default frame size cap.
pub async fn read_command_default<R>(reader: &mut R) -> Result<Option<Command>>
where
    R: AsyncRead + Unpin,
{
    read_command(reader, DEFAULT_MAX_FRAME_BYTES).await
}

/// Encodes and writes one frame.
pub async fn write_command<W>(writer: &mut W, command: &Command) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = command.encode()?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Drains an mpsc channel onto a socket; one of these runs per
/// connection so frame writes from different tasks never interleave.
/// Exits when the channel closes or the peer stops accepting writes.
pub async fn run_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Command>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        if let Err(err) = write_command(&mut writer, &command).await {
            tracing::debug!(error = %err, "writer task stopping");
            break;
        }
    }
}
