//! Plugin side of a `Register` stream

use crate::protocol::{
    spawn_writer, FrameReader, FrameWriter, PluginMessage, StreamHeader, StreamSender,
    TransportResult,
};
use crate::sdk::error::{SdkError, SdkResult};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// An open stream to the host
pub struct HostStream {
    pub reader: FrameReader<OwnedReadHalf>,
    pub sender: StreamSender<PluginMessage>,
    pub writer: JoinHandle<TransportResult<()>>,
}

impl HostStream {
    /// Stop sending and wait for queued messages to be flushed
    pub async fn finish(self) -> SdkResult<()> {
        self.sender.close();
        match self.writer.await {
            Ok(result) => match result {
                Ok(()) => Ok(()),
                Err(e) if e.is_disconnect() => Ok(()),
                Err(e) => Err(e.into()),
            },
            Err(e) => {
                log::debug!("HostStream: writer task ended abnormally: {}", e);
                Ok(())
            }
        }
    }
}

/// Connect to the host and open the `Register` method
pub async fn connect(addr: &str) -> SdkResult<HostStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| SdkError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();

    FrameWriter::new(&mut write_half)
        .send(&StreamHeader::register())
        .await?;
    log::debug!("HostStream: connected to {}", addr);

    let (sender, writer) = spawn_writer(write_half);
    Ok(HostStream {
        reader: FrameReader::new(read_half),
        sender,
        writer,
    })
}
