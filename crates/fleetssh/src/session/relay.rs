use bytes::Bytes;
use fleet_protocol::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::sink::EventSender;

const RELAY_CHUNK: usize = 4096;

/// Copies `reader` into the sink as `stream` events until EOF or until the
/// consumer stops listening.
pub(super) async fn relay<R>(mut reader: R, stream: Stream, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; RELAY_CHUNK];
    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                debug!(stream = stream.tag(), error = %err, "relay read failed");
                break;
            }
        };
        if !events
            .send(stream, Bytes::copy_from_slice(&buffer[..read]))
            .await
        {
            debug!(stream = stream.tag(), "collector closed, relay stopping");
            break;
        }
    }
}
