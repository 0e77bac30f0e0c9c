//! Persistent framed TCP channel.
//!
//! Frames use the `u32` length prefix from [`crate::framing`] around a socket
//! frame body from [`crate::codec`]. One read loop and one send loop run per
//! connection; the send loop is the only writer.

use std::time::Instant;

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    ChannelContext, ChannelCore, ChannelSettings, CloseReason, Endpoint, OpenInfo, TransportError,
};
use crate::codec::WireCodec;
use crate::framing::{FrameError, FramedReader, write_frame};
use crate::platform::configure_stream;

/// Socket channel state.
pub struct SocketChannel {
    pub(crate) core: ChannelCore,
    settings: ChannelSettings,
}

impl SocketChannel {
    pub(crate) fn new(core: ChannelCore, settings: ChannelSettings) -> Self {
        Self { core, settings }
    }

    pub(crate) async fn connect(&self, endpoint: Endpoint, ctx: ChannelContext) {
        let cancel = self.core.cancel_token();
        let started = Instant::now();

        let opening = tokio::time::timeout(self.settings.connect_timeout, open_stream(&endpoint));
        let stream = tokio::select! {
            _ = cancel.cancelled() => {
                self.core.shut(&ctx.sink, CloseReason::Local).await;
                return;
            }
            result = opening => {
                match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        self.core.shut(&ctx.sink, e.into()).await;
                        return;
                    }
                    Err(_) => {
                        self.core.shut(&ctx.sink, TransportError::Timeout("connect").into()).await;
                        return;
                    }
                }
            }
        };

        if let Err(e) = configure_stream(&stream, &self.settings.socket) {
            tracing::warn!(attempt = ctx.sink.attempt(), "Failed to apply socket options: {e}");
        }
        let Some(rx) = self.core.take_receiver() else {
            self.core.shut(&ctx.sink, TransportError::Closed.into()).await;
            return;
        };

        let info = OpenInfo {
            connect_latency: started.elapsed(),
            handshake_latency: None,
        };
        tracing::info!(
            attempt = ctx.sink.attempt(),
            %endpoint,
            latency = ?info.connect_latency,
            "Socket connected"
        );
        self.core.set_connected(true);
        ctx.sink.opened(info).await;

        let (reader, writer) = stream.into_split();
        let max_batch = self.settings.max_batch.max(1);
        // Whichever loop stops first decides the reason; the other is dropped.
        let reason = tokio::select! {
            reason = read_loop(&ctx, &cancel, reader) => reason,
            reason = send_loop(&ctx, &cancel, max_batch, writer, rx) => reason,
        };
        self.core.shut(&ctx.sink, reason).await;
    }
}

async fn open_stream(endpoint: &Endpoint) -> Result<TcpStream, TransportError> {
    let target = endpoint.host_port()?;
    let addrs: Vec<_> = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| TransportError::Resolve {
            address: target.clone(),
            reason: e.to_string(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Resolve {
            address: target,
            reason: "no addresses".into(),
        });
    }

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(TransportError::Connect(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotConnected, "no address connected")
    })))
}

async fn read_loop(
    ctx: &ChannelContext,
    cancel: &CancellationToken,
    reader: OwnedReadHalf,
) -> CloseReason {
    // Room for the batch marker on top of a maximal payload.
    let max = ctx.codec.config().max_frame_size + 2;
    let mut framed = FramedReader::new(reader, max);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return CloseReason::Local,
            frame = framed.next_frame() => frame,
        };
        let body = match frame {
            Ok(body) => body,
            Err(FrameError::ConnectionClosed) => return TransportError::Closed.into(),
            Err(FrameError::Io(e)) => return TransportError::Io(e).into(),
            Err(e @ FrameError::TooLarge { .. }) => {
                // The stream cannot be resynchronized past an oversized frame.
                return TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e.to_string(),
                ))
                .into();
            }
        };

        ctx.activity.touch_inbound();
        let wire_len = body.len() + 4;
        match ctx.codec.parse_stream(body) {
            Ok(payloads) => {
                ctx.traffic.record_receive(wire_len, payloads.len());
                for payload in payloads {
                    ctx.sink.data(payload).await;
                }
            }
            Err(e) => {
                tracing::warn!(attempt = ctx.sink.attempt(), "Dropping malformed frame: {e}");
            }
        }
    }
}

async fn send_loop(
    ctx: &ChannelContext,
    cancel: &CancellationToken,
    max_batch: usize,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
) -> CloseReason {
    let max_frame = ctx.codec.config().max_frame_size + 2;
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => return CloseReason::Local,
            next = rx.recv() => match next {
                Some(payload) => payload,
                None => return CloseReason::Local,
            },
        };
        let mut queued = vec![first];
        while queued.len() < max_batch {
            match rx.try_recv() {
                Ok(payload) => queued.push(payload),
                Err(_) => break,
            }
        }

        let inbound_before = ctx.activity.inbound_count();
        for (body, count) in plan_writes(&ctx.codec, queued) {
            let body = match body {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(attempt = ctx.sink.attempt(), "Dropping unencodable batch: {e}");
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut writer, &body, max_frame).await {
                return match e {
                    FrameError::Io(e) => TransportError::Io(e).into(),
                    other => TransportError::Io(std::io::Error::other(other.to_string())).into(),
                };
            }
            ctx.traffic.record_send(body.len() + 4, count);
            tracing::trace!(
                attempt = ctx.sink.attempt(),
                bytes = body.len(),
                messages = count,
                "Frame written"
            );
        }
        if rx.is_empty() {
            ctx.activity.mark_drained(inbound_before);
        }
    }
}

/// Group queued payloads into frame bodies, preserving order: runs of
/// payloads below the compression threshold share a batch, payloads at or
/// above it go alone so they can be compressed.
pub(crate) fn plan_writes(
    codec: &WireCodec,
    queued: Vec<Vec<u8>>,
) -> Vec<(Result<Vec<u8>, crate::codec::EncodeError>, usize)> {
    let compression = &codec.config().compression;
    let mut writes = Vec::new();
    let mut run: Vec<Vec<u8>> = Vec::new();

    for payload in queued {
        if compression.should_compress(payload.len()) {
            if !run.is_empty() {
                let count = run.len();
                writes.push((codec.frame_batch(&run), count));
                run.clear();
            }
            writes.push((Ok(codec.frame_stream(&payload)), 1));
        } else {
            run.push(payload);
        }
    }
    if !run.is_empty() {
        let count = run.len();
        writes.push((codec.frame_batch(&run), count));
    }
    writes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelEvent, ChannelKind, ChannelNotice, EventSink};
    use crate::codec::{STREAM_BATCH, STREAM_COMPRESSED, STREAM_MARKER};
    use crate::heartbeat::Activity;
    use crate::stats::TrafficCounters;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn context(attempt: u64) -> (ChannelContext, mpsc::Receiver<ChannelNotice>) {
        let (tx, rx) = mpsc::channel(64);
        let ctx = ChannelContext {
            sink: EventSink::new(attempt, tx),
            activity: Arc::new(Activity::new()),
            traffic: Arc::new(TrafficCounters::new()),
            codec: Arc::new(WireCodec::default()),
            handshake: Vec::new(),
        };
        (ctx, rx)
    }

    fn spawn_connect(
        channel: &Arc<Channel>,
        endpoint: Endpoint,
        ctx: ChannelContext,
    ) -> tokio::task::JoinHandle<()> {
        let channel = Arc::clone(channel);
        tokio::spawn(async move { channel.connect(endpoint, ctx).await })
    }

    #[test]
    fn test_plan_writes_keeps_order_and_isolates_large() {
        let codec = WireCodec::default();
        let big = vec![0x82u8; 20_000];
        let writes = plan_writes(
            &codec,
            vec![vec![0x80], vec![0x81], big, vec![0x83]],
        );
        let counts: Vec<usize> = writes.iter().map(|(_, n)| *n).collect();
        assert_eq!(counts, vec![2, 1, 1]);

        let bodies: Vec<Vec<u8>> = writes.into_iter().map(|(b, _)| b.unwrap()).collect();
        assert_eq!(&bodies[0][..2], &[STREAM_MARKER, STREAM_BATCH]);
        assert_eq!(&bodies[1][..2], &[STREAM_MARKER, STREAM_COMPRESSED]);
        assert_eq!(bodies[2], vec![0x83]);
    }

    #[tokio::test]
    async fn test_connect_refused_reports_closed() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let channel = Arc::new(Channel::new(
            ChannelKind::Socket,
            &ChannelSettings::default(),
            CancellationToken::new(),
        ));
        let (ctx, mut rx) = context(1);
        spawn_connect(&channel, Endpoint::new(ChannelKind::Socket, "127.0.0.1", Some(port)), ctx);

        let notice = rx.recv().await.unwrap();
        assert!(matches!(
            notice.event,
            ChannelEvent::Closed(CloseReason::Failed(TransportError::Connect(_)))
        ));
        assert!(channel.is_started());
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_open_send_receive_and_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut framed = FramedReader::new(read, 1 << 20);
            let body = framed.next_frame().await.unwrap().to_vec();
            // Echo the body back, then a malformed frame, then close.
            write_frame(&mut write, &body, 1 << 20).await.unwrap();
            write_frame(&mut write, &[STREAM_MARKER, 0x01], 1 << 20).await.unwrap();
            write_frame(&mut write, &body, 1 << 20).await.unwrap();
            write.shutdown().await.unwrap();
        });

        let channel = Arc::new(Channel::new(
            ChannelKind::Socket,
            &ChannelSettings::default(),
            CancellationToken::new(),
        ));
        let (ctx, mut rx) = context(5);
        let traffic = Arc::clone(&ctx.traffic);
        spawn_connect(&channel, Endpoint::new(ChannelKind::Socket, "127.0.0.1", Some(port)), ctx);

        let opened = rx.recv().await.unwrap();
        assert!(matches!(opened.event, ChannelEvent::Opened(_)));
        assert!(channel.is_connected());

        channel.send(vec![0x80]).unwrap();
        for _ in 0..2 {
            let notice = rx.recv().await.unwrap();
            assert_eq!(notice.attempt, 5);
            match notice.event {
                ChannelEvent::Data(payload) => assert_eq!(payload, vec![0x80]),
                other => panic!("expected data, got {other:?}"),
            }
        }
        let closed = rx.recv().await.unwrap();
        assert!(matches!(
            closed.event,
            ChannelEvent::Closed(CloseReason::Failed(TransportError::Closed))
        ));
        assert!(!channel.is_connected());
        assert_eq!(traffic.snapshot().messages_sent, 1);
        assert_eq!(traffic.snapshot().messages_received, 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_reports_local_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let channel = Arc::new(Channel::new(
            ChannelKind::Socket,
            &ChannelSettings::default(),
            CancellationToken::new(),
        ));
        let (ctx, mut rx) = context(2);
        spawn_connect(&channel, Endpoint::new(ChannelKind::Socket, "127.0.0.1", Some(port)), ctx);
        assert!(matches!(rx.recv().await.unwrap().event, ChannelEvent::Opened(_)));

        channel.disconnect();
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(closed.event, ChannelEvent::Closed(CloseReason::Local)));
    }

    #[tokio::test]
    async fn test_drain_is_marked_after_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let channel = Arc::new(Channel::new(
            ChannelKind::Socket,
            &ChannelSettings::default(),
            CancellationToken::new(),
        ));
        let (ctx, mut rx) = context(2);
        let activity = Arc::clone(&ctx.activity);
        let mut drained = activity.subscribe_drained();
        spawn_connect(&channel, Endpoint::new(ChannelKind::Socket, "127.0.0.1", Some(port)), ctx);
        assert!(matches!(rx.recv().await.unwrap().event, ChannelEvent::Opened(_)));

        channel.send(vec![0x80]).unwrap();
        tokio::time::timeout(Duration::from_secs(1), drained.changed())
            .await
            .unwrap()
            .unwrap();
        channel.disconnect();
    }
}
