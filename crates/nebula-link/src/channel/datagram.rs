//! Reliable datagram channel: UDP carrying an [`ArqLink`] conversation.
//!
//! Every reassembled ARQ message is one datagram frame from
//! [`crate::codec`]. The client opens with a handshake frame and the channel
//! only reports `Opened` once the server answers with its own handshake.
//! A fixed tick drives retransmission, keepalive heartbeat frames and the
//! idle timeout, and it runs whether or not user data is queued.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::arq::ArqLink;
use super::{
    ChannelContext, ChannelCore, ChannelSettings, CloseReason, Endpoint, OpenInfo, TransportError,
};
use crate::codec::{DatagramFrame, Opcode};
use crate::platform::local_bind_for;

const RECV_BUFFER: usize = 64 * 1024;

/// Datagram channel state.
pub struct DatagramChannel {
    pub(crate) core: ChannelCore,
    settings: ChannelSettings,
}

impl DatagramChannel {
    pub(crate) fn new(core: ChannelCore, settings: ChannelSettings) -> Self {
        Self { core, settings }
    }

    pub(crate) async fn connect(&self, endpoint: Endpoint, ctx: ChannelContext) {
        let cancel = self.core.cancel_token();
        let started = Instant::now();

        let opening = tokio::time::timeout(self.settings.connect_timeout, open_socket(&endpoint));
        let socket = tokio::select! {
            _ = cancel.cancelled() => {
                self.core.shut(&ctx.sink, CloseReason::Local).await;
                return;
            }
            result = opening => {
                match result {
                    Ok(Ok(socket)) => socket,
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
        let Some(rx) = self.core.take_receiver() else {
            self.core.shut(&ctx.sink, TransportError::Closed.into()).await;
            return;
        };

        let conv = rand::random::<u32>();
        tracing::debug!(
            attempt = ctx.sink.attempt(),
            %endpoint,
            conv,
            "Datagram socket bound, handshaking"
        );
        let mut driver = Driver {
            core: &self.core,
            ctx: &ctx,
            settings: &self.settings,
            socket,
            link: ArqLink::new(conv, self.settings.datagram.arq.clone()),
            connect_latency: started.elapsed(),
            handshake_started: Instant::now(),
            opened: false,
        };
        let reason = tokio::select! {
            _ = cancel.cancelled() => CloseReason::Local,
            reason = driver.run(rx) => reason,
        };
        self.core.shut(&ctx.sink, reason).await;
    }
}

async fn open_socket(endpoint: &Endpoint) -> Result<UdpSocket, TransportError> {
    let target = endpoint.host_port()?;
    let remote: SocketAddr = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| TransportError::Resolve {
            address: target.clone(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| TransportError::Resolve {
            address: target.clone(),
            reason: "no addresses".into(),
        })?;

    let socket = UdpSocket::bind(local_bind_for(remote))
        .await
        .map_err(TransportError::Connect)?;
    socket.connect(remote).await.map_err(TransportError::Connect)?;
    Ok(socket)
}

struct Driver<'a> {
    core: &'a ChannelCore,
    ctx: &'a ChannelContext,
    settings: &'a ChannelSettings,
    socket: UdpSocket,
    link: ArqLink,
    connect_latency: Duration,
    handshake_started: Instant,
    opened: bool,
}

impl Driver<'_> {
    async fn run(&mut self, mut rx: mpsc::Receiver<Vec<u8>>) -> CloseReason {
        let ctx = self.ctx;
        let settings = self.settings;
        let handshake = match ctx.codec.frame_datagram(Opcode::Handshake, &ctx.handshake) {
            Ok(frame) => frame,
            Err(e) => return TransportError::Handshake(e.to_string()).into(),
        };
        if let Err(e) = self.link.send(&handshake) {
            return TransportError::Handshake(e.to_string()).into();
        }

        let dgram = &settings.datagram;
        let mut tick = tokio::time::interval(dgram.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; RECV_BUFFER];
        let mut last_inbound = Instant::now();
        let mut last_heartbeat = Instant::now();

        loop {
            tokio::select! {
                received = self.socket.recv(&mut buf) => {
                    let n = match received {
                        Ok(n) => n,
                        Err(e) => return TransportError::Io(e).into(),
                    };
                    last_inbound = Instant::now();
                    if let Err(e) = self.link.input(&buf[..n]) {
                        tracing::warn!(attempt = ctx.sink.attempt(), "Dropping bad datagram: {e}");
                        continue;
                    }
                    self.deliver().await;
                    if let Err(e) = self.flush().await {
                        return e.into();
                    }
                }
                next = rx.recv(), if self.opened => {
                    let Some(first) = next else {
                        return CloseReason::Local;
                    };
                    let inbound_before = ctx.activity.inbound_count();
                    self.enqueue(first);
                    while let Ok(more) = rx.try_recv() {
                        self.enqueue(more);
                    }
                    if let Err(e) = self.flush().await {
                        return e.into();
                    }
                    if rx.is_empty() {
                        ctx.activity.mark_drained(inbound_before);
                    }
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    if !self.opened
                        && now.duration_since(self.handshake_started) > settings.handshake_timeout
                    {
                        return TransportError::Timeout("handshake").into();
                    }
                    if now.duration_since(last_inbound) > dgram.idle_timeout {
                        return TransportError::Timeout("datagram idle").into();
                    }
                    if self.opened
                        && now.duration_since(last_heartbeat) >= dgram.heartbeat_interval
                    {
                        last_heartbeat = now;
                        let _ = self.link.send(&[Opcode::Heartbeat as u8]);
                    }
                    if let Err(e) = self.flush().await {
                        return e.into();
                    }
                    if self.link.is_dead() {
                        return TransportError::Timeout("retransmission").into();
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, payload: Vec<u8>) {
        let frame = match self.ctx.codec.frame_datagram(Opcode::Request, &payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    attempt = self.ctx.sink.attempt(),
                    "Dropping unencodable message: {e}"
                );
                return;
            }
        };
        match self.link.send(&frame) {
            Ok(()) => self.ctx.traffic.record_send(frame.len(), 1),
            Err(e) => tracing::warn!(attempt = self.ctx.sink.attempt(), "Dropping message: {e}"),
        }
    }

    /// Hand every reassembled message to the sink.
    async fn deliver(&mut self) {
        while let Some(message) = self.link.recv() {
            self.ctx.activity.touch_inbound();
            match self.ctx.codec.parse_datagram(&message) {
                Ok(DatagramFrame::Heartbeat) => {}
                Ok(DatagramFrame::Handshake(_)) if !self.opened => {
                    self.opened = true;
                    let info = OpenInfo {
                        connect_latency: self.connect_latency,
                        handshake_latency: Some(self.handshake_started.elapsed()),
                    };
                    tracing::info!(
                        attempt = self.ctx.sink.attempt(),
                        conv = self.link.conv(),
                        handshake = ?info.handshake_latency,
                        "Datagram channel open"
                    );
                    self.core.set_connected(true);
                    self.ctx.sink.opened(info).await;
                }
                Ok(DatagramFrame::Handshake(_)) => {
                    tracing::debug!(
                        attempt = self.ctx.sink.attempt(),
                        "Ignoring repeated handshake"
                    );
                }
                Ok(DatagramFrame::Data { payload, .. }) if self.opened => {
                    self.ctx.traffic.record_receive(message.len(), 1);
                    self.ctx.sink.data(payload).await;
                }
                Ok(DatagramFrame::Data { .. }) => {
                    tracing::warn!(
                        attempt = self.ctx.sink.attempt(),
                        "Dropping data received before handshake"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = self.ctx.sink.attempt(),
                        "Dropping malformed frame: {e}"
                    );
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.link.flush(Instant::now());
        while let Some(datagram) = self.link.poll_output() {
            self.socket.send(&datagram).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::arq::ArqConfig;
    use crate::channel::{Channel, ChannelEvent, ChannelKind, ChannelNotice, EventSink};
    use crate::codec::WireCodec;
    use crate::heartbeat::Activity;
    use crate::stats::TrafficCounters;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn context(attempt: u64) -> (ChannelContext, mpsc::Receiver<ChannelNotice>) {
        let (tx, rx) = mpsc::channel(64);
        let ctx = ChannelContext {
            sink: EventSink::new(attempt, tx),
            activity: Arc::new(Activity::new()),
            traffic: Arc::new(TrafficCounters::new()),
            codec: Arc::new(WireCodec::default()),
            handshake: b"hello".to_vec(),
        };
        (ctx, rx)
    }

    fn fast_settings() -> ChannelSettings {
        let mut settings = ChannelSettings {
            handshake_timeout: Duration::from_millis(300),
            ..ChannelSettings::default()
        };
        settings.datagram.tick = Duration::from_millis(5);
        settings.datagram.idle_timeout = Duration::from_secs(2);
        settings
    }

    /// Minimal server: answers the handshake, echoes data frames as responses.
    async fn echo_server(answer_handshake: bool) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let codec = WireCodec::default();
            let mut buf = vec![0u8; RECV_BUFFER];
            let mut link: Option<ArqLink> = None;
            let mut peer = None;
            loop {
                let received = tokio::time::timeout(
                    Duration::from_millis(5),
                    socket.recv_from(&mut buf),
                )
                .await;
                if let Ok(Ok((n, from))) = received {
                    peer = Some(from);
                    let conv = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    let link = link.get_or_insert_with(|| ArqLink::new(conv, ArqConfig::default()));
                    if link.input(&buf[..n]).is_err() {
                        continue;
                    }
                    while let Some(message) = link.recv() {
                        match codec.parse_datagram(&message) {
                            Ok(DatagramFrame::Handshake(_)) if answer_handshake => {
                                let reply = codec
                                    .frame_datagram(Opcode::Handshake, b"welcome")
                                    .unwrap();
                                link.send(&reply).unwrap();
                            }
                            Ok(DatagramFrame::Data { payload, .. }) => {
                                let reply = codec
                                    .frame_datagram(Opcode::Response, &payload)
                                    .unwrap();
                                link.send(&reply).unwrap();
                            }
                            _ => {}
                        }
                    }
                }
                if let (Some(link), Some(peer)) = (link.as_mut(), peer) {
                    link.flush(Instant::now());
                    while let Some(out) = link.poll_output() {
                        let _ = socket.send_to(&out, peer).await;
                    }
                }
            }
        });
        port
    }

    fn spawn_connect(channel: &Arc<Channel>, port: u16, ctx: ChannelContext) {
        let channel = Arc::clone(channel);
        let endpoint = Endpoint::new(ChannelKind::Datagram, "127.0.0.1", Some(port));
        tokio::spawn(async move { channel.connect(endpoint, ctx).await });
    }

    #[tokio::test]
    async fn test_handshake_opens_and_data_echoes() {
        let port = echo_server(true).await;
        let channel = Arc::new(Channel::new(
            ChannelKind::Datagram,
            &fast_settings(),
            CancellationToken::new(),
        ));
        let (ctx, mut rx) = context(1);
        spawn_connect(&channel, port, ctx);

        let opened = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match opened.event {
            ChannelEvent::Opened(info) => assert!(info.handshake_latency.is_some()),
            other => panic!("expected Opened, got {other:?}"),
        }

        channel.send(vec![0x81, 0xA1, b't', 0xA1, b'x']).unwrap();
        let data = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match data.event {
            ChannelEvent::Data(payload) => assert_eq!(payload, vec![0x81, 0xA1, b't', 0xA1, b'x']),
            other => panic!("expected Data, got {other:?}"),
        }
        channel.disconnect();
    }

    #[tokio::test]
    async fn test_missing_handshake_reply_times_out() {
        let port = echo_server(false).await;
        let channel = Arc::new(Channel::new(
            ChannelKind::Datagram,
            &fast_settings(),
            CancellationToken::new(),
        ));
        let (ctx, mut rx) = context(1);
        spawn_connect(&channel, port, ctx);

        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            closed.event,
            ChannelEvent::Closed(CloseReason::Failed(TransportError::Timeout("handshake")))
        ));
        assert!(channel.is_started());
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_blank_address_fails_without_socket() {
        let channel = Arc::new(Channel::new(
            ChannelKind::Datagram,
            &fast_settings(),
            CancellationToken::new(),
        ));
        let (ctx, mut rx) = context(1);
        let endpoint = Endpoint::new(ChannelKind::Datagram, "", Some(1));
        let c = Arc::clone(&channel);
        tokio::spawn(async move { c.connect(endpoint, ctx).await });

        let closed = rx.recv().await.unwrap();
        assert!(matches!(
            closed.event,
            ChannelEvent::Closed(CloseReason::Failed(TransportError::InvalidEndpoint(_)))
        ));
    }
}
