//! Request/response poll channel over HTTP.
//!
//! Each exchange is one `POST`. The request body is a socket frame body
//! (possibly a batch) or empty for an idle poll; the response body is a
//! socket frame body or empty. The channel counts as open after the first
//! successful exchange, and any later failed exchange closes it.

use std::time::{Duration, Instant};

use reqwest::Url;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;

use super::{
    ChannelContext, ChannelCore, ChannelSettings, CloseReason, Endpoint, OpenInfo, TransportError,
};

const OCTET_STREAM: &str = "application/octet-stream";

/// Poll channel state.
pub struct PollChannel {
    pub(crate) core: ChannelCore,
    settings: ChannelSettings,
}

impl PollChannel {
    pub(crate) fn new(core: ChannelCore, settings: ChannelSettings) -> Self {
        Self { core, settings }
    }

    pub(crate) async fn connect(&self, endpoint: Endpoint, ctx: ChannelContext) {
        let cancel = self.core.cancel_token();
        let started = Instant::now();

        let setup = poll_url(&endpoint).and_then(|url| {
            let client = reqwest::Client::builder()
                .timeout(self.settings.connect_timeout)
                .build()?;
            Ok((client, url))
        });
        let (client, url) = match setup {
            Ok(setup) => setup,
            Err(e) => {
                self.core.shut(&ctx.sink, e.into()).await;
                return;
            }
        };
        let poller = Poller {
            client,
            url,
            ctx: &ctx,
        };

        let first = tokio::select! {
            _ = cancel.cancelled() => {
                self.core.shut(&ctx.sink, CloseReason::Local).await;
                return;
            }
            result = poller.exchange(Vec::new(), 0) => result,
        };
        let body = match first {
            Ok(body) => body,
            Err(e) => {
                self.core.shut(&ctx.sink, e.into()).await;
                return;
            }
        };
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
            "Poll channel open"
        );
        self.core.set_connected(true);
        ctx.sink.opened(info).await;
        poller.deliver(&body).await;

        let reason = tokio::select! {
            _ = cancel.cancelled() => CloseReason::Local,
            reason = poller.run(rx, self.settings.max_batch, self.settings.poll_interval) => reason,
        };
        self.core.shut(&ctx.sink, reason).await;
    }
}

/// Build the poll URL: a full `http(s)://` address is used as given (with
/// the port applied if set), anything else becomes `http://host:port/`.
fn poll_url(endpoint: &Endpoint) -> Result<Url, TransportError> {
    let address = endpoint.address.trim();
    if address.is_empty() {
        return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
    }
    let invalid =
        |e: &dyn std::fmt::Display| TransportError::InvalidEndpoint(format!("{endpoint}: {e}"));

    if address.starts_with("http://") || address.starts_with("https://") {
        let mut url = Url::parse(address).map_err(|e| invalid(&e))?;
        if let Some(port) = endpoint.port {
            url.set_port(Some(port)).map_err(|()| invalid(&"cannot carry a port"))?;
        }
        Ok(url)
    } else {
        let url = format!("http://{}/", endpoint.host_port()?);
        Url::parse(&url).map_err(|e| invalid(&e))
    }
}

struct Poller<'a> {
    client: reqwest::Client,
    url: Url,
    ctx: &'a ChannelContext,
}

impl Poller<'_> {
    async fn run(
        &self,
        mut rx: mpsc::Receiver<Vec<u8>>,
        max_batch: usize,
        interval: Duration,
    ) -> CloseReason {
        let max_batch = max_batch.max(1);
        loop {
            let idle = async {
                if interval.is_zero() {
                    std::future::pending::<()>().await;
                } else {
                    tokio::time::sleep(interval).await;
                }
            };
            let (body, count) = tokio::select! {
                next = rx.recv() => {
                    let Some(first) = next else {
                        return CloseReason::Local;
                    };
                    let mut queued = vec![first];
                    while queued.len() < max_batch {
                        match rx.try_recv() {
                            Ok(more) => queued.push(more),
                            Err(_) => break,
                        }
                    }
                    match self.ctx.codec.frame_batch(&queued) {
                        Ok(body) => (body, queued.len()),
                        Err(e) => {
                            tracing::warn!(
                                attempt = self.ctx.sink.attempt(),
                                "Dropping unencodable batch: {e}"
                            );
                            continue;
                        }
                    }
                }
                _ = idle => (Vec::new(), 0),
            };

            match self.exchange(body, count).await {
                Ok(response) => self.deliver(&response).await,
                Err(e) => return e.into(),
            }
        }
    }

    /// One POST. Returns the response body.
    async fn exchange(&self, body: Vec<u8>, messages: usize) -> Result<Vec<u8>, TransportError> {
        let sent = body.len();
        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        let bytes = response.bytes().await?;
        if messages > 0 {
            self.ctx.traffic.record_send(sent, messages);
        }
        Ok(bytes.to_vec())
    }

    async fn deliver(&self, body: &[u8]) {
        if body.is_empty() {
            return;
        }
        self.ctx.activity.touch_inbound();
        match self.ctx.codec.parse_stream(body) {
            Ok(payloads) => {
                self.ctx.traffic.record_receive(body.len(), payloads.len());
                for payload in payloads {
                    self.ctx.sink.data(payload).await;
                }
            }
            Err(e) => {
                tracing::warn!(
                    attempt = self.ctx.sink.attempt(),
                    "Dropping malformed poll response: {e}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelEvent, ChannelKind, ChannelNotice, EventSink};
    use crate::codec::WireCodec;
    use crate::heartbeat::Activity;
    use crate::stats::TrafficCounters;
    use std::io::Read;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn context() -> (ChannelContext, mpsc::Receiver<ChannelNotice>) {
        let (tx, rx) = mpsc::channel(64);
        let ctx = ChannelContext {
            sink: EventSink::new(1, tx),
            activity: Arc::new(Activity::new()),
            traffic: Arc::new(TrafficCounters::new()),
            codec: Arc::new(WireCodec::default()),
            handshake: Vec::new(),
        };
        (ctx, rx)
    }

    /// Echo server: replies to every POST with the request body.
    fn echo_server(status: u16) -> u16 {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        std::thread::spawn(move || {
            for mut request in server.incoming_requests() {
                let mut body = Vec::new();
                let _ = request.as_reader().read_to_end(&mut body);
                let response = tiny_http::Response::from_data(body).with_status_code(status);
                let _ = request.respond(response);
            }
        });
        port
    }

    #[test]
    fn test_poll_url_forms() {
        let plain = Endpoint::new(ChannelKind::Poll, "game.example", Some(8080));
        assert_eq!(poll_url(&plain).unwrap().as_str(), "http://game.example:8080/");

        let full = Endpoint::new(ChannelKind::Poll, "https://game.example/poll", Some(9443));
        assert_eq!(poll_url(&full).unwrap().as_str(), "https://game.example:9443/poll");

        let unported = Endpoint::new(ChannelKind::Poll, "http://game.example/poll", None);
        assert_eq!(poll_url(&unported).unwrap().as_str(), "http://game.example/poll");

        let blank = Endpoint::new(ChannelKind::Poll, " ", Some(80));
        assert!(matches!(poll_url(&blank), Err(TransportError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn test_poll_opens_and_echoes_batch() {
        let port = echo_server(200);
        let channel = Arc::new(Channel::new(
            ChannelKind::Poll,
            &ChannelSettings::default(),
            CancellationToken::new(),
        ));
        let (ctx, mut rx) = context();
        let traffic = Arc::clone(&ctx.traffic);
        let c = Arc::clone(&channel);
        let endpoint = Endpoint::new(ChannelKind::Poll, "127.0.0.1", Some(port));
        tokio::spawn(async move { c.connect(endpoint, ctx).await });

        let opened = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(opened.event, ChannelEvent::Opened(_)));

        channel.send(b"first".to_vec()).unwrap();
        channel.send(b"second".to_vec()).unwrap();

        let mut received = Vec::new();
        while received.len() < 2 {
            let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match notice.event {
                ChannelEvent::Data(payload) => received.push(payload),
                other => panic!("expected Data, got {other:?}"),
            }
        }
        assert_eq!(received, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(traffic.snapshot().messages_sent, 2);

        channel.disconnect();
        let closed = rx.recv().await.unwrap();
        assert!(matches!(closed.event, ChannelEvent::Closed(CloseReason::Local)));
    }

    #[tokio::test]
    async fn test_server_error_fails_attempt() {
        let port = echo_server(503);
        let channel = Channel::new(
            ChannelKind::Poll,
            &ChannelSettings::default(),
            CancellationToken::new(),
        );
        let (ctx, mut rx) = context();
        let endpoint = Endpoint::new(ChannelKind::Poll, "127.0.0.1", Some(port));
        channel.connect(endpoint, ctx).await;

        let closed = rx.recv().await.unwrap();
        assert!(matches!(
            closed.event,
            ChannelEvent::Closed(CloseReason::Failed(TransportError::Http(_)))
        ));
        assert!(!channel.is_connected());
    }
}
