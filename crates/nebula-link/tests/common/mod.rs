//! Loopback servers speaking the client's wire formats.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nebula_link::channel::arq::{ArqConfig, ArqLink};
use nebula_link::codec::DatagramFrame;
use nebula_link::framing::{FramedReader, write_frame};
use nebula_link::{ClientEvent, Message, Opcode, WireCodec};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const MAX_FRAME: usize = 1 << 20;

/// Error code returned for message types starting with `fail.`.
pub const FAIL_CODE: &str = "Forbidden";

/// Reply policy shared by every fixture.
#[derive(Default)]
pub struct Behavior {
    /// Record messages but answer none of them.
    pub silent: AtomicBool,
    /// Types recorded but never answered.
    pub ignored: Mutex<HashSet<String>>,
    /// Connections whose messages are recorded but never answered.
    pub muted: Mutex<HashSet<usize>>,
}

impl Behavior {
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn ignore(&self, msg_type: &str) {
        self.ignored.lock().unwrap().insert(msg_type.to_string());
    }

    pub fn unignore(&self, msg_type: &str) {
        self.ignored.lock().unwrap().remove(msg_type);
    }

    pub fn mute(&self, connection: usize) {
        self.muted.lock().unwrap().insert(connection);
    }

    /// Echo requests back as responses, answer pings with pongs, and fail
    /// `fail.*` types.
    fn reply(&self, connection: usize, message: &Message) -> Option<Message> {
        if self.silent.load(Ordering::SeqCst)
            || self.muted.lock().unwrap().contains(&connection)
            || self.ignored.lock().unwrap().contains(&message.msg_type)
        {
            return None;
        }
        if message.msg_type == "sys.ping" && message.request_id.is_none() {
            return Some(Message::new("sys.pong").with_payload(message.payload.clone()));
        }
        let id = message.request_id?;
        let reply = Message::new(message.msg_type.clone())
            .with_request_id(id)
            .with_payload(message.payload.clone());
        Some(if message.msg_type.starts_with("fail.") {
            reply.with_error(FAIL_CODE)
        } else {
            reply
        })
    }
}

/// Everything a fixture saw, tagged with the connection it arrived on.
#[derive(Default)]
pub struct Record {
    messages: Mutex<Vec<(usize, Message)>>,
}

impl Record {
    fn push(&self, connection: usize, message: Message) {
        self.messages.lock().unwrap().push((connection, message));
    }

    pub fn count(&self, msg_type: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| m.msg_type == msg_type)
            .count()
    }

    pub fn count_on(&self, connection: usize, msg_type: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, m)| *c == connection && m.msg_type == msg_type)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// Framed TCP server. Connections are numbered from 1 in accept order.
pub struct SocketServer {
    pub port: u16,
    pub behavior: Arc<Behavior>,
    pub record: Arc<Record>,
    pub accepted: Arc<AtomicUsize>,
    kick: broadcast::Sender<()>,
    acceptor: JoinHandle<()>,
}

impl SocketServer {
    pub async fn start() -> Self {
        Self::start_on(TcpListener::bind("127.0.0.1:0").await.unwrap())
    }

    pub fn start_on(listener: TcpListener) -> Self {
        let port = listener.local_addr().unwrap().port();
        let behavior = Arc::new(Behavior::default());
        let record = Arc::new(Record::default());
        let accepted = Arc::new(AtomicUsize::new(0));
        let (kick, _) = broadcast::channel(4);

        let acceptor = tokio::spawn({
            let behavior = Arc::clone(&behavior);
            let record = Arc::clone(&record);
            let accepted = Arc::clone(&accepted);
            let kick = kick.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let connection = accepted.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::spawn(serve_stream(
                        stream,
                        connection,
                        Arc::clone(&behavior),
                        Arc::clone(&record),
                        kick.subscribe(),
                    ));
                }
            }
        });

        Self {
            port,
            behavior,
            record,
            accepted,
            kick,
            acceptor,
        }
    }

    /// Drop every open connection; new ones are still accepted.
    pub fn kick(&self) {
        let _ = self.kick.send(());
    }

    /// Stop listening, then drop every open connection. The port refuses
    /// connections once this returns.
    pub async fn shutdown(&mut self) {
        self.acceptor.abort();
        let _ = (&mut self.acceptor).await;
        self.kick();
    }

    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn serve_stream(
    stream: TcpStream,
    connection: usize,
    behavior: Arc<Behavior>,
    record: Arc<Record>,
    mut kick: broadcast::Receiver<()>,
) {
    let codec = WireCodec::default();
    let (read, mut write) = stream.into_split();
    let mut framed = FramedReader::new(read, MAX_FRAME);
    loop {
        let messages = tokio::select! {
            _ = kick.recv() => return,
            frame = framed.next_frame() => match frame {
                Ok(body) => codec.decode_stream(body),
                Err(_) => return,
            },
        };
        let Ok(messages) = messages else {
            continue;
        };
        for message in messages {
            let reply = behavior.reply(connection, &message);
            record.push(connection, message);
            if let Some(reply) = reply {
                let body = codec.frame_stream(&codec.serialize(&reply).unwrap());
                if write_frame(&mut write, &body, MAX_FRAME).await.is_err() {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Datagram
// ---------------------------------------------------------------------------

/// UDP server running the ARQ link. Answers the handshake, then replies to
/// data frames per [`Behavior`]. Serves one client conversation at a time.
pub struct DatagramServer {
    pub port: u16,
    pub behavior: Arc<Behavior>,
    pub record: Arc<Record>,
}

impl DatagramServer {
    pub async fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let behavior = Arc::new(Behavior::default());
        let record = Arc::new(Record::default());
        tokio::spawn(serve_datagrams(socket, Arc::clone(&behavior), Arc::clone(&record)));
        Self { port, behavior, record }
    }
}

async fn serve_datagrams(socket: UdpSocket, behavior: Arc<Behavior>, record: Arc<Record>) {
    let codec = WireCodec::default();
    let mut buf = vec![0u8; 64 * 1024];
    let mut link: Option<ArqLink> = None;
    let mut peer = None;
    let mut conversations = 0;
    loop {
        let received =
            tokio::time::timeout(Duration::from_millis(5), socket.recv_from(&mut buf)).await;
        if let Ok(Ok((n, from))) = received
            && n >= 4
        {
            let conv = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if link.as_ref().map(ArqLink::conv) != Some(conv) {
                conversations += 1;
                link = Some(ArqLink::new(conv, ArqConfig::default()));
            }
            peer = Some(from);
            if let Some(link) = link.as_mut()
                && link.input(&buf[..n]).is_ok()
            {
                while let Some(frame) = link.recv() {
                    match codec.parse_datagram(&frame) {
                        Ok(DatagramFrame::Handshake(_)) => {
                            let reply = codec
                                .frame_datagram(Opcode::Handshake, b"welcome")
                                .unwrap();
                            link.send(&reply).unwrap();
                        }
                        Ok(DatagramFrame::Data { payload, .. }) => {
                            let Ok(message) = codec.deserialize(&payload) else {
                                continue;
                            };
                            let reply = behavior.reply(conversations, &message);
                            record.push(conversations, message);
                            if let Some(reply) = reply {
                                let body = codec.serialize(&reply).unwrap();
                                let frame = codec.frame_datagram(Opcode::Response, &body).unwrap();
                                link.send(&frame).unwrap();
                            }
                        }
                        _ => {}
                    }
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
}

// ---------------------------------------------------------------------------
// Poll
// ---------------------------------------------------------------------------

/// HTTP poll server: every POST body is a socket frame body; the response
/// body carries the replies as one batch.
pub struct PollServer {
    pub port: u16,
    pub behavior: Arc<Behavior>,
    pub record: Arc<Record>,
}

impl PollServer {
    pub fn start() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let behavior = Arc::new(Behavior::default());
        let record = Arc::new(Record::default());
        std::thread::spawn({
            let behavior = Arc::clone(&behavior);
            let record = Arc::clone(&record);
            move || {
                let codec = WireCodec::default();
                for mut request in server.incoming_requests() {
                    let mut body = Vec::new();
                    let _ = request.as_reader().read_to_end(&mut body);
                    let mut replies = Vec::new();
                    if !body.is_empty()
                        && let Ok(messages) = codec.decode_stream(&body)
                    {
                        for message in messages {
                            if let Some(reply) = behavior.reply(1, &message) {
                                replies.push(codec.serialize(&reply).unwrap());
                            }
                            record.push(1, message);
                        }
                    }
                    let out = if replies.is_empty() {
                        Vec::new()
                    } else {
                        codec.frame_batch(&replies).unwrap()
                    };
                    let _ = request.respond(tiny_http::Response::from_data(out));
                }
            }
        });
        Self { port, behavior, record }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A loopback port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Next event matching `pred`, skipping others. Panics after `within`.
pub async fn wait_for<F>(
    events: &mut broadcast::Receiver<ClientEvent>,
    within: Duration,
    mut pred: F,
) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

/// Poll `cond` every few milliseconds until it holds.
pub async fn eventually<F: FnMut() -> bool>(within: Duration, mut cond: F) {
    tokio::time::timeout(within, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
