//! Sans-IO automatic repeat request link for the datagram channel.
//!
//! Turns an unreliable packet path into a reliable, ordered message stream.
//! The caller feeds received datagrams to [`ArqLink::input`], calls
//! [`ArqLink::flush`] on a fixed tick, and sends whatever
//! [`ArqLink::poll_output`] yields. No clocks or sockets live in here.
//!
//! Segment layout (all integers little-endian):
//!
//! ```text
//! +-----------+-------+-------+----------+-----------+-----------+--------+
//! | conv u32  | cmd u8| frg u8| sn u32   | una u32   | len u16   | data   |
//! +-----------+-------+-------+----------+-----------+-----------+--------+
//! ```
//!
//! `frg` counts down to zero across the fragments of one message, `una` is
//! the sender's next expected sequence number (cumulative ack). Several
//! segments may share one datagram.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Segment header size in bytes.
pub const HEADER_LEN: usize = 16;
/// Data segment.
pub const CMD_PUSH: u8 = 1;
/// Selective acknowledgement of one sequence number.
pub const CMD_ACK: u8 = 2;

/// ARQ tuning.
#[derive(Debug, Clone)]
pub struct ArqConfig {
    /// Maximum data bytes per segment. Default: 1200.
    pub mss: usize,
    /// Maximum unacknowledged segments in flight, and receive window. Default: 128.
    pub window: u32,
    /// Initial retransmission timeout. Default: 200 ms.
    pub rto: Duration,
    /// Retransmission timeout ceiling. Default: 2 s.
    pub max_rto: Duration,
    /// Transmissions of one segment before the link is declared dead. Default: 12.
    pub dead_link: u32,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            mss: 1200,
            window: 128,
            rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(2),
            dead_link: 12,
        }
    }
}

impl ArqConfig {
    /// Largest message [`ArqLink::send`] accepts.
    pub fn max_message(&self) -> usize {
        self.mss * 256
    }
}

/// Errors from the ARQ layer.
#[derive(Debug, thiserror::Error)]
pub enum ArqError {
    /// A message needs more than 256 fragments.
    #[error("message of {size} bytes exceeds maximum {max}")]
    TooLarge {
        /// Message size.
        size: usize,
        /// Largest sendable message.
        max: usize,
    },
    /// A datagram could not be parsed.
    #[error("malformed segment: {0}")]
    Malformed(&'static str),
    /// A segment belongs to another conversation.
    #[error("conversation mismatch: expected {expected:#010x}, got {got:#010x}")]
    ConvMismatch {
        /// Our conversation id.
        expected: u32,
        /// The id in the segment.
        got: u32,
    },
}

#[derive(Debug, Clone)]
struct Segment {
    cmd: u8,
    frg: u8,
    sn: u32,
    data: Vec<u8>,
}

struct InFlight {
    seg: Segment,
    resend_at: Instant,
    rto: Duration,
    xmit: u32,
}

/// Wrapping "a comes before b" for sequence numbers.
fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// One end of a reliable ordered conversation.
pub struct ArqLink {
    conv: u32,
    config: ArqConfig,
    snd_nxt: u32,
    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<InFlight>,
    rcv_nxt: u32,
    rcv_buf: HashMap<u32, Segment>,
    rcv_queue: VecDeque<Segment>,
    acks: Vec<u32>,
    output: VecDeque<Vec<u8>>,
    dead: bool,
}

impl ArqLink {
    /// Create a link for conversation `conv`.
    pub fn new(conv: u32, config: ArqConfig) -> Self {
        Self {
            conv,
            config,
            snd_nxt: 0,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_nxt: 0,
            rcv_buf: HashMap::new(),
            rcv_queue: VecDeque::new(),
            acks: Vec::new(),
            output: VecDeque::new(),
            dead: false,
        }
    }

    /// Conversation id.
    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// Queue one message for reliable delivery.
    pub fn send(&mut self, data: &[u8]) -> Result<(), ArqError> {
        let mss = self.config.mss;
        let count = data.len().div_ceil(mss).max(1);
        if count > 256 {
            return Err(ArqError::TooLarge {
                size: data.len(),
                max: self.config.max_message(),
            });
        }
        for i in 0..count {
            let start = i * mss;
            let end = (start + mss).min(data.len());
            self.snd_queue.push_back(Segment {
                cmd: CMD_PUSH,
                frg: (count - 1 - i) as u8,
                sn: 0,
                data: data[start..end].to_vec(),
            });
        }
        Ok(())
    }

    /// Feed one received datagram.
    pub fn input(&mut self, mut datagram: &[u8]) -> Result<(), ArqError> {
        if datagram.len() < HEADER_LEN {
            return Err(ArqError::Malformed("datagram shorter than a header"));
        }
        while datagram.len() >= HEADER_LEN {
            let conv = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
            if conv != self.conv {
                return Err(ArqError::ConvMismatch {
                    expected: self.conv,
                    got: conv,
                });
            }
            let cmd = datagram[4];
            let frg = datagram[5];
            let sn = u32::from_le_bytes([datagram[6], datagram[7], datagram[8], datagram[9]]);
            let una = u32::from_le_bytes([datagram[10], datagram[11], datagram[12], datagram[13]]);
            let len = u16::from_le_bytes([datagram[14], datagram[15]]) as usize;
            let body = &datagram[HEADER_LEN..];
            if len > body.len() {
                return Err(ArqError::Malformed("segment length past end of datagram"));
            }

            self.ack_until(una);
            match cmd {
                CMD_ACK => self.snd_buf.retain(|f| f.seg.sn != sn),
                CMD_PUSH => self.accept_push(Segment {
                    cmd,
                    frg,
                    sn,
                    data: body[..len].to_vec(),
                }),
                _ => return Err(ArqError::Malformed("unknown command")),
            }
            datagram = &body[len..];
        }
        Ok(())
    }

    fn ack_until(&mut self, una: u32) {
        while self
            .snd_buf
            .front()
            .is_some_and(|f| before(f.seg.sn, una))
        {
            self.snd_buf.pop_front();
        }
    }

    fn accept_push(&mut self, seg: Segment) {
        let offset = seg.sn.wrapping_sub(self.rcv_nxt) as i32;
        if offset >= self.config.window as i32 {
            return;
        }
        // Duplicates behind rcv_nxt are acked again so the peer stops resending.
        self.acks.push(seg.sn);
        if offset < 0 {
            return;
        }
        self.rcv_buf.entry(seg.sn).or_insert(seg);
        while let Some(next) = self.rcv_buf.remove(&self.rcv_nxt) {
            self.rcv_queue.push_back(next);
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        }
    }

    /// Pop the next complete message, if one has been reassembled.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        let needed = self.rcv_queue.front()?.frg as usize + 1;
        if self.rcv_queue.len() < needed {
            return None;
        }
        let mut message = Vec::new();
        for seg in self.rcv_queue.drain(..needed) {
            message.extend_from_slice(&seg.data);
        }
        Some(message)
    }

    /// Emit pending acks, first transmissions and due retransmissions.
    pub fn flush(&mut self, now: Instant) {
        let mtu = self.config.mss + HEADER_LEN;
        let mut packet = Vec::with_capacity(mtu);

        for sn in std::mem::take(&mut self.acks) {
            let ack = Segment {
                cmd: CMD_ACK,
                frg: 0,
                sn,
                data: Vec::new(),
            };
            self.write_segment(&mut packet, &ack, mtu);
        }

        while self.snd_buf.len() < self.config.window as usize {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.sn = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(InFlight {
                seg,
                resend_at: now,
                rto: self.config.rto,
                xmit: 0,
            });
        }

        let mut due = Vec::new();
        for flight in self.snd_buf.iter_mut() {
            if flight.xmit > 0 && now < flight.resend_at {
                continue;
            }
            if flight.xmit > 0 {
                flight.rto = (flight.rto * 2).min(self.config.max_rto);
            }
            flight.xmit += 1;
            flight.resend_at = now + flight.rto;
            if flight.xmit >= self.config.dead_link {
                self.dead = true;
            }
            due.push(flight.seg.clone());
        }
        for seg in &due {
            self.write_segment(&mut packet, seg, mtu);
        }

        if !packet.is_empty() {
            self.output.push_back(packet);
        }
    }

    fn write_segment(&mut self, packet: &mut Vec<u8>, seg: &Segment, mtu: usize) {
        if !packet.is_empty() && packet.len() + HEADER_LEN + seg.data.len() > mtu {
            self.output.push_back(std::mem::take(packet));
        }
        packet.extend_from_slice(&self.conv.to_le_bytes());
        packet.push(seg.cmd);
        packet.push(seg.frg);
        packet.extend_from_slice(&seg.sn.to_le_bytes());
        packet.extend_from_slice(&self.rcv_nxt.to_le_bytes());
        packet.extend_from_slice(&(seg.data.len() as u16).to_le_bytes());
        packet.extend_from_slice(&seg.data);
    }

    /// Next datagram to put on the wire.
    pub fn poll_output(&mut self) -> Option<Vec<u8>> {
        self.output.pop_front()
    }

    /// Whether some segment hit the retransmission limit.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Segments queued or awaiting acknowledgement.
    pub fn pending(&self) -> usize {
        self.snd_queue.len() + self.snd_buf.len()
    }
}
