use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::mem;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::fs::FileExt;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::contiguous::longest_run;
use crate::tcp::ioutil::{poll_readable, recv_segment, send_segment};
use crate::tcp::segment::{Flags, Header, Segment};
use crate::tcp::ADVERTISED_WND;
use crate::{Error, CLOSE_WAIT_TIME};

/// Poll interval of the passive-close wait loop.
const TEARDOWN_POLL: Duration = Duration::from_millis(200);

/// Poll timeouts between replays of the teardown segments while waiting for
/// the final ACK.
const REPLAY_EVERY: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Closed,
    Listen,
    Established,
    CloseWait,
    LastAck,
}

/// Byte-addressable output: payloads land at the offset given by their
/// sequence number.
pub trait ByteSink {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()>;
}

impl ByteSink for File {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        self.write_all_at(buf, offset)
    }
}

impl ByteSink for Vec<u8> {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        let offset = offset as usize;
        if self.len() < offset + buf.len() {
            self.resize(offset + buf.len(), 0);
        }
        self[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// The passive endpoint: verifies and reorders inbound segments, emits
/// cumulative ACKs, writes payloads at their byte offsets, and answers the
/// peer's FIN with the passive half of the teardown. Single-threaded; the
/// blocking receive is the only suspension point.
pub struct Receiver {
    sock: UdpSocket,
    /// Where ACKs (and the teardown segments) are sent.
    peer: SocketAddr,
    src_port: u16,
    state: ReceiverState,
    /// Next byte to assign to an outgoing control segment.
    seq_num: u32,
    /// Next in-order byte expected from the peer: the cumulative ACK value.
    ack_num: u32,
    send_base: u32,
    /// Verified segments not yet folded into the acknowledged prefix. The
    /// last element of every acknowledged run stays behind as the anchor the
    /// next run grows from.
    reorder: BTreeMap<u32, Segment>,
    /// Acknowledged-but-unwritten segments, for in-order file delivery.
    pending: BTreeMap<u32, Segment>,
    delivered_seqs: HashSet<u32>,
    /// Everything below this offset has been written to the sink.
    delivered_up_to: u64,
    /// Sequence number of the peer's FIN, once seen.
    fin_seq: Option<u32>,
    /// Teardown segments by sequence number, replayed when the peer asks
    /// again.
    fin_packets: HashMap<u32, Segment>,
}

impl Receiver {
    /// Binds the listening port. `peer` is the address the sender receives
    /// ACKs on.
    pub fn bind(lstn_port: u16, peer: SocketAddr) -> Result<Self, Error> {
        let sock = UdpSocket::bind(("0.0.0.0", lstn_port))?;
        let src_port = sock.local_addr()?.port();
        Ok(Receiver {
            sock,
            peer,
            src_port,
            state: ReceiverState::Listen,
            seq_num: 0,
            ack_num: 0,
            send_base: 0,
            reorder: BTreeMap::new(),
            pending: BTreeMap::new(),
            delivered_seqs: HashSet::new(),
            delivered_up_to: 0,
            fin_seq: None,
            fin_packets: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.sock.local_addr()?)
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Serves one transfer: accepts data until the peer's FIN completes the
    /// four-way close, then resets back to LISTEN. Returns the number of
    /// bytes delivered to the sink.
    pub fn serve(&mut self, sink: &mut dyn ByteSink) -> Result<u64, Error> {
        self.state = ReceiverState::Established;
        info!(port = self.src_port, "ready to receive");

        loop {
            let Some(seg) = self.receive()? else {
                continue;
            };
            if !seg.header.flags.fin() {
                self.deliver(&seg, sink)?;
            }
            if self.state == ReceiverState::Closed {
                break;
            }
            self.send(&[])?;
        }

        let delivered = self.delivered_up_to;
        self.reset();
        Ok(delivered)
    }

    /// Accept loop: serves transfers forever, recycling per-connection state
    /// in between.
    pub fn serve_forever(&mut self, sink: &mut dyn ByteSink) -> Result<(), Error> {
        loop {
            match self.serve(sink) {
                Ok(bytes) => info!(bytes, "transfer complete, listening again"),
                Err(Error::Io(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(%e, "transfer failed, resetting");
                    self.reset();
                }
            }
        }
    }

    /// Blocking read of one datagram. Malformed or corrupt datagrams yield
    /// `None` and are dropped without a reply; anything else runs the
    /// cumulative-ACK bookkeeping (and, on a FIN that completes the stream,
    /// the passive close) before being returned.
    pub fn receive(&mut self) -> Result<Option<Segment>, Error> {
        let Some((seg, _from)) = recv_segment(&self.sock)? else {
            return Ok(None);
        };
        self.on_data(&seg)?;
        Ok(Some(seg))
    }

    /// Emits an ACK-flagged segment carrying the current cumulative
    /// acknowledgment. The segment consumes one sequence number (or the
    /// payload length, for the teardown segments that carry one).
    pub fn send(&mut self, payload: &[u8]) -> Result<Segment, Error> {
        self.send_with(Flags::new(false, false, true, false, false), payload)
    }

    fn send_fin(&mut self) -> Result<Segment, Error> {
        self.send_with(Flags::new(false, false, false, false, true), &[])
    }

    fn send_with(&mut self, flags: Flags, payload: &[u8]) -> Result<Segment, Error> {
        let header = Header::new(
            self.src_port,
            self.peer.port(),
            self.seq_num,
            self.ack_num,
            flags,
            ADVERTISED_WND,
        );
        let mut seg = Segment::new(header, payload.to_vec());
        seg.fill_checksum();
        send_segment(&self.sock, &seg, self.peer)?;
        self.seq_num = seg.expected_ack();
        Ok(seg)
    }

    /// Per-segment bookkeeping: fold the segment into the reorder set,
    /// recompute the cumulative ACK, and enter the passive close once the
    /// acknowledged prefix covers the peer's FIN.
    fn on_data(&mut self, seg: &Segment) -> Result<(), Error> {
        self.ack_num = self.next_ack(seg);

        if seg.header.flags.fin() {
            self.fin_seq = Some(seg.header.seq_num);
        }
        if let Some(fin_seq) = self.fin_seq {
            if self.state == ReceiverState::Established && self.ack_num >= fin_seq + 1 {
                info!(ack = self.ack_num, "stream complete, closing connection");
                self.close_connection()?;
            }
        }
        Ok(())
    }

    /// Cumulative-ACK computation over the reorder set. Old segments are
    /// ignored; a gap in front freezes the ACK; otherwise the longest
    /// contiguous run is folded away, leaving its last element as the anchor.
    fn next_ack(&mut self, seg: &Segment) -> u32 {
        if seg.header.seq_num >= self.ack_num {
            self.reorder
                .entry(seg.header.seq_num)
                .or_insert_with(|| seg.clone());
        } else {
            trace!(seq = seg.header.seq_num, ack = self.ack_num, "old segment");
        }

        let min_seq = match self.reorder.keys().next() {
            Some(&seq) => seq,
            None => return self.ack_num,
        };
        if min_seq > self.ack_num {
            // The next in-order byte is still missing.
            return self.ack_num;
        }

        let items: Vec<Segment> = mem::take(&mut self.reorder).into_values().collect();
        let (run, rest) = longest_run(items, |s| s.header.seq_num, Segment::seq_step);
        self.reorder = rest
            .into_iter()
            .map(|s| (s.header.seq_num, s))
            .collect();

        let Some(last) = run.into_iter().last() else {
            return self.ack_num;
        };
        let ack = last.expected_ack();
        self.reorder.insert(last.header.seq_num, last);
        ack
    }

    /// File delivery: buffer the payload, and whenever the leading contiguous
    /// run reaches the delivered prefix, write each payload at its own byte
    /// offset. Late duplicates are dropped idempotently.
    fn deliver(&mut self, seg: &Segment, sink: &mut dyn ByteSink) -> Result<(), Error> {
        let seq = seg.header.seq_num;
        if self.delivered_seqs.contains(&seq) {
            trace!(seq, "payload already delivered");
            return Ok(());
        }
        self.delivered_seqs.insert(seq);
        self.pending.insert(seq, seg.clone());

        let items: Vec<Segment> = mem::take(&mut self.pending).into_values().collect();
        let (run, rest) = longest_run(items, |s| s.header.seq_num, Segment::seq_step);

        let gapped = run
            .first()
            .map_or(true, |first| u64::from(first.header.seq_num) > self.delivered_up_to);
        if gapped {
            self.pending = run
                .into_iter()
                .chain(rest)
                .map(|s| (s.header.seq_num, s))
                .collect();
            return Ok(());
        }

        for s in &run {
            trace!(seq = s.header.seq_num, len = s.payload.len(), "writing payload");
            sink.write_at(u64::from(s.header.seq_num), &s.payload)?;
        }
        if let Some(last) = run.last() {
            self.delivered_up_to = u64::from(last.header.seq_num) + u64::from(last.seq_step());
        }
        self.pending = rest
            .into_iter()
            .map(|s| (s.header.seq_num, s))
            .collect();
        debug!(delivered_up_to = self.delivered_up_to, "delivery advanced");
        Ok(())
    }

    /// Passive close: ESTABLISHED -> CLOSE_WAIT -> LAST_ACK -> CLOSED. The
    /// teardown segments are kept in `fin_packets` so lost ones can be
    /// replayed.
    fn close_connection(&mut self) -> Result<(), Error> {
        let ack = self.send(&[])?;
        self.fin_packets.insert(ack.header.seq_num, ack);
        self.state = ReceiverState::CloseWait;

        let fin = self.send_fin()?;
        let fin_seq = fin.header.seq_num;
        self.fin_packets.insert(fin_seq, fin);
        self.state = ReceiverState::LastAck;
        debug!(fin_seq, "fin sent, awaiting final ack");

        self.wait_fin_ack(fin_seq)
    }

    /// LAST_ACK: wait for the ACK of our FIN, replaying the teardown
    /// segments when the peer retransmits, and giving up after the TIME_WAIT
    /// bound so a dead peer cannot wedge the accept loop.
    fn wait_fin_ack(&mut self, fin_seq: u32) -> Result<(), Error> {
        let deadline = Instant::now() + CLOSE_WAIT_TIME;
        let mut idle_polls = 0u32;

        while self.state == ReceiverState::LastAck {
            if Instant::now() >= deadline {
                warn!("no final ack within the teardown bound, closing anyway");
                self.state = ReceiverState::Closed;
                break;
            }
            if !poll_readable(&self.sock, TEARDOWN_POLL)? {
                idle_polls += 1;
                if idle_polls % REPLAY_EVERY == 0 {
                    self.replay_teardown()?;
                }
                continue;
            }
            let Some((seg, _)) = recv_segment(&self.sock)? else {
                continue;
            };

            let header = seg.header;
            if header.flags.ack() && header.ack_num >= fin_seq + 1 {
                self.send_base = header.ack_num;
                self.ack_num = self.next_ack(&seg);
                // Confirm, so the peer can leave TIME_WAIT early.
                self.send(&[])?;
                self.state = ReceiverState::Closed;
                debug!(send_base = self.send_base, "final ack received, connection closed");
            } else if header.flags.fin() {
                // Our ACK of the peer's FIN was lost; it is asking again.
                self.replay_teardown()?;
            } else if header.flags.ack() {
                // Duplicate ACK naming an earlier teardown segment.
                if let Some(pkt) = self.fin_packets.get(&header.ack_num) {
                    send_segment(&self.sock, pkt, self.peer)?;
                }
            }
        }
        Ok(())
    }

    fn replay_teardown(&mut self) -> Result<(), Error> {
        let mut replay: Vec<&Segment> = self.fin_packets.values().collect();
        replay.sort_by_key(|s| s.header.seq_num);
        for seg in replay {
            send_segment(&self.sock, seg, self.peer)?;
        }
        Ok(())
    }

    /// Recycle the per-connection state and return to LISTEN.
    fn reset(&mut self) {
        self.seq_num = 0;
        self.ack_num = 0;
        self.send_base = 0;
        self.reorder.clear();
        self.pending.clear();
        self.delivered_seqs.clear();
        self.delivered_up_to = 0;
        self.fin_seq = None;
        self.fin_packets.clear();
        self.state = ReceiverState::Listen;
    }
}
