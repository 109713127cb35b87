use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::tcp::ioutil::{poll_readable, recv_segment, send_segment};
use crate::tcp::segment::{Flags, Header, Segment};
use crate::tcp::ADVERTISED_WND;
use crate::{Error, RttEstimator, Timer, CLOSE_WAIT_TIME, INIT_TIMEOUT, MSS};

/// Poll interval of the background receive thread, so it notices state
/// changes made by the producing thread.
const RECV_POLL: Duration = Duration::from_millis(100);

/// Sleep between polls of the teardown loops.
const TEARDOWN_POLL: Duration = Duration::from_secs(1);

/// Sleep between admit retries while the window is full.
const WINDOW_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Established,
    BeginClose,
    FinWait1,
    FinWait2,
    TimeWait,
    Closed,
}

/// Send-side connection state. One mutex guards all of it: the producing
/// thread, the background receive thread, and the retransmission timer all
/// touch the window and the RTT bookkeeping.
#[derive(Debug)]
struct SendState {
    state: SenderState,
    /// Next byte to assign to an outgoing segment.
    seq_num: u32,
    /// Next in-order byte expected from the peer. Zero until the peer's FIN
    /// arrives; this is a one-way transfer.
    ack_num: u32,
    /// Smallest unacknowledged sequence number.
    send_base: u32,
    /// In-flight segments, oldest first, bounded by the window size.
    window: VecDeque<Segment>,
    /// Expected ACK value -> first-transmission time. Only segments that were
    /// never retransmitted may produce an RTT sample.
    unsampled: HashMap<u32, Instant>,
    rtt: RttEstimator,
}

/// The active endpoint: admits MSS-sized payloads into a sliding window,
/// retransmits on timeout, and runs the active close once the file is out.
pub struct Sender {
    sock: Arc<UdpSocket>,
    dst: SocketAddr,
    src_port: u16,
    dst_port: u16,
    window_size: usize,
    shared: Arc<Mutex<SendState>>,
    timer: Timer,
    ctrl: mpsc::Receiver<Segment>,
    recv_thread: Option<JoinHandle<()>>,
}

impl Sender {
    /// Binds the local ACK port, wires up the retransmission timer, and
    /// spawns the background receive thread. `window_size` is in segments.
    pub fn connect(dst: SocketAddr, window_size: usize, ack_port: u16) -> Result<Self, Error> {
        let sock = Arc::new(UdpSocket::bind(("127.0.0.1", ack_port))?);
        let src_port = sock.local_addr()?.port();

        let shared = Arc::new(Mutex::new(SendState {
            state: SenderState::Established,
            seq_num: 0,
            ack_num: 0,
            send_base: 0,
            window: VecDeque::new(),
            unsampled: HashMap::new(),
            rtt: RttEstimator::new(INIT_TIMEOUT),
        }));

        let timer = {
            let sock = sock.clone();
            let shared = shared.clone();
            Timer::new(INIT_TIMEOUT, move |timer| {
                retransmit(&sock, dst, &shared, timer)
            })
        };

        let (ctrl_tx, ctrl_rx) = mpsc::channel();
        let recv_thread = {
            let sock = sock.clone();
            let shared = shared.clone();
            let timer = timer.clone();
            thread::Builder::new()
                .name("rdt-sender-recv".into())
                .spawn(move || receive_loop(&sock, &shared, &timer, ctrl_tx))?
        };

        Ok(Sender {
            sock,
            dst,
            src_port,
            dst_port: dst.port(),
            window_size,
            shared,
            timer,
            ctrl: ctrl_rx,
            recv_thread: Some(recv_thread),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.sock.local_addr()?)
    }

    /// Non-blocking admit: frames `payload`, transmits it, and appends it to
    /// the window. Fails with [`Error::WindowFull`] when `window_size`
    /// segments are already in flight.
    pub fn send(&self, payload: &[u8]) -> Result<(), Error> {
        let mut st = self.shared.lock().unwrap();
        if st.window.len() >= self.window_size {
            return Err(Error::WindowFull);
        }

        let seg = self.build(
            st.seq_num,
            st.ack_num,
            Flags::new(false, false, false, false, false),
            payload.to_vec(),
        );
        send_segment(&self.sock, &seg, self.dst)?;
        self.post_send(&mut st, seg);
        Ok(())
    }

    /// Active close. Waits for retransmissions to drain the window, sends a
    /// FIN that consumes one sequence number and is tracked like data, then
    /// drives BEGIN_CLOSE -> FIN_WAIT_1 -> FIN_WAIT_2 -> TIME_WAIT -> CLOSED.
    pub fn terminate(mut self) -> Result<(), Error> {
        loop {
            let st = self.shared.lock().unwrap();
            if st.window.is_empty() {
                break;
            }
            if st.state == SenderState::Closed {
                return Err(Error::Closed);
            }
            drop(st);
            thread::sleep(TEARDOWN_POLL);
        }

        let fin_seq;
        {
            let mut st = self.shared.lock().unwrap();
            st.state = SenderState::BeginClose;
            let fin = self.build(
                st.seq_num,
                st.ack_num,
                Flags::new(false, false, false, false, true),
                Vec::new(),
            );
            fin_seq = fin.header.seq_num;
            send_segment(&self.sock, &fin, self.dst)?;
            self.post_send(&mut st, fin);
            st.state = SenderState::FinWait1;
        }
        info!(fin_seq, "fin sent");

        self.wait_fin_ack(fin_seq)?;
        let peer_fin = self.wait_peer_fin()?;
        self.time_wait(&peer_fin)?;

        self.shared.lock().unwrap().state = SenderState::Closed;
        self.timer.cancel();
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
        }
        info!("connection closed");
        Ok(())
    }

    /// Reads `source` in MSS chunks and pushes them through the window,
    /// sleeping while it is full, then runs the active close.
    pub fn transfer(self, source: &mut impl Read) -> Result<(), Error> {
        let mut chunk = [0u8; MSS];
        loop {
            let n = source.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            loop {
                match self.send(&chunk[..n]) {
                    Ok(()) => break,
                    Err(Error::WindowFull) => thread::sleep(WINDOW_RETRY),
                    Err(e) => return Err(e),
                }
            }
        }
        self.terminate()
    }

    fn build(&self, seq_num: u32, ack_num: u32, flags: Flags, payload: Vec<u8>) -> Segment {
        let header = Header::new(
            self.src_port,
            self.dst_port,
            seq_num,
            ack_num,
            flags,
            ADVERTISED_WND,
        );
        let mut seg = Segment::new(header, payload);
        seg.fill_checksum();
        seg
    }

    /// Window and timer bookkeeping shared by data and teardown sends.
    fn post_send(&self, st: &mut SendState, seg: Segment) {
        if !self.timer.is_alive() {
            self.timer.restart(Some(st.rtt.rto()));
        }
        st.unsampled.insert(seg.expected_ack(), Instant::now());
        st.seq_num = seg.expected_ack();
        st.window.push_back(seg);
    }

    /// FIN_WAIT_1: the peer has to acknowledge our FIN (and with it, by
    /// cumulation, everything before it).
    fn wait_fin_ack(&self, fin_seq: u32) -> Result<(), Error> {
        loop {
            match self.ctrl.recv_timeout(TEARDOWN_POLL) {
                Ok(seg) if seg.header.flags.ack() && seg.header.ack_num >= fin_seq + 1 => {
                    let mut st = self.shared.lock().unwrap();
                    st.send_base = seg.header.ack_num;
                    st.window.clear();
                    st.unsampled.clear();
                    st.state = SenderState::FinWait2;
                    drop(st);
                    self.timer.cancel();
                    debug!("fin acknowledged");
                    return Ok(());
                }
                Ok(seg) => {
                    trace!(
                        seq = seg.header.seq_num,
                        ack = seg.header.ack_num,
                        "ignored while waiting for fin ack"
                    );
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(Error::Closed),
            }
        }
    }

    /// FIN_WAIT_2: the peer flushes its own FIN.
    fn wait_peer_fin(&self) -> Result<Segment, Error> {
        loop {
            match self.ctrl.recv_timeout(TEARDOWN_POLL) {
                Ok(seg) if seg.header.flags.fin() => {
                    debug!(seq = seg.header.seq_num, "peer fin received");
                    return Ok(seg);
                }
                Ok(_) => {}
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(Error::Closed),
            }
        }
    }

    /// TIME_WAIT: acknowledge the peer's FIN, then linger to re-acknowledge
    /// retransmissions of it, until the peer confirms or the timeout passes.
    fn time_wait(&self, peer_fin: &Segment) -> Result<(), Error> {
        let final_ack;
        {
            let mut st = self.shared.lock().unwrap();
            st.ack_num = peer_fin.expected_ack();
            st.state = SenderState::TimeWait;
            final_ack = self.build(
                st.seq_num,
                st.ack_num,
                Flags::new(false, false, true, false, false),
                Vec::new(),
            );
            send_segment(&self.sock, &final_ack, self.dst)?;
            self.post_send(&mut st, final_ack.clone());
        }

        let deadline = Instant::now() + CLOSE_WAIT_TIME;
        while Instant::now() < deadline {
            match self.ctrl.recv_timeout(TEARDOWN_POLL) {
                Ok(seg)
                    if seg.header.flags.ack()
                        && seg.header.ack_num >= final_ack.expected_ack() =>
                {
                    debug!("final ack confirmed");
                    break;
                }
                Ok(seg) if seg.header.flags.fin() => {
                    // Our final ACK was lost; the peer is asking again.
                    send_segment(&self.sock, &final_ack, self.dst)?;
                }
                Ok(_) => {}
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }
}

/// Timer callback: resend the oldest unacknowledged segment, double the
/// timeout, and rearm.
fn retransmit(sock: &UdpSocket, dst: SocketAddr, shared: &Mutex<SendState>, timer: &Timer) {
    let mut st = shared.lock().unwrap();
    if st.state == SenderState::Closed || st.window.is_empty() {
        return;
    }

    if let Err(e) = send_segment(sock, &st.window[0], dst) {
        warn!(%e, "retransmission failed");
    }
    debug!(
        seq = st.window[0].header.seq_num,
        rto = ?st.rtt.rto(),
        "retransmitted head of window"
    );

    st.rtt.backoff();

    // Karn: nothing now in flight may produce an RTT sample.
    let inflight: Vec<u32> = st.window.iter().map(Segment::expected_ack).collect();
    for ack in inflight {
        st.unsampled.remove(&ack);
    }

    let rto = st.rtt.rto();
    drop(st);
    timer.restart(Some(rto));
}

/// Cumulative acknowledgment: advance the send base, drop what it covers,
/// rearm or cancel the timer, and feed the estimator when the ACK matches an
/// unsampled first transmission.
fn on_ack(st: &mut SendState, seg: &Segment, timer: &Timer) {
    let ack_num = seg.header.ack_num;
    if ack_num <= st.send_base {
        trace!(ack = ack_num, base = st.send_base, "duplicate ack ignored");
        return;
    }

    st.send_base = ack_num;
    let base = st.send_base;
    st.window.retain(|s| s.header.seq_num >= base);
    if st.window.is_empty() {
        timer.cancel();
    } else {
        timer.restart(Some(st.rtt.rto()));
    }

    if let Some(sent_at) = st.unsampled.remove(&ack_num) {
        st.rtt.sample(sent_at.elapsed());
    }

    debug!(
        send_base = base,
        inflight = st.window.len(),
        "window advanced"
    );
}

/// Background receive thread: the only socket reader on the sender side.
/// Data-path ACKs are applied inline; FIN-flagged segments, and everything
/// arriving once the state has left ESTABLISHED, are handed to the teardown
/// loop over the control channel.
fn receive_loop(
    sock: &UdpSocket,
    shared: &Mutex<SendState>,
    timer: &Timer,
    ctrl: mpsc::Sender<Segment>,
) {
    loop {
        if shared.lock().unwrap().state == SenderState::Closed {
            return;
        }

        match poll_readable(sock, RECV_POLL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                warn!(%e, "receive poll failed, closing");
                shared.lock().unwrap().state = SenderState::Closed;
                return;
            }
        }

        let seg = match recv_segment(sock) {
            Ok(Some((seg, _))) => seg,
            Ok(None) => continue,
            Err(e) => {
                warn!(%e, "receive failed, closing");
                shared.lock().unwrap().state = SenderState::Closed;
                return;
            }
        };

        let mut st = shared.lock().unwrap();
        if st.state == SenderState::Established && !seg.header.flags.fin() {
            on_ack(&mut st, &seg, timer);
        } else {
            drop(st);
            if ctrl.send(seg).is_err() {
                // Teardown is done and the sender is gone.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_timer() -> Timer {
        Timer::new(Duration::from_secs(60), |_| {})
    }

    fn state_with_window(segments: &[(u32, usize)]) -> SendState {
        let mut st = SendState {
            state: SenderState::Established,
            seq_num: 0,
            ack_num: 0,
            send_base: 0,
            window: VecDeque::new(),
            unsampled: HashMap::new(),
            rtt: RttEstimator::new(INIT_TIMEOUT),
        };
        for &(seq, len) in segments {
            let seg = Segment::new(
                Header::new(1, 2, seq, 0, Flags::default(), ADVERTISED_WND),
                vec![0xaa; len],
            );
            st.unsampled.insert(seg.expected_ack(), Instant::now());
            st.seq_num = seg.expected_ack();
            st.window.push_back(seg);
        }
        st
    }

    fn ack(ack_num: u32) -> Segment {
        Segment::new(
            Header::new(
                2,
                1,
                0,
                ack_num,
                Flags::new(false, false, true, false, false),
                ADVERTISED_WND,
            ),
            Vec::new(),
        )
    }

    #[test]
    fn cumulative_ack_drops_covered_segments() {
        let mut st = state_with_window(&[(0, 512), (512, 512), (1024, 512)]);
        let timer = idle_timer();

        on_ack(&mut st, &ack(1024), &timer);
        assert_eq!(st.send_base, 1024);
        assert_eq!(st.window.len(), 1);
        assert_eq!(st.window[0].header.seq_num, 1024);
    }

    #[test]
    fn duplicate_ack_is_ignored() {
        let mut st = state_with_window(&[(0, 512), (512, 512)]);
        let timer = idle_timer();

        on_ack(&mut st, &ack(512), &timer);
        let base = st.send_base;
        let len = st.window.len();
        on_ack(&mut st, &ack(512), &timer);
        assert_eq!(st.send_base, base);
        assert_eq!(st.window.len(), len);
    }

    #[test]
    fn ack_of_everything_cancels_the_timer() {
        let mut st = state_with_window(&[(0, 512)]);
        let timer = idle_timer();
        timer.start();

        on_ack(&mut st, &ack(512), &timer);
        assert!(st.window.is_empty());
        assert!(!timer.is_alive());
    }

    #[test]
    fn matching_ack_produces_an_rtt_sample() {
        let mut st = state_with_window(&[(0, 512)]);
        let timer = idle_timer();
        assert!(st.unsampled.contains_key(&512));

        on_ack(&mut st, &ack(512), &timer);
        assert!(st.unsampled.is_empty());
    }

    #[test]
    fn retransmission_evicts_rtt_candidates_and_backs_off() {
        let sock = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let dst = sock.local_addr().unwrap();
        let shared = Mutex::new(state_with_window(&[(0, 512), (512, 512)]));
        let timer = idle_timer();

        retransmit(&sock, dst, &shared, &timer);

        let st = shared.lock().unwrap();
        // No segment now in flight may ever produce an RTT sample.
        assert!(st.unsampled.is_empty());
        assert!(st.rtt.is_backed_off());
        assert_eq!(st.rtt.rto(), 2 * INIT_TIMEOUT);
        assert!(timer.is_alive());
        timer.cancel();
    }

    #[test]
    fn timer_expiry_is_a_noop_when_nothing_is_in_flight() {
        let sock = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let dst = sock.local_addr().unwrap();
        let shared = Mutex::new(state_with_window(&[]));
        let timer = idle_timer();

        retransmit(&sock, dst, &shared, &timer);

        let st = shared.lock().unwrap();
        assert!(!st.rtt.is_backed_off());
        assert!(!timer.is_alive());
    }

    #[test]
    fn window_full_is_surfaced_to_the_caller() {
        // A dummy peer that never answers.
        let peer = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let sender = Sender::connect(peer.local_addr().unwrap(), 2, 0).unwrap();

        sender.send(&[0u8; 512]).unwrap();
        sender.send(&[0u8; 512]).unwrap();
        assert!(matches!(sender.send(&[0u8; 512]), Err(Error::WindowFull)));

        {
            let st = sender.shared.lock().unwrap();
            assert_eq!(st.seq_num, 1024);
            assert_eq!(st.send_base, 0);
            assert_eq!(st.window.len(), 2);
        }

        // Shut the background machinery down instead of leaking it.
        sender.shared.lock().unwrap().state = SenderState::Closed;
        sender.timer.cancel();
    }
}
