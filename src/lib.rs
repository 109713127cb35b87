use std::time::Duration;

mod err;
pub use err::*;

mod contiguous;
mod rtt;
mod tcp;
mod timer;

pub use contiguous::longest_run;
pub use rtt::RttEstimator;
pub use tcp::{ByteSink, Flags, Header, Receiver, ReceiverState, Segment, Sender, SenderState};
pub use timer::Timer;

/// Maximum segment payload, in bytes.
pub const MSS: usize = 512;

/// Fixed header length, in bytes.
pub const HEADER_LEN: usize = 20;

/// Largest datagram either endpoint emits.
pub const MAX_DATAGRAM: usize = HEADER_LEN + MSS;

/// Receive buffer for a single datagram.
pub const RECV_BUF: usize = 2048;

/// Retransmission timeout before the first RTT sample.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long the active closer lingers in TIME_WAIT to absorb late
/// retransmissions of the peer's FIN.
pub const CLOSE_WAIT_TIME: Duration = Duration::from_secs(30);
