mod ioutil;
mod receiver;
mod segment;
mod sender;

pub use receiver::{ByteSink, Receiver, ReceiverState};
pub use segment::{Flags, Header, Segment};
pub use sender::{Sender, SenderState};

/// Receive-window advertisement carried in every outgoing header. The field
/// crosses the wire but is never consulted on receipt.
pub(crate) const ADVERTISED_WND: u16 = crate::RECV_BUF as u16;
