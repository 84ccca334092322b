//! Peer-group membership and connection coordination.
//!
//! The protocol lives in [`proto`] as a state machine without IO: network
//! and peer-source collaborators appear as input events, and every effect
//! the machine wants (dial, accept, send, schedule a timer) comes back as an
//! output event. [`net`] wires the machine to real collaborators on a tokio
//! task; [`stream`] is the buffered multi-consumer stream used to hand
//! events to late-joining subscribers.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod net;
pub mod proto;
pub mod stream;
