//! Session and round machinery for an anonymous
//! group-communication engine.
//!
//! A fixed set of servers repeatedly bootstraps *rounds* (the
//! pluggable anonymity primitive), clients enroll through a
//! single active server, and both roles run signed state
//! machines that tolerate churn, duplication and out-of-order
//! arrival. See the protocol crate for the wire message
//! taxonomy.

#![deny(missing_docs)]

mod client;
mod config;
mod driver;
mod error;
mod event;
mod manager;
mod mlog;
mod overlay;
mod queue;
mod round;
pub mod rounds;
mod server;
mod shared;

pub use client::{ClientSession, ClientState};
pub use config::SessionConfig;
pub use driver::{NetworkEvent, SessionCommand, SessionDriver};
pub use error::Error;
pub use event::{
    event_channel, ChannelSink, EventReceiver, EventSender,
    NullSink, OutputSink, SessionEvent,
};
pub use manager::{Session, SessionManager};
pub use mlog::MessageLog;
pub use overlay::Overlay;
pub use queue::DataQueue;
pub use round::{
    CreateRound, FetchData, Round, RoundContext, RoundOutcome,
    RoundRegistry, RoundStatus, RoundTransport, SlotOutput,
};
pub use server::{ServerSession, ServerState};
pub use shared::{
    AgreeEntry, Clock, RegisterEntry, SessionOptions,
    SharedSessionState, SystemClock, TimerKind,
};

/// Result type for the session library.
pub type Result<T> = std::result::Result<T, Error>;
