//! Named-data building blocks over a request/response transport.
//! Host-driven: nothing here does I/O or spawns threads. Completions are
//! delivered when the host calls [`Face::pump`].

pub mod assembler;
pub mod cache;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod face;
pub mod name;
pub mod packet;
pub mod pit;
pub mod pubsub;
pub mod retry;
pub mod segment;
pub mod wire;

pub use assembler::{SegmentAssembler, StreamEvent, StreamState};
pub use cache::NamedCache;
pub use cancel::CancelToken;
pub use client::{FetchHandle, SegmentedClient};
pub use config::Config;
pub use error::{Error, Result};
pub use face::{pump_until, Face, FaceTable, LocalFace, PumpConfig, RequestHandler};
pub use name::{Component, Name, NameParseError};
pub use packet::{ChildSelector, Freshness, Packet, Request, Response};
pub use pit::PendingRequestTable;
pub use pubsub::{AnnouncementService, Message, Publisher, Subscriber};
pub use retry::{send_with_retry, RetryPolicy, RetryStats};
pub use wire::{decode_packet, encode_packet, WireError, MAX_DATAGRAM};
