//! Browser-automation backend: wire vocabulary and WebSocket client.

pub mod client;
pub mod wire;

pub use client::{Transport, TransportConfig, WsTransport, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_TRANSPORT_URL};
pub use wire::{Request, Response, ResponseStatus, SelectorType, SequentialStep};
