//! Transport-only client primitives for the chat web service.
//!
//! This crate owns request building, session bootstrap, retry/backoff,
//! uploads and response-frame decoding for the service's RPC endpoints.
//! It knows nothing about conversations or persistence: payload strings
//! inside frames are returned undecoded for the caller to interpret.
//!
//! Persona list and mutation RPCs are encoded and decoded in [`gems`]
//! since their payload shapes are part of the wire contract.

pub mod client;
pub mod config;
pub mod error;
pub mod frames;
pub mod gems;
pub mod headers;
pub mod payload;
pub mod retry;
pub mod url;

pub use client::{AccessSession, CancellationSignal, UploadTarget, WebApiClient};
pub use config::{SessionCookies, WebApiConfig};
pub use error::WebApiError;
pub use frames::{decode_frames, WireFrame};
pub use gems::WireGem;
pub use payload::{BatchCall, FileRef, GenerateCall, WireBatch};
pub use url::normalize_base_url;
