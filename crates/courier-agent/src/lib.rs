pub mod anthropic;
pub mod backend;
pub mod codec;
pub mod cohere;
pub mod error;
pub mod openai;
pub mod request;

pub use backend::{build_backend, ChatBackend, ChatTurnParams};
pub use codec::VendorCodec;
pub use error::CompletionError;
pub use request::{ResultSink, StreamSink, StreamTuning};
