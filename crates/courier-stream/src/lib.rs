pub mod lines;
pub mod parsers;
pub mod sse;

pub use lines::LineFramer;
pub use parsers::{ParseOutcome, SseParser};
pub use sse::{SseDecoder, SseRecord};
