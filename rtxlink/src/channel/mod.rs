//! Output accumulation and prompt detection.

mod buffer;
mod prompt;

pub use buffer::PatternBuffer;
pub use prompt::{PromptDetector, PromptSignal, RtxPromptDetector, clean_response};
