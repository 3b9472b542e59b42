pub mod mock;
pub mod provider;
pub mod sse;

pub use mock::{MockProvider, MockResponse};
pub use provider::{OpenAiCompatConfig, OpenAiCompatProvider};
