//! Shared vocabulary for the parley workspace: identifiers, chat messages,
//! tool definitions, and the streaming chat-completion contract.

pub mod errors;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod stream;
pub mod tools;
