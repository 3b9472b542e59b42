//! Realtime WebSocket server: wire protocol, per-connection session
//! orchestration, collaborator interfaces and settings.

pub mod collaborators;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod session;
pub mod settings;

pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use session::{Session, SessionDeps, SessionError, SessionOptions};
pub use settings::{load_settings, load_settings_from_path, Settings, SettingsError};
