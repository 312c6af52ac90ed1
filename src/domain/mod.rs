//! Core domain entities: sessions, API keys, and token formats.

pub mod api_key;
pub mod session;
pub mod token;

pub use api_key::{ApiKey, ApiKeyRole, ApiKeyStatus};
pub use session::{
    Session, SessionFilter, SessionPage, SessionSort, new_session_id, validate_session_id,
};
