pub mod manager;
pub mod models;
pub mod state;

pub use manager::{OAuthProvider, TokenManager};
pub use models::{ConnectionStatus, RefreshError, StoredToken, TokenGrant};
pub use state::{sign_state, verify_state};
