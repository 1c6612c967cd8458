pub mod auth;
pub mod db;

pub use auth::{AuthSessionStore, CookieAuth, MemoryAuthSessions};
pub use db::DbAdapter;
