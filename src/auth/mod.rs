// Authentication module
// Credential persistence, CSRF tokens and the single-flight session refresher

mod credentials;
mod csrf;
mod refresh;
mod types;

pub use credentials::{CredentialStore, CREDENTIALS_NAMESPACE};
pub use csrf::{CsrfProvider, CsrfSettings};
pub use refresh::SessionRefresher;
pub use types::SessionCredentials;
