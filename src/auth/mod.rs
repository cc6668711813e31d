//! External authorization: credentials, the state-token transform, and the
//! OAuth flow collaborator.

pub mod credential;
pub mod flow;
pub mod store;
pub mod token;

pub use credential::{Credential, IdentityKey};
pub use flow::{AuthorizationFlow, GoogleOAuthFlow};
pub use store::{CompletedAuthorization, CredentialStore, PendingAuthorization, Resolution};
pub use token::{StateClaims, StateTokenCodec};
