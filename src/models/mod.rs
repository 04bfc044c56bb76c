pub mod token;
pub mod user;

pub use token::{
    AccessToken, RefreshRecord, RefreshToken, RotateOutcome, TokenPair, TokenScope,
};
pub use user::{normalize_email, AccountState, NewIdentity, UserIdentity, UserResponse};
