pub mod db;
pub mod error;
pub mod predicates;
pub mod store;
pub mod types;
pub mod verifier;

pub use store::UserStore;
pub use verifier::{Authenticator, VerifiedToken};
