//! API request handlers

mod conditions;
mod health;
mod users;

pub use conditions::*;
pub use health::*;
pub use users::*;
