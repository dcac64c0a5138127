pub mod error;
pub mod types;

pub use error::{ErrorKind, Result, SheetError};
pub use types::{BatchId, HandleId, HandleState, SessionId};
