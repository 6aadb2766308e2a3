pub mod error;
pub mod types;
pub mod value;

pub use error::{Result, RouterError};
pub use types::{Deadline, Document, Epoch, Namespace, ShardId};
