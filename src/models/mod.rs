pub mod health;
pub mod error;
pub mod diagnostics;
pub mod file_export;
pub mod file_save;
pub mod messages;

pub use health::*;
pub use error::*;
pub use diagnostics::*;
pub use file_export::*;
pub use file_save::*;
pub use messages::*;
