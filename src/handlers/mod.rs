pub mod health;
pub mod diagnostics;
pub mod file_export;
pub mod file_save;

pub use health::*;
pub use diagnostics::*;
pub use file_export::*;
pub use file_save::*;
