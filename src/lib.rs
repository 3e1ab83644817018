pub mod cli;
pub mod elf;
pub mod error;
pub mod external;
pub mod loader;
pub mod logging;
pub mod oracle;
pub mod paravirt;
pub mod patch;
pub mod process;
pub mod quirks;
pub mod systemmap;
pub mod targets;
pub mod validator;

pub use error::{IntegrityError, Result};
