//! Register command.
//!
//! Records a piece of content on behalf of the logged-in user:
//!
//! ```text
//! Request:  1{"Content":"hello"}
//! Response: none on success, `ERR <reason>` otherwise
//! ```

pub mod handler;
pub mod parser;

pub use handler::RegisterHandler;
pub use parser::RegisterCommand;
