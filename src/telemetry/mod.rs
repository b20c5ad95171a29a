//! Parsing of the device's inbound report lines. Lines reach the event sink
//! unmodified whether or not they parse here.
pub mod parser;
pub mod types;

pub use parser::{classify_severity, parse_line};
pub use types::*;
