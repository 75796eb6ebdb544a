mod quality;
mod value;

pub use quality::Quality;
pub use value::{TagValue, Value};
