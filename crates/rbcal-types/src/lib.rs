pub mod constants;
pub mod params;
pub mod history;
pub mod result;
pub mod errors;

pub use params::*;
pub use history::*;
pub use result::*;
pub use errors::*;
