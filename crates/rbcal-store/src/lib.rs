pub mod layout;
pub mod archive;
pub mod results;
pub mod summary;

pub use layout::*;
pub use archive::*;
pub use results::*;
pub use summary::*;
