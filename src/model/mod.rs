pub mod branch;
pub mod common;
pub mod data_branch;
pub mod diff;
pub mod history;
pub mod merge;
pub mod object;
pub mod user_context;

pub use branch::*;
pub use common::*;
pub use data_branch::*;
pub use diff::*;
pub use history::*;
pub use merge::*;
pub use object::*;
pub use user_context::*;
