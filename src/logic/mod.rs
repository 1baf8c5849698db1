pub mod branch_ops;
pub mod data_branch;
pub mod diff;
pub mod merge;
pub mod migration;
pub mod objects;

pub use branch_ops::*;
pub use data_branch::*;
pub use diff::*;
pub use merge::*;
pub use migration::*;
pub use objects::*;
