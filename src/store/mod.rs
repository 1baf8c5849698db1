pub mod locks;
pub mod memory;
pub mod postgres;
pub mod snapshot_cache;
pub mod traits;

pub use locks::*;
pub use memory::*;
pub use postgres::*;
pub use snapshot_cache::*;
pub use traits::*;
