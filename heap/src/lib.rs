mod heap;
mod system;

pub use heap::*;
pub use system::{OS_PAGE_SIZE, Region};
