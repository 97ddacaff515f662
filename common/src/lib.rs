//! Shared types used by the core translator and its collaborators
//! (`rvdbt-ukernel`, `rvdbt-aot`): the guest address newtype, page
//! arithmetic, and a small fixed-size bitset used both by the address
//! space's free-page tracker and by the profile store's per-page bitmaps.

pub mod gaddr;
pub mod page;
pub mod bitset;

pub use gaddr::GAddr;
pub use page::{page_number, page_offset, round_down, round_up, PAGE_SIZE};
