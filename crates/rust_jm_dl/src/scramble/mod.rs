//! Undoing the strip shuffle the site applies to chapter images.
//!
//! [`split`] works out how many strips each image was cut into and
//! [`descramble`] puts the strips back in order.

pub mod descramble;
pub mod split;

pub use descramble::{descramble, descramble_image};
pub use split::{derive_split_counts, split_count};
