//! Strategy metadata models.

mod algo;

pub use algo::AlgoIndexItem;
