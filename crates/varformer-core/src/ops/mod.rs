pub mod arithmetic;
pub mod manipulation;
pub mod reduction;

pub use manipulation::normalize_axis;
