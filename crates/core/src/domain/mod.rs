pub mod hierarchy;
pub mod metric;
pub mod period;
pub mod result;
