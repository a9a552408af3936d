pub mod forward;
pub mod probe;
pub mod replicate;
pub mod ticket;
