mod packet;
pub use packet::*;
