//! Wire protocol support. `external` holds the Bitcoin message types and
//! codec this crate speaks on the network.

pub mod external;
