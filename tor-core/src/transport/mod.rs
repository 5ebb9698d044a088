//! Transport-plane framing. Direct-TCP/TLS links use the cell codec in
//! [`crate::cell`] directly; when direct connections are unavailable,
//! cells are instead carried over the Snowflake stack in this module.

pub mod snowflake;
