//! Minimal HTTP surface: the status-line table, the fixed-order response
//! header serializer, request parsing sufficient for routing and
//! keep-alive decisions, and RFC1123 clock helpers.

pub mod clock;
pub mod header;
pub mod request;
pub mod status;
