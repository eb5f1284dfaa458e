//! Keel Orders: example bounded context.
//!
//! Orders are placed against stock items; a fulfilment saga reserves stock
//! for each placed order and cancels the order when reservation fails.

pub mod application;
pub mod domain;
