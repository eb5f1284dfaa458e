//! Application services of the orders context.

pub mod command_handlers;
pub mod fulfilment;
pub mod query_handlers;

#[cfg(test)]
pub(crate) mod testing;
