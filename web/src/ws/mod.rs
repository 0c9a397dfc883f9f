pub(crate) mod handler;
mod transport;
