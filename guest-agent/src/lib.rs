//! Guest agent library — thin wiring around `vsock-guest`'s dispatcher.

pub use vsock_guest::{handle_connection, log, run, VsockListener};
