//! Wireless (NSO GameCube, "SW2" protocol) support.
//!
//! The controller speaks a proprietary command protocol over fixed ATT
//! handles and requires non-default SMP key distribution plus raw LE link
//! encryption, none of which a desktop Bluetooth daemon will do on our
//! behalf. The stack here therefore drives the adapter directly over an
//! HCI user-channel socket: `hci` owns the socket and packet codec, `att`
//! and `smp` are minimal protocol layers on top of it, `protocol` is the
//! pure SW2 command framing, and `central` sequences a connection.

pub mod att;
pub mod central;
pub mod hci;
pub mod protocol;
pub mod smp;
