//! Raw SocketCAN transport (Linux only)

#[cfg(target_os = "linux")]
mod adapter;

#[cfg(target_os = "linux")]
pub use adapter::SocketCanTransport;

#[cfg(target_os = "linux")]
pub(crate) use adapter::is_device_gone;
