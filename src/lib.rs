//! Winsen Infrared CO2 Module MH-Z14A protocol handler and reporter.
//!
//! [MH-Z14 Datasheet](https://www.winsen-sensor.com/d/files/infrared-gas-sensor/mh-z14a_co2-manual-v1_01.pdf)
//!
//! The crate is split in two layers:
//! - [`codec`] builds command frames and decodes the sensor's byte stream one byte at a time.
//! - [`session`] configures the sensor at startup and polls it at a fixed cadence.
//!
//! Both are generic over an `embedded-hal` serial port and a [`MonotonicCounter`], so
//! the same code runs against `linux-embedded-hal` or a microcontroller UART.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod codec;
mod error;
pub mod session;

pub use crate::codec::{DetectionRange, PacketCodec, PacketKind};
pub use crate::error::{Error, Handshake, InvalidRange};
pub use crate::session::{Config, Session};

pub trait MonotonicCounter {
    /// Returns a measurement of the monotonic counter
    fn value(&self) -> u32;

    /// Returns the frequency at which the monotonic counter is operating at
    fn frequency(&self) -> u32;
}

#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
impl MonotonicCounter for std::time::Instant {
    fn value(&self) -> u32 {
        (self.elapsed().as_millis() & 0xffffffff) as u32
    }

    fn frequency(&self) -> u32 {
        1000
    }
}
