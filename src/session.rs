//! Startup handshake and steady-state polling.

use core::fmt;
use core::time::Duration;

use embedded_hal::serial::{Read, Write};
use log::{debug, info, trace, warn};

use crate::codec::{DetectionRange, PacketCodec, PacketKind};
use crate::error::{Error, Handshake};
use crate::MonotonicCounter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Detection range configured at startup
    pub range: DetectionRange,
    /// Time between CO2 level requests
    pub interval: Duration,
    /// How long to wait for each startup command to be acknowledged
    pub handshake_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            range: DetectionRange::Ppm10000,
            interval: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(2),
        }
    }
}

pub struct Session<S, C> {
    codec: PacketCodec<S>,
    counter: C,
    config: Config,
    ref_time: Option<u32>,
}

impl<E, S, C> Session<S, C>
where
    E: fmt::Debug,
    S: Read<u8, Error = E> + Write<u8, Error = E>,
    C: MonotonicCounter,
{
    pub fn new(serial: S, counter: C, config: Config) -> Self {
        Self {
            codec: PacketCodec::new(serial),
            counter,
            config,
            ref_time: None,
        }
    }

    pub fn free(self) -> (S, C) {
        (self.codec.free(), self.counter)
    }

    pub fn codec(&self) -> &PacketCodec<S> {
        &self.codec
    }

    fn ticks(&self, duration: Duration) -> u32 {
        let ticks = duration.as_micros() * u128::from(self.counter.frequency()) / 1_000_000;
        // Wrapping comparisons only hold for intervals below half the counter range
        ticks.min(u128::from(u32::MAX / 2)) as u32
    }

    /// Disable ABC and set the detection range, waiting for each acknowledgement.
    pub fn initialize(&mut self) -> Result<(), Error<E>> {
        debug!("requesting ABC off");
        self.codec.abc_off()?;
        self.await_ack(Handshake::AbcOff)?;

        debug!("requesting detection range {}", self.config.range);
        self.codec.set_detection_range(self.config.range)?;
        self.await_ack(Handshake::SetRange)?;

        info!("sensor initialised, range {}", self.config.range);
        Ok(())
    }

    fn await_ack(&mut self, step: Handshake) -> Result<(), Error<E>> {
        let expected = match step {
            Handshake::AbcOff => PacketKind::AbcOff,
            Handshake::SetRange => PacketKind::SetRange,
        };

        let t0 = self.counter.value();
        let dt = self.ticks(self.config.handshake_timeout);

        while self.counter.value().wrapping_sub(t0) < dt {
            match self.codec.rx_packet() {
                Some(kind) if kind == expected => return Ok(()),
                Some(kind) => trace!("ignoring {:?} while waiting for '{}' ack", kind, step),
                None => {}
            }
        }

        Err(Error::HandshakeTimeout(step))
    }

    /// One iteration of the polling loop.
    ///
    /// Pumps the decoder once and returns the reading if that completed a CO2 frame.
    /// A request is sent every time the clock passes the next multiple of the
    /// interval counted from the first call, so late iterations do not shift the
    /// schedule.
    pub fn poll(&mut self) -> Option<u16> {
        let reading = match self.codec.rx_packet() {
            Some(PacketKind::Co2Level) => self.codec.co2_level(),
            _ => None,
        };

        let interval = self.ticks(self.config.interval);
        let now = self.counter.value();
        let ref_time = *self.ref_time.get_or_insert(now);

        if now.wrapping_sub(ref_time) > interval {
            debug!("requesting CO2 level");
            if let Err(e) = self.codec.request_co2_level() {
                warn!("failed to request CO2 level: {}", e);
            }
            self.ref_time = Some(ref_time.wrapping_add(interval));
        }

        reading
    }

    /// Poll forever, writing each reading to `out` as a decimal line.
    ///
    /// Only returns if writing to `out` fails.
    #[cfg(feature = "std")]
    #[cfg_attr(docsrs, doc(cfg(feature = "std")))]
    pub fn run<W: std::io::Write>(&mut self, mut out: W) -> std::io::Result<()> {
        loop {
            if let Some(ppm) = self.poll() {
                writeln!(out, "{}", ppm)?;
                out.flush()?;
            }
        }
    }
}
