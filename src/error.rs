use core::fmt;

use thiserror::Error;

/// Configuration exchange performed during startup
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handshake {
    /// Disable Automatic Baseline Correction
    AbcOff,
    /// Set the detection range
    SetRange,
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Handshake::AbcOff => "ABC off",
            Handshake::SetRange => "set range",
        })
    }
}

/// Detection range is not one of 2000, 5000 or 10000 ppm
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("invalid detection range {0} ppm, expected 2000, 5000 or 10000")]
pub struct InvalidRange(pub u16);

#[derive(Debug, PartialEq, Error)]
pub enum Error<E> {
    /// Underlying serial port error
    #[error("serial link error: {0:?}")]
    Serial(E),
    /// The sensor did not acknowledge a startup command in time
    #[error("error initialising sensor - did not receive response from '{0}' command")]
    HandshakeTimeout(Handshake),
    #[error(transparent)]
    InvalidRange(#[from] InvalidRange),
}
