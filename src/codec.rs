//! MH-Z14A packet codec.
//!
//! Every exchange with the sensor is a 9-byte frame:
//!
//! | byte | host -> sensor | sensor -> host |
//! |------|----------------|----------------|
//! | 0    | `0xFF`         | `0xFF`         |
//! | 1    | address `0x01` | command        |
//! | 2    | command        | data high      |
//! | 3    | argument high  | data low       |
//! | 4    | argument low   | payload        |
//! | 5..7 | zero           | payload        |
//! | 8    | checksum       | checksum       |
//!
//! The checksum is the two's complement of the sum of bytes 1..8, so the sum of a
//! whole frame is always `0xFF` modulo 256.

use core::convert::TryFrom;
use core::fmt;

use embedded_hal::serial::{Read, Write};
use log::{debug, trace, warn};

use crate::error::{Error, InvalidRange};

/// Both input and output packets are 9 bytes long
pub const FRAME_LEN: usize = 9;

pub type Frame = [u8; FRAME_LEN];

const START_BYTE: u8 = 0xff;
const SENSOR_ADDRESS: u8 = 0x01;

const READ_CO2: u8 = 0x86;
const ABC: u8 = 0x79;
const SET_RANGE: u8 = 0x99;

/// Kind of a complete, checksum-valid frame received from the sensor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    /// CO2 concentration reading
    Co2Level,
    /// Acknowledgement of the ABC off command
    AbcOff,
    /// Acknowledgement of the set range command
    SetRange,
    /// Any other command code
    Other(u8),
}

impl PacketKind {
    fn from_command(command: u8) -> Self {
        match command {
            READ_CO2 => PacketKind::Co2Level,
            ABC => PacketKind::AbcOff,
            SET_RANGE => PacketKind::SetRange,
            other => PacketKind::Other(other),
        }
    }
}

/// Sensor detection range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionRange {
    Ppm2000,
    Ppm5000,
    Ppm10000,
}

impl DetectionRange {
    pub fn ppm(self) -> u16 {
        match self {
            DetectionRange::Ppm2000 => 2000,
            DetectionRange::Ppm5000 => 5000,
            DetectionRange::Ppm10000 => 10000,
        }
    }
}

impl Default for DetectionRange {
    fn default() -> Self {
        DetectionRange::Ppm10000
    }
}

impl TryFrom<u16> for DetectionRange {
    type Error = InvalidRange;

    fn try_from(ppm: u16) -> Result<Self, Self::Error> {
        match ppm {
            2000 => Ok(DetectionRange::Ppm2000),
            5000 => Ok(DetectionRange::Ppm5000),
            10000 => Ok(DetectionRange::Ppm10000),
            other => Err(InvalidRange(other)),
        }
    }
}

impl fmt::Display for DetectionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ppm", self.ppm())
    }
}

fn checksum(payload: &[u8]) -> u8 {
    0u8.wrapping_sub(payload.iter().fold(0u8, |sum, c| sum.wrapping_add(*c)))
}

fn command_frame(command: u8, byte3: u8, byte4: u8) -> Frame {
    let mut buffer = [0u8; FRAME_LEN];
    buffer[0] = START_BYTE;
    buffer[1] = SENSOR_ADDRESS;
    buffer[2] = command;
    buffer[3] = byte3;
    buffer[4] = byte4;
    buffer[8] = checksum(&buffer[1..8]);
    buffer
}

/// "Read CO2 concentration" request: `FF 01 86 00 00 00 00 00 79`
pub fn read_co2_frame() -> Frame {
    command_frame(READ_CO2, 0x00, 0x00)
}

/// Disable Automatic Baseline Correction: `FF 01 79 00 00 00 00 00 86`
pub fn abc_off_frame() -> Frame {
    command_frame(ABC, 0x00, 0x00)
}

/// Set the detection range, big-endian in bytes 3 and 4
pub fn set_range_frame(range: DetectionRange) -> Frame {
    let [high, low] = range.ppm().to_be_bytes();
    command_frame(SET_RANGE, high, low)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RxState {
    Start,
    Command,
    DataHigh,
    DataLow,
    /// Uninterpreted payload bytes still to come before the checksum
    Payload(u8),
    Checksum,
}

/// Byte-at-a-time receive state machine.
///
/// A frame is only recognised when `0xFF` arrives while waiting for a start byte; a
/// stray `0xFF` inside a frame is treated as data. The measurement is committed
/// only once a CO2 frame passes its checksum.
#[derive(Debug)]
pub struct Receiver {
    state: RxState,
    sum: u8,
    packet: Option<PacketKind>,
    data: [u8; 2],
    co2_level: Option<u16>,
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            state: RxState::Start,
            sum: 0,
            packet: None,
            data: [0; 2],
            co2_level: None,
        }
    }

    /// Last accepted CO2 concentration in ppm
    pub fn co2_level(&self) -> Option<u16> {
        self.co2_level
    }

    /// Feed one byte. Returns the kind of frame it completed, if any.
    pub fn push(&mut self, byte: u8) -> Option<PacketKind> {
        trace!("rx {:#04x}", byte);
        self.sum = self.sum.wrapping_add(byte);

        match self.state {
            RxState::Start => {
                if byte == START_BYTE {
                    self.sum = byte;
                    self.state = RxState::Command;
                }
            }
            RxState::Command => {
                let kind = PacketKind::from_command(byte);
                trace!("frame classified as {:?}", kind);
                self.packet = Some(kind);
                self.state = RxState::DataHigh;
            }
            RxState::DataHigh => {
                self.data[0] = byte;
                self.state = RxState::DataLow;
            }
            RxState::DataLow => {
                self.data[1] = byte;
                self.state = RxState::Payload(4);
            }
            RxState::Payload(remaining) => {
                self.state = if remaining > 1 {
                    RxState::Payload(remaining - 1)
                } else {
                    RxState::Checksum
                };
            }
            RxState::Checksum => {
                self.state = RxState::Start;
                let packet = self.packet.take()?;
                if self.sum != 0xff {
                    trace!("dropping {:?} frame, checksum sum {:#04x}", packet, self.sum);
                    return None;
                }
                if packet == PacketKind::Co2Level {
                    self.co2_level = Some(u16::from_be_bytes(self.data));
                }
                trace!("accepted {:?} frame", packet);
                return Some(packet);
            }
        }

        None
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

/// Command encoder and frame decoder bound to a serial link.
pub struct PacketCodec<S> {
    serial: S,
    receiver: Receiver,
}

impl<E, S> PacketCodec<S>
where
    E: fmt::Debug,
    S: Read<u8, Error = E> + Write<u8, Error = E>,
{
    pub fn new(serial: S) -> Self {
        Self {
            serial,
            receiver: Receiver::new(),
        }
    }

    pub fn free(self) -> S {
        self.serial
    }

    /// Last accepted CO2 concentration in ppm
    pub fn co2_level(&self) -> Option<u16> {
        self.receiver.co2_level()
    }

    /// Consume at most one byte from the link.
    ///
    /// Returns the packet kind when that byte completes a valid frame. Read errors
    /// are logged and treated like an idle link.
    pub fn rx_packet(&mut self) -> Option<PacketKind> {
        match self.serial.read() {
            Ok(byte) => self.receiver.push(byte),
            Err(nb::Error::WouldBlock) => None,
            Err(nb::Error::Other(e)) => {
                warn!("serial read failed: {:?}", e);
                None
            }
        }
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        debug!("tx {:02x?}", frame);
        for b in frame {
            nb::block!(self.serial.write(*b)).map_err(Error::Serial)?;
        }
        nb::block!(self.serial.flush()).map_err(Error::Serial)
    }

    /// Ask the sensor for its current CO2 concentration
    pub fn request_co2_level(&mut self) -> Result<(), Error<E>> {
        self.send_frame(&read_co2_frame())
    }

    /// Disable Automatic Baseline Correction (ABC)
    pub fn abc_off(&mut self) -> Result<(), Error<E>> {
        self.send_frame(&abc_off_frame())
    }

    /// Set the detection range. Only 2000, 5000 and 10000 ppm are accepted;
    /// nothing is written for any other value.
    pub fn set_range(&mut self, ppm: u16) -> Result<(), Error<E>> {
        let range = DetectionRange::try_from(ppm)?;
        self.set_detection_range(range)
    }

    pub fn set_detection_range(&mut self, range: DetectionRange) -> Result<(), Error<E>> {
        self.send_frame(&set_range_frame(range))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub(crate) struct Link {
        pub(crate) rx: VecDeque<u8>,
        pub(crate) tx: Vec<u8>,
    }

    impl Read<u8> for Link {
        type Error = ();

        fn read(&mut self) -> nb::Result<u8, ()> {
            self.rx.pop_front().ok_or(nb::Error::WouldBlock)
        }
    }

    impl Write<u8> for Link {
        type Error = ();

        fn write(&mut self, word: u8) -> nb::Result<(), ()> {
            self.tx.push(word);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), ()> {
            Ok(())
        }
    }

    fn feed(receiver: &mut Receiver, bytes: &[u8]) -> Vec<PacketKind> {
        bytes.iter().filter_map(|b| receiver.push(*b)).collect()
    }

    pub(crate) fn response(command: u8, high: u8, low: u8) -> Frame {
        let mut frame = [START_BYTE, command, high, low, 0, 0, 0, 0, 0];
        frame[8] = checksum(&frame[1..8]);
        frame
    }

    fn frame_sum(frame: &[u8]) -> u8 {
        frame.iter().fold(0u8, |sum, c| sum.wrapping_add(*c))
    }

    #[test]
    fn fixed_command_frames() {
        assert_eq!(read_co2_frame(), [0xff, 0x01, 0x86, 0, 0, 0, 0, 0, 0x79]);
        assert_eq!(abc_off_frame(), [0xff, 0x01, 0x79, 0, 0, 0, 0, 0, 0x86]);
    }

    #[test]
    fn outbound_frames_sum_to_ff() {
        let frames = [
            read_co2_frame(),
            abc_off_frame(),
            set_range_frame(DetectionRange::Ppm2000),
            set_range_frame(DetectionRange::Ppm5000),
            set_range_frame(DetectionRange::Ppm10000),
        ];
        for frame in &frames {
            assert_eq!(frame_sum(frame), 0xff, "{:02x?}", frame);
        }
    }

    #[test]
    fn abc_off_ack() {
        let mut receiver = Receiver::new();
        let bytes = [0xff, 0x79, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x86];
        for b in &bytes[..8] {
            assert_eq!(receiver.push(*b), None);
        }
        assert_eq!(receiver.push(bytes[8]), Some(PacketKind::AbcOff));
        assert_eq!(receiver.co2_level(), None);
    }

    #[test]
    fn co2_reading() {
        let mut receiver = Receiver::new();
        let kinds = feed(&mut receiver, &[0xff, 0x86, 0x01, 0xa4, 0, 0, 0, 0, 0xd5]);
        assert_eq!(kinds, vec![PacketKind::Co2Level]);
        assert_eq!(receiver.co2_level(), Some(420));
    }

    #[test]
    fn corrupt_frame_keeps_previous_reading() {
        let mut receiver = Receiver::new();
        feed(&mut receiver, &response(READ_CO2, 0x01, 0xa4));
        assert_eq!(receiver.co2_level(), Some(420));

        let kinds = feed(&mut receiver, &[0xff, 0x86, 0x01, 0xa4, 0, 0, 0, 0, 0]);
        assert!(kinds.is_empty());
        let kinds = feed(&mut receiver, &[0xff, 0x86, 0x03, 0x20, 0, 0, 0, 0, 0]);
        assert!(kinds.is_empty());
        assert_eq!(receiver.co2_level(), Some(420));
    }

    #[test]
    fn unknown_command_is_surfaced() {
        let mut receiver = Receiver::new();
        let kinds = feed(&mut receiver, &response(0x9b, 0x27, 0x10));
        assert_eq!(kinds, vec![PacketKind::Other(0x9b)]);
        assert_eq!(receiver.co2_level(), None);
    }

    #[test]
    fn ff_inside_frame_is_data() {
        let mut receiver = Receiver::new();
        let frame = response(READ_CO2, 0xff, 0x00);
        let kinds = feed(&mut receiver, &frame);
        assert_eq!(kinds, vec![PacketKind::Co2Level]);
        assert_eq!(receiver.co2_level(), Some(0xff00));
    }

    #[test]
    fn back_to_back_frames() {
        let mut receiver = Receiver::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&response(ABC, 0x01, 0x00));
        bytes.extend_from_slice(&response(SET_RANGE, 0x01, 0x00));
        bytes.extend_from_slice(&response(READ_CO2, 0x02, 0x00));
        let kinds = feed(&mut receiver, &bytes);
        assert_eq!(
            kinds,
            vec![PacketKind::AbcOff, PacketKind::SetRange, PacketKind::Co2Level]
        );
        assert_eq!(receiver.co2_level(), Some(512));
    }

    #[test]
    fn set_range_encodes_big_endian() {
        let mut codec = PacketCodec::new(Link::default());
        codec.set_range(10000).unwrap();
        let link = codec.free();
        assert_eq!(&link.tx[..8], &[0xff, 0x01, 0x99, 0x27, 0x10, 0, 0, 0]);
        assert_eq!(link.tx[8], 0x2f);
        assert_eq!(frame_sum(&link.tx), 0xff);
    }

    #[test]
    fn set_range_rejects_unsupported_value() {
        let mut codec = PacketCodec::new(Link::default());
        assert_eq!(codec.set_range(3000), Err(Error::InvalidRange(InvalidRange(3000))));
        assert!(codec.free().tx.is_empty());
    }

    #[test]
    fn rx_packet_reads_one_byte_per_call() {
        let mut link = Link::default();
        link.rx.extend(response(READ_CO2, 0x01, 0xa4).iter());
        let mut codec = PacketCodec::new(link);
        for _ in 0..8 {
            assert_eq!(codec.rx_packet(), None);
        }
        assert_eq!(codec.rx_packet(), Some(PacketKind::Co2Level));
        assert_eq!(codec.co2_level(), Some(420));
        assert_eq!(codec.rx_packet(), None);
    }

    #[test]
    fn commands_written_whole() {
        let mut codec = PacketCodec::new(Link::default());
        codec.abc_off().unwrap();
        codec.request_co2_level().unwrap();
        let link = codec.free();
        assert_eq!(&link.tx[..9], &abc_off_frame()[..]);
        assert_eq!(&link.tx[9..], &read_co2_frame()[..]);
    }

    fn any_byte() -> impl Strategy<Value = u8> {
        prop_oneof![Just(0xffu8), any::<u8>()]
    }

    proptest! {
        #[test]
        fn command_checksum_holds(command in any::<u8>(), high in any::<u8>(), low in any::<u8>()) {
            prop_assert_eq!(frame_sum(&command_frame(command, high, low)), 0xff);
        }

        #[test]
        fn garbage_prefix_is_skipped(
            garbage in proptest::collection::vec(0u8..0xff, 0..64),
            command in any::<u8>(),
            high in any::<u8>(),
            low in any::<u8>(),
        ) {
            let frame = response(command, high, low);

            let mut clean = Receiver::new();
            let expected = feed(&mut clean, &frame);

            let mut receiver = Receiver::new();
            let mut bytes = garbage;
            bytes.extend_from_slice(&frame);
            let kinds = feed(&mut receiver, &bytes);

            prop_assert_eq!(kinds.len(), 1);
            prop_assert_eq!(kinds, expected);
            prop_assert_eq!(receiver.co2_level(), clean.co2_level());
        }

        #[test]
        fn framing_recovers_after_dropped_byte(
            dropped in 0usize..FRAME_LEN,
            readings in proptest::collection::vec((0u8..0xff, 0u8..0xff), 4),
        ) {
            let frames: Vec<Frame> = readings
                .iter()
                .map(|(high, low)| response(READ_CO2, *high, *low))
                .collect();
            prop_assume!(frames.iter().all(|f| f[8] != 0xff));

            let mut bytes: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
            bytes.remove(dropped);

            let mut receiver = Receiver::new();
            let mut seen = Vec::new();
            for b in bytes {
                if receiver.push(b) == Some(PacketKind::Co2Level) {
                    seen.push(receiver.co2_level().unwrap());
                }
            }

            let values: Vec<u16> = readings
                .iter()
                .map(|(high, low)| u16::from_be_bytes([*high, *low]))
                .collect();
            prop_assert!(seen.len() >= 2);
            prop_assert!(values[1..].ends_with(&seen));
        }

        #[test]
        fn measurement_changes_only_on_co2_frames(
            bytes in proptest::collection::vec(any_byte(), 0..256),
        ) {
            let mut receiver = Receiver::new();
            for b in bytes {
                let before = receiver.co2_level();
                let kind = receiver.push(b);
                if kind != Some(PacketKind::Co2Level) {
                    prop_assert_eq!(receiver.co2_level(), before);
                }
            }
        }

        #[test]
        fn unsupported_ranges_write_nothing(ppm in any::<u16>()) {
            prop_assume!(ppm != 2000 && ppm != 5000 && ppm != 10000);
            let mut codec = PacketCodec::new(Link::default());
            prop_assert_eq!(codec.set_range(ppm), Err(Error::InvalidRange(InvalidRange(ppm))));
            prop_assert!(codec.free().tx.is_empty());
        }
    }
}
