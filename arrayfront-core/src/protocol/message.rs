//! Typed commands (host → device) and events (device → host).

use serde::{Deserialize, Serialize};

use super::{codec::Frame, FrameError};

/// Host → device event codes.
pub mod host_code {
    pub const ENABLE_BEAMFORMING: u8 = 0x01;
    pub const DISABLE_BEAMFORMING: u8 = 0x02;
    pub const QUERY_BEAMFORMING_STATUS: u8 = 0x03;
    pub const SET_BEAM_DIRECTION: u8 = 0x04;
    pub const QUERY_DIRECTION_OF_ARRIVAL: u8 = 0x05;
    pub const QUERY_BEAM_DIRECTIONS: u8 = 0x06;
    pub const QUERY_WAKE_WORDS: u8 = 0x07;
    pub const SET_INDICATOR: u8 = 0x08;
}

/// Device → host event codes.
pub mod device_code {
    pub const WAKE_DETECTED: u8 = 0x81;
    pub const WAKE_WORDS: u8 = 0x82;
    pub const DIRECTION_OF_ARRIVAL: u8 = 0x83;
    pub const BEAM_DIRECTIONS: u8 = 0x84;
    pub const BEAMFORMING_STATUS: u8 = 0x85;
}

/// Commands the host can send to the signal-processing unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    EnableBeamforming,
    DisableBeamforming,
    QueryBeamformingStatus,
    /// Steer the fixed beam to `angle` degrees.
    SetBeamDirection(i16),
    QueryDirectionOfArrival,
    QueryBeamDirectionList,
    QueryWakeWords,
    /// Light the indicator for one beam channel (bit `channel` of the mask).
    IndicatorOn(u8),
    IndicatorOff,
}

impl HostCommand {
    pub fn code(&self) -> u8 {
        use host_code::*;
        match self {
            Self::EnableBeamforming => ENABLE_BEAMFORMING,
            Self::DisableBeamforming => DISABLE_BEAMFORMING,
            Self::QueryBeamformingStatus => QUERY_BEAMFORMING_STATUS,
            Self::SetBeamDirection(_) => SET_BEAM_DIRECTION,
            Self::QueryDirectionOfArrival => QUERY_DIRECTION_OF_ARRIVAL,
            Self::QueryBeamDirectionList => QUERY_BEAM_DIRECTIONS,
            Self::QueryWakeWords => QUERY_WAKE_WORDS,
            Self::IndicatorOn(_) | Self::IndicatorOff => SET_INDICATOR,
        }
    }

    /// Payload bytes (little-endian multi-byte fields).
    pub fn payload(&self) -> Result<Vec<u8>, FrameError> {
        Ok(match self {
            Self::SetBeamDirection(angle) => angle.to_le_bytes().to_vec(),
            Self::IndicatorOn(channel) => {
                let mask = 1u16
                    .checked_shl(*channel as u32)
                    .ok_or(FrameError::IndicatorOutOfRange(*channel))?;
                mask.to_le_bytes().to_vec()
            }
            Self::IndicatorOff => 0u16.to_le_bytes().to_vec(),
            _ => Vec::new(),
        })
    }

    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Ok(Frame::new(self.code(), self.payload()?))
    }
}

/// Events reported by the signal-processing unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceEvent {
    WakeDetected,
    WakeWords { words: Vec<String> },
    DirectionOfArrival { angle: i16 },
    BeamDirections { angles: Vec<i16> },
    BeamformingStatus { angle: i16, enabled: bool },
    /// A well-formed frame carrying a code this host does not know.
    Unknown { code: u8, payload: Vec<u8> },
}

impl DeviceEvent {
    /// Interpret a decoded frame.
    ///
    /// # Errors
    /// `FrameError::ShortPayload` when a known event carries fewer bytes than
    /// its fixed fields need.
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        use device_code::*;
        let p = PayloadReader::new(frame.code, &frame.payload);
        Ok(match frame.code {
            WAKE_DETECTED => Self::WakeDetected,
            WAKE_WORDS => Self::WakeWords {
                words: frame
                    .payload
                    .split(|b| *b == 0)
                    .filter(|w| !w.is_empty())
                    .map(|w| String::from_utf8_lossy(w).into_owned())
                    .collect(),
            },
            DIRECTION_OF_ARRIVAL => Self::DirectionOfArrival { angle: p.i16_at(0)? },
            BEAM_DIRECTIONS => {
                p.require(2)?;
                Self::BeamDirections {
                    angles: frame
                        .payload
                        .chunks_exact(2)
                        .map(|c| i16::from_le_bytes([c[0], c[1]]))
                        .collect(),
                }
            }
            BEAMFORMING_STATUS => Self::BeamformingStatus {
                angle: p.i16_at(0)?,
                enabled: p.i16_at(2)? != 0,
            },
            code => Self::Unknown {
                code,
                payload: frame.payload.clone(),
            },
        })
    }

    pub fn code(&self) -> u8 {
        use device_code::*;
        match self {
            Self::WakeDetected => WAKE_DETECTED,
            Self::WakeWords { .. } => WAKE_WORDS,
            Self::DirectionOfArrival { .. } => DIRECTION_OF_ARRIVAL,
            Self::BeamDirections { .. } => BEAM_DIRECTIONS,
            Self::BeamformingStatus { .. } => BEAMFORMING_STATUS,
            Self::Unknown { code, .. } => *code,
        }
    }

    /// Device-side encoding, used by simulators and loopback tests.
    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            Self::WakeDetected => Vec::new(),
            Self::WakeWords { words } => words
                .iter()
                .flat_map(|w| w.bytes().chain(std::iter::once(0)))
                .collect(),
            Self::DirectionOfArrival { angle } => angle.to_le_bytes().to_vec(),
            Self::BeamDirections { angles } => angles.iter().flat_map(|a| a.to_le_bytes()).collect(),
            Self::BeamformingStatus { angle, enabled } => {
                let mut out = angle.to_le_bytes().to_vec();
                out.extend_from_slice(&(*enabled as i16).to_le_bytes());
                out
            }
            Self::Unknown { payload, .. } => payload.clone(),
        };
        Frame::new(self.code(), payload)
    }
}

/// Bounds-checked little-endian reads over a payload.
struct PayloadReader<'a> {
    code: u8,
    bytes: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(code: u8, bytes: &'a [u8]) -> Self {
        Self { code, bytes }
    }

    fn require(&self, needed: usize) -> Result<(), FrameError> {
        if self.bytes.len() < needed {
            return Err(FrameError::ShortPayload {
                code: self.code,
                len: self.bytes.len(),
                needed,
            });
        }
        Ok(())
    }

    fn i16_at(&self, offset: usize) -> Result<i16, FrameError> {
        self.require(offset + 2)?;
        Ok(i16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indicator_on_sets_single_bit() {
        assert_eq!(HostCommand::IndicatorOn(3).payload().unwrap(), vec![0x08, 0x00]);
        assert_eq!(HostCommand::IndicatorOn(11).payload().unwrap(), vec![0x00, 0x08]);
        assert_eq!(HostCommand::IndicatorOff.payload().unwrap(), vec![0, 0]);
        assert!(HostCommand::IndicatorOn(16).payload().is_err());
    }

    #[test]
    fn set_direction_is_little_endian() {
        let frame = HostCommand::SetBeamDirection(-90).to_frame().unwrap();
        assert_eq!(frame.code, host_code::SET_BEAM_DIRECTION);
        assert_eq!(frame.payload, (-90i16).to_le_bytes().to_vec());
    }

    #[test]
    fn query_commands_have_empty_payload() {
        for cmd in [
            HostCommand::EnableBeamforming,
            HostCommand::DisableBeamforming,
            HostCommand::QueryBeamformingStatus,
            HostCommand::QueryDirectionOfArrival,
            HostCommand::QueryBeamDirectionList,
            HostCommand::QueryWakeWords,
        ] {
            assert!(cmd.payload().unwrap().is_empty(), "{cmd:?}");
        }
    }

    #[test]
    fn parses_wake_word_list() {
        let frame = Frame::new(device_code::WAKE_WORDS, b"hi there\0ok tico\0".to_vec());
        assert_eq!(
            DeviceEvent::from_frame(&frame).unwrap(),
            DeviceEvent::WakeWords {
                words: vec!["hi there".into(), "ok tico".into()]
            }
        );
    }

    #[test]
    fn parses_status_and_direction_list() {
        let status = DeviceEvent::BeamformingStatus { angle: 120, enabled: true };
        assert_eq!(DeviceEvent::from_frame(&status.to_frame()).unwrap(), status);

        let list = DeviceEvent::BeamDirections { angles: vec![0, 60, 120, 180, 240, 300] };
        assert_eq!(DeviceEvent::from_frame(&list.to_frame()).unwrap(), list);
    }

    #[test]
    fn short_direction_payload_is_rejected() {
        let frame = Frame::new(device_code::DIRECTION_OF_ARRIVAL, vec![0x10]);
        assert!(matches!(
            DeviceEvent::from_frame(&frame),
            Err(FrameError::ShortPayload { code: 0x83, len: 1, needed: 2 })
        ));
    }

    #[test]
    fn unknown_code_is_preserved() {
        let frame = Frame::new(0x7E, vec![1, 2, 3]);
        assert_eq!(
            DeviceEvent::from_frame(&frame).unwrap(),
            DeviceEvent::Unknown { code: 0x7E, payload: vec![1, 2, 3] }
        );
    }
}
