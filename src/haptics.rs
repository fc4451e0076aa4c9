//! Haptic command encoding: stateless pure translators from structured
//! vibration requests to the actuator command payload carried by the
//! `triggerVibration` message type.
//!
//! Two command shapes exist, wrapped identically:
//!
//! | Shape | Segments | Per-segment encoding |
//! |---|---|---|
//! | Effect sequence | 1–8 | 1 byte: ROM effect index, or `0x80 \| delay/10` |
//! | Raw waveform | 1–20 | 2 bytes: amplitude × 127, duration / 10 |
//!
//! Wrapper: `[locationBitmask: u8][kind: u8][length: u16 LE][payload]`.
//! Every bound is validated before any byte is produced, so a rejected
//! request never partially encodes.

use crate::error::HapticError;

// ── Limits ───────────────────────────────────────────────────────────────────

/// Maximum segments in one effect sequence (actuator sequencer depth).
pub const MAX_EFFECT_SEGMENTS: usize = 8;
/// Maximum segments in one raw waveform.
pub const MAX_WAVEFORM_SEGMENTS: usize = 20;
/// Maximum per-segment loop count in an effect sequence.
pub const MAX_SEGMENT_LOOP_COUNT: u8 = 3;
/// Maximum whole-sequence loop count.
pub const MAX_SEQUENCE_LOOP_COUNT: u8 = 6;
/// Maximum inter-effect delay. Delays encode in 10 ms steps with the high
/// bit set, so 1270 ms is the largest representable value.
pub const MAX_DELAY_MS: u16 = 1270;
/// Maximum raw-waveform segment duration (10 ms steps, one byte).
pub const MAX_WAVEFORM_DURATION_MS: u16 = 2550;

// ── Locations ─────────────────────────────────────────────────────────────────

/// Physical actuator locations, one bit each in the command's location mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VibrationLocation {
    /// Forefoot actuator.
    Front,
    /// Heel actuator.
    Rear,
}

impl VibrationLocation {
    pub fn bit(self) -> u8 {
        match self {
            VibrationLocation::Front => 1 << 0,
            VibrationLocation::Rear => 1 << 1,
        }
    }
}

// ── Effect name table ─────────────────────────────────────────────────────────

/// The actuator's ROM effect library, in index order (0–123).
///
/// A segment's on-wire byte is its index in this table, so the table is
/// append-only for the same reason the message registry is.
pub const VIBRATION_EFFECT_NAMES: [&str; 124] = [
    "none",
    "strongClick100",
    "strongClick60",
    "strongClick30",
    "sharpClick100",
    "sharpClick60",
    "sharpClick30",
    "softBump100",
    "softBump60",
    "softBump30",
    "doubleClick100",
    "doubleClick60",
    "tripleClick100",
    "softFuzz60",
    "strongBuzz100",
    "alert750ms",
    "alert1000ms",
    "strongClick1_100",
    "strongClick2_80",
    "strongClick3_60",
    "strongClick4_30",
    "mediumClick100",
    "mediumClick80",
    "mediumClick60",
    "sharpTick100",
    "sharpTick80",
    "sharpTick60",
    "shortDoubleClickStrong100",
    "shortDoubleClickStrong80",
    "shortDoubleClickStrong60",
    "shortDoubleClickStrong30",
    "shortDoubleClickMedium100",
    "shortDoubleClickMedium80",
    "shortDoubleClickMedium60",
    "shortDoubleSharpTick100",
    "shortDoubleSharpTick80",
    "shortDoubleSharpTick60",
    "longDoubleSharpClickStrong100",
    "longDoubleSharpClickStrong80",
    "longDoubleSharpClickStrong60",
    "longDoubleSharpClickStrong30",
    "longDoubleSharpClickMedium100",
    "longDoubleSharpClickMedium80",
    "longDoubleSharpClickMedium60",
    "longDoubleSharpTick100",
    "longDoubleSharpTick80",
    "longDoubleSharpTick60",
    "buzz100",
    "buzz80",
    "buzz60",
    "buzz40",
    "buzz20",
    "pulsingStrong100",
    "pulsingStrong60",
    "pulsingMedium100",
    "pulsingMedium60",
    "pulsingSharp100",
    "pulsingSharp60",
    "transitionClick100",
    "transitionClick80",
    "transitionClick60",
    "transitionClick40",
    "transitionClick20",
    "transitionClick10",
    "transitionHum100",
    "transitionHum80",
    "transitionHum60",
    "transitionHum40",
    "transitionHum20",
    "transitionHum10",
    "transitionRampDownLongSmooth1_100",
    "transitionRampDownLongSmooth2_100",
    "transitionRampDownMediumSmooth1_100",
    "transitionRampDownMediumSmooth2_100",
    "transitionRampDownShortSmooth1_100",
    "transitionRampDownShortSmooth2_100",
    "transitionRampDownLongSharp1_100",
    "transitionRampDownLongSharp2_100",
    "transitionRampDownMediumSharp1_100",
    "transitionRampDownMediumSharp2_100",
    "transitionRampDownShortSharp1_100",
    "transitionRampDownShortSharp2_100",
    "transitionRampUpLongSmooth1_100",
    "transitionRampUpLongSmooth2_100",
    "transitionRampUpMediumSmooth1_100",
    "transitionRampUpMediumSmooth2_100",
    "transitionRampUpShortSmooth1_100",
    "transitionRampUpShortSmooth2_100",
    "transitionRampUpLongSharp1_100",
    "transitionRampUpLongSharp2_100",
    "transitionRampUpMediumSharp1_100",
    "transitionRampUpMediumSharp2_100",
    "transitionRampUpShortSharp1_100",
    "transitionRampUpShortSharp2_100",
    "transitionRampDownLongSmooth1_50",
    "transitionRampDownLongSmooth2_50",
    "transitionRampDownMediumSmooth1_50",
    "transitionRampDownMediumSmooth2_50",
    "transitionRampDownShortSmooth1_50",
    "transitionRampDownShortSmooth2_50",
    "transitionRampDownLongSharp1_50",
    "transitionRampDownLongSharp2_50",
    "transitionRampDownMediumSharp1_50",
    "transitionRampDownMediumSharp2_50",
    "transitionRampDownShortSharp1_50",
    "transitionRampDownShortSharp2_50",
    "transitionRampUpLongSmooth1_50",
    "transitionRampUpLongSmooth2_50",
    "transitionRampUpMediumSmooth1_50",
    "transitionRampUpMediumSmooth2_50",
    "transitionRampUpShortSmooth1_50",
    "transitionRampUpShortSmooth2_50",
    "transitionRampUpLongSharp1_50",
    "transitionRampUpLongSharp2_50",
    "transitionRampUpMediumSharp1_50",
    "transitionRampUpMediumSharp2_50",
    "transitionRampUpShortSharp1_50",
    "transitionRampUpShortSharp2_50",
    "longBuzz100",
    "smoothHum50",
    "smoothHum40",
    "smoothHum30",
    "smoothHum20",
    "smoothHum10",
];

// ── Request types ─────────────────────────────────────────────────────────────

/// One step of an effect sequence: either a ROM effect or a pause.
#[derive(Debug, Clone, PartialEq)]
pub enum VibrationSegment {
    /// Play a named ROM effect, repeated `loop_count` extra times (0–3).
    Effect { name: String, loop_count: u8 },
    /// Pause for `ms` milliseconds (0–1270, 10 ms resolution),
    /// repeated `loop_count` extra times (0–3).
    Delay { ms: u16, loop_count: u8 },
}

impl VibrationSegment {
    pub fn effect(name: impl Into<String>) -> Self {
        VibrationSegment::Effect {
            name: name.into(),
            loop_count: 0,
        }
    }

    pub fn delay(ms: u16) -> Self {
        VibrationSegment::Delay { ms, loop_count: 0 }
    }
}

/// One step of a raw waveform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformSegment {
    /// Drive strength, `0.0..=1.0`.
    pub amplitude: f64,
    /// Duration in milliseconds, `1..=2550` (10 ms resolution).
    pub duration_ms: u16,
}

/// A structured vibration request, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum VibrationRequest {
    /// An ordered sequence of ROM effects and delays, optionally looped as
    /// a whole (`sequence_loop_count`, 0–6).
    EffectSequence {
        segments: Vec<VibrationSegment>,
        sequence_loop_count: u8,
    },
    /// An arbitrary amplitude envelope.
    Waveform { segments: Vec<WaveformSegment> },
}

/// A complete command: where to vibrate and what to play.
#[derive(Debug, Clone, PartialEq)]
pub struct VibrationCommand {
    pub locations: Vec<VibrationLocation>,
    pub request: VibrationRequest,
}

// ── Encoders ──────────────────────────────────────────────────────────────────

const KIND_EFFECT_SEQUENCE: u8 = 0;
const KIND_WAVEFORM: u8 = 1;

fn effect_index(name: &str) -> Result<u8, HapticError> {
    VIBRATION_EFFECT_NAMES
        .iter()
        .position(|&n| n == name)
        .map(|i| i as u8)
        .ok_or_else(|| HapticError::InvalidEffectName(name.to_owned()))
}

fn check_loop_count(count: u8, max: u8) -> Result<(), HapticError> {
    if count > max {
        return Err(HapticError::LoopCountOutOfRange { got: count, max });
    }
    Ok(())
}

/// Encode the inner payload of an effect sequence (without the wrapper).
///
/// One byte per segment, followed — only when any looping was requested —
/// by one loop-count byte per segment and a trailing sequence-loop byte.
///
/// ```
/// # use solekit::haptics::{encode_effect_sequence, VibrationSegment};
/// let bytes = encode_effect_sequence(
///     &[
///         VibrationSegment::effect("strongClick100"),
///         VibrationSegment::delay(500),
///         VibrationSegment::effect("doubleClick60"),
///     ],
///     0,
/// )
/// .unwrap();
/// assert_eq!(bytes, [1, 0x80 | 50, 11]);
/// ```
pub fn encode_effect_sequence(
    segments: &[VibrationSegment],
    sequence_loop_count: u8,
) -> Result<Vec<u8>, HapticError> {
    if segments.is_empty() || segments.len() > MAX_EFFECT_SEGMENTS {
        return Err(HapticError::TooManySegments {
            got: segments.len(),
            max: MAX_EFFECT_SEGMENTS,
        });
    }
    check_loop_count(sequence_loop_count, MAX_SEQUENCE_LOOP_COUNT)?;

    // Validate everything before emitting anything.
    let mut bytes = Vec::with_capacity(segments.len() * 2 + 1);
    let mut loops = Vec::with_capacity(segments.len());
    for segment in segments {
        match segment {
            VibrationSegment::Effect { name, loop_count } => {
                check_loop_count(*loop_count, MAX_SEGMENT_LOOP_COUNT)?;
                bytes.push(effect_index(name)?);
                loops.push(*loop_count);
            }
            VibrationSegment::Delay { ms, loop_count } => {
                check_loop_count(*loop_count, MAX_SEGMENT_LOOP_COUNT)?;
                if *ms > MAX_DELAY_MS {
                    return Err(HapticError::DelayOutOfRange(*ms));
                }
                // High bit disambiguates a delay from an effect index.
                bytes.push(0x80 | (ms / 10) as u8);
                loops.push(*loop_count);
            }
        }
    }

    let any_looping = sequence_loop_count > 0 || loops.iter().any(|&c| c > 0);
    if any_looping {
        bytes.extend_from_slice(&loops);
        bytes.push(sequence_loop_count);
    }
    Ok(bytes)
}

/// Encode the inner payload of a raw waveform (without the wrapper).
/// Exactly two bytes per segment.
pub fn encode_waveform(segments: &[WaveformSegment]) -> Result<Vec<u8>, HapticError> {
    if segments.is_empty() || segments.len() > MAX_WAVEFORM_SEGMENTS {
        return Err(HapticError::TooManySegments {
            got: segments.len(),
            max: MAX_WAVEFORM_SEGMENTS,
        });
    }
    for s in segments {
        if !(0.0..=1.0).contains(&s.amplitude) {
            return Err(HapticError::AmplitudeOutOfRange(s.amplitude));
        }
        if s.duration_ms == 0 || s.duration_ms > MAX_WAVEFORM_DURATION_MS {
            return Err(HapticError::DurationOutOfRange(s.duration_ms));
        }
    }

    let mut bytes = Vec::with_capacity(segments.len() * 2);
    for s in segments {
        bytes.push((s.amplitude * 127.0).round() as u8);
        bytes.push((s.duration_ms / 10) as u8);
    }
    Ok(bytes)
}

/// Encode a full command: location bitmask, kind discriminator, payload
/// length, payload. The result is one `triggerVibration` message payload
/// (or part of one — commands concatenate).
pub fn encode_vibration_command(command: &VibrationCommand) -> Result<Vec<u8>, HapticError> {
    let mut mask = 0u8;
    for location in &command.locations {
        mask |= location.bit();
    }
    if mask == 0 {
        return Err(HapticError::EmptyLocationSet);
    }

    let (kind, payload) = match &command.request {
        VibrationRequest::EffectSequence {
            segments,
            sequence_loop_count,
        } => (
            KIND_EFFECT_SEQUENCE,
            encode_effect_sequence(segments, *sequence_loop_count)?,
        ),
        VibrationRequest::Waveform { segments } => (KIND_WAVEFORM, encode_waveform(segments)?),
    };

    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(mask);
    out.push(kind);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Encode several commands into one concatenated `triggerVibration` payload.
pub fn encode_vibration_commands(commands: &[VibrationCommand]) -> Result<Vec<u8>, HapticError> {
    let mut out = Vec::new();
    for command in commands {
        out.extend(encode_vibration_command(command)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effect_table_has_124_unique_entries() {
        let mut names: Vec<&str> = VIBRATION_EFFECT_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 124);
    }

    #[test]
    fn plain_three_segment_sequence_is_three_bytes() {
        let bytes = encode_effect_sequence(
            &[
                VibrationSegment::effect("strongClick100"),
                VibrationSegment::effect("sharpTick60"),
                VibrationSegment::delay(100),
            ],
            0,
        )
        .unwrap();
        assert_eq!(bytes.len(), 3);
        assert_eq!(bytes[2], 0x80 | 10);
    }

    #[test]
    fn looping_appends_counts_and_sequence_byte() {
        let bytes = encode_effect_sequence(
            &[
                VibrationSegment::Effect {
                    name: "buzz100".into(),
                    loop_count: 2,
                },
                VibrationSegment::delay(50),
            ],
            3,
        )
        .unwrap();
        // 2 segment bytes + 2 loop bytes + 1 sequence byte
        assert_eq!(bytes.len(), 5);
        assert_eq!(&bytes[2..], &[2, 0, 3]);
    }

    #[test]
    fn nine_segments_is_too_many() {
        let segments = vec![VibrationSegment::effect("none"); 9];
        assert_eq!(
            encode_effect_sequence(&segments, 0),
            Err(HapticError::TooManySegments { got: 9, max: 8 })
        );
    }

    #[test]
    fn delay_1271_is_out_of_range() {
        assert_eq!(
            encode_effect_sequence(&[VibrationSegment::delay(1271)], 0),
            Err(HapticError::DelayOutOfRange(1271))
        );
        // 1270 is the last legal value.
        assert!(encode_effect_sequence(&[VibrationSegment::delay(1270)], 0).is_ok());
    }

    #[test]
    fn unknown_effect_name_is_rejected_before_encoding() {
        let err = encode_effect_sequence(
            &[
                VibrationSegment::effect("strongClick100"),
                VibrationSegment::effect("megaBlast9000"),
            ],
            0,
        )
        .unwrap_err();
        assert_eq!(err, HapticError::InvalidEffectName("megaBlast9000".into()));
    }

    #[test]
    fn waveform_segment_is_two_bytes() {
        let bytes = encode_waveform(&[
            WaveformSegment {
                amplitude: 1.0,
                duration_ms: 2550,
            },
            WaveformSegment {
                amplitude: 0.5,
                duration_ms: 10,
            },
        ])
        .unwrap();
        assert_eq!(bytes, [127, 255, 64, 1]);
    }

    #[test]
    fn waveform_bounds_are_enforced() {
        let bad_amp = [WaveformSegment {
            amplitude: 1.2,
            duration_ms: 100,
        }];
        assert!(matches!(
            encode_waveform(&bad_amp),
            Err(HapticError::AmplitudeOutOfRange(_))
        ));
        let bad_dur = [WaveformSegment {
            amplitude: 0.5,
            duration_ms: 0,
        }];
        assert_eq!(
            encode_waveform(&bad_dur),
            Err(HapticError::DurationOutOfRange(0))
        );
        let too_many = vec![
            WaveformSegment {
                amplitude: 0.5,
                duration_ms: 100,
            };
            21
        ];
        assert!(matches!(
            encode_waveform(&too_many),
            Err(HapticError::TooManySegments { got: 21, max: 20 })
        ));
    }

    #[test]
    fn wrapper_carries_mask_kind_and_length() {
        let command = VibrationCommand {
            locations: vec![VibrationLocation::Front, VibrationLocation::Rear],
            request: VibrationRequest::EffectSequence {
                segments: vec![VibrationSegment::effect("doubleClick100")],
                sequence_loop_count: 0,
            },
        };
        let bytes = encode_vibration_command(&command).unwrap();
        assert_eq!(bytes[0], 0b11);
        assert_eq!(bytes[1], 0); // effect-sequence kind
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 1);
        assert_eq!(bytes[4], 10); // doubleClick100 index
        assert_eq!(bytes.len(), 5);
    }

    #[test]
    fn empty_location_set_is_rejected() {
        let command = VibrationCommand {
            locations: vec![],
            request: VibrationRequest::Waveform {
                segments: vec![WaveformSegment {
                    amplitude: 0.5,
                    duration_ms: 100,
                }],
            },
        };
        assert_eq!(
            encode_vibration_command(&command),
            Err(HapticError::EmptyLocationSet)
        );
    }
}
