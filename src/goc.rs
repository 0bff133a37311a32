//! GOC/EIN injection-message framing, mask-string codec, power-rail
//! voltage formula, and GOC clock-divisor conversion. These are the
//! protocol-constant pieces of `ice.py`/`m3_common.py` that don't belong
//! to any one component (`SerialLink`, `MBusTransport`, ...) but are
//! needed by the CLI's `goc`/`ein`/`power` subcommands.

use crate::error::{IceError, IceResult};

/// Selects one of the four injection-message formats. The version
/// picked at configuration time used to be a monkey-patched instance
/// method in the source; here it is a plain enum dispatched at send
/// time (spec.md §9 "Monkey-patched instance methods → strategy
/// object").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GocVersion {
    V1,
    V2,
    V3,
    V4,
}

impl GocVersion {
    fn default_chip_id_mask(self) -> u8 {
        match self {
            GocVersion::V1 => 0,
            GocVersion::V2 | GocVersion::V3 | GocVersion::V4 => 0xf,
        }
    }

    fn address_in_data_section(self) -> bool {
        !matches!(self, GocVersion::V1)
    }

    /// `true` for v1/v2 (XOR parity), `false` for v3/v4 (truncated sum).
    fn xor_parity(self) -> bool {
        matches!(self, GocVersion::V1 | GocVersion::V2)
    }
}

fn parity(bytes: &[u8], xor: bool) -> u8 {
    if xor {
        bytes.iter().fold(0u8, |acc, &b| acc ^ b)
    } else {
        bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
    }
}

/// `Byte 0: Control` bitfield, `chip_id_mask[0:4] | reset<<4 |
/// chip_id_coding<<5 | is_mbus<<6 | run_after<<7`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InjectionControl {
    pub chip_id_mask: Option<u8>,
    pub reset_request: bool,
    pub chip_id_coding: bool,
    pub is_mbus: bool,
    pub run_after: bool,
}

/// Builds one GOC/EIN injection message: header (control, chip id,
/// v1-only 16-bit address, length, parity) followed by an optional data
/// section (address prefix for v2+, payload, parity).
pub fn build_injection_message(
    version: GocVersion,
    control: InjectionControl,
    chip_id: u16,
    memory_address: u32,
    data: Option<&[u8]>,
) -> IceResult<Vec<u8>> {
    let chip_id_mask = control.chip_id_mask.unwrap_or(version.default_chip_id_mask());
    let control_byte = chip_id_mask
        | (control.reset_request as u8) << 4
        | (control.chip_id_coding as u8) << 5
        | (control.is_mbus as u8) << 6
        | (control.run_after as u8) << 7;

    let mut header = vec![control_byte];
    header.extend_from_slice(&chip_id.to_be_bytes());
    if version == GocVersion::V1 {
        let addr16 = u16::try_from(memory_address).map_err(|_| {
            IceError::ParameterError(format!(
                "GOC v1 memory address {memory_address:#x} does not fit in 16 bits"
            ))
        })?;
        header.extend_from_slice(&addr16.to_be_bytes());
    }

    let length: u16 = match data {
        Some(d) if version.address_in_data_section() => {
            u16::try_from(d.len())
                .ok()
                .and_then(|n| n.checked_sub(1))
                .ok_or_else(|| IceError::ParameterError("empty data for v2+ injection".into()))?
        }
        Some(d) => u16::try_from(d.len())
            .map_err(|_| IceError::ParameterError("data too long for 16-bit length".into()))?,
        None => 0,
    };
    header.extend_from_slice(&length.to_be_bytes());
    header.push(parity(&header, version.xor_parity()));

    let mut message = header;
    if let Some(d) = data {
        let mut body = Vec::new();
        if version.address_in_data_section() {
            body.extend_from_slice(&memory_address.to_be_bytes());
        }
        body.extend_from_slice(d);
        let p = parity(&body, version.xor_parity());

        if version == GocVersion::V1 {
            message.push(p);
            message.extend_from_slice(&body);
        } else {
            message.extend_from_slice(&body);
            message.push(p);
        }
    }
    Ok(message)
}

/// Parses a mask string over `{'0','1','x','X',' '}` (spaces ignored)
/// into a `(ones, zeros)` pair: bit `i` (from the LSB) is required 1 iff
/// set in `ones`, required 0 iff set in `zeros`, don't-care otherwise.
pub fn string_to_masks(mask: &str) -> IceResult<(u32, u32)> {
    let chars: Vec<char> = mask.chars().filter(|&c| c != ' ').collect();
    let mut ones = 0u32;
    let mut zeros = 0u32;
    let len = chars.len();
    for (pos, &c) in chars.iter().enumerate() {
        let idx = len - 1 - pos;
        match c {
            '1' => ones |= 1 << idx,
            '0' => zeros |= 1 << idx,
            'x' | 'X' => {}
            other => {
                return Err(IceError::FormatError(format!(
                    "illegal mask character: {other:?}"
                )))
            }
        }
    }
    Ok((ones, zeros))
}

/// Inverse of `string_to_masks`: renders `length` bits, MSB first,
/// using `'x'` for don't-care. Fails if a bit is required both 1 and 0.
pub fn masks_to_string(ones: u32, zeros: u32, length: u32) -> IceResult<String> {
    let mut s = String::new();
    for l in (0..length).rev() {
        let o = ones & (1 << l) != 0;
        let z = zeros & (1 << l) != 0;
        if o && z {
            return Err(IceError::FormatError(format!(
                "mask bit {l} required both 1 and 0 (ones={ones:#x} zeros={zeros:#x})"
            )));
        }
        s.push(if o {
            '1'
        } else if z {
            '0'
        } else {
            'x'
        });
    }
    Ok(s)
}

/// Default output voltage per rail at `vset == 0`'s reference point,
/// used by `rail_voltage`.
pub const VDEFAULT_0P6: f64 = 0.675;
pub const VDEFAULT_1P2: f64 = 1.2;
pub const VDEFAULT_VBATT: f64 = 3.8;

/// `vout = (0.537 + 0.0185 * vset) * vdefault`, `vset` in `[0, 255]`.
pub fn rail_voltage(vset: u8, vdefault: f64) -> f64 {
    (0.537 + 0.0185 * vset as f64) * vdefault
}

/// `freq_hz = NOMINAL / divisor`, `NOMINAL` is 2 MHz for protocol minor
/// 1, else 4 MHz.
pub fn clock_freq_hz(minor: u8, divisor: f64) -> f64 {
    nominal_hz(minor) / divisor
}

pub fn clock_divisor(minor: u8, freq_hz: f64) -> f64 {
    nominal_hz(minor) / freq_hz
}

fn nominal_hz(minor: u8) -> f64 {
    if minor == 1 {
        2e6
    } else {
        4e6
    }
}

/// Packs a clock divisor for the wire: 3 bytes big-endian for minor <=
/// 2, 4 bytes for minor >= 3.
pub fn pack_clock_divisor(minor: u8, divisor: u32) -> Vec<u8> {
    let bytes = divisor.to_be_bytes();
    if minor <= 2 {
        bytes[1..].to_vec()
    } else {
        bytes.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_injection_message_prefixes_data_with_parity() {
        let msg = build_injection_message(
            GocVersion::V1,
            InjectionControl::default(),
            0x1234,
            0x1A00,
            Some(&[0xde, 0xad]),
        )
        .unwrap();
        // header: control(1) + chip_id(2) + addr16(2) + length(2) + parity(1) = 8
        assert_eq!(msg.len(), 8 + 1 + 2);
        assert_eq!(&msg[1..3], &[0x12, 0x34]);
        assert_eq!(&msg[3..5], &[0x1a, 0x00]);
        assert_eq!(&msg[5..7], &[0x00, 0x02]); // length = 2 bytes, no -1 for v1
    }

    #[test]
    fn v3_injection_message_suffixes_data_with_truncated_sum_parity_and_subtracts_one() {
        let msg = build_injection_message(
            GocVersion::V3,
            InjectionControl::default(),
            0,
            0x2000_0000,
            Some(&[1, 2, 3]),
        )
        .unwrap();
        // header: control+chip_id+length+parity = 6 bytes (no addr16 for v3)
        assert_eq!(&msg[3..5], &[0x00, 0x02]); // length = 3 - 1
        let data_section = &msg[6..];
        assert_eq!(&data_section[0..4], &0x2000_0000u32.to_be_bytes());
        assert_eq!(&data_section[4..7], &[1, 2, 3]);
        let expected_parity = 0x20u8
            .wrapping_add(0x00)
            .wrapping_add(0x00)
            .wrapping_add(0x00)
            .wrapping_add(1)
            .wrapping_add(2)
            .wrapping_add(3);
        assert_eq!(data_section[7], expected_parity);
    }

    #[test]
    fn mask_round_trips_through_string_and_back() {
        let (ones, zeros) = string_to_masks("10x1").unwrap();
        let s = masks_to_string(ones, zeros, 4).unwrap();
        assert_eq!(s, "10x1");
    }

    #[test]
    fn mask_rejects_illegal_characters() {
        assert!(string_to_masks("102").is_err());
    }

    #[test]
    fn rail_voltage_matches_documented_formula() {
        let v = rail_voltage(0, VDEFAULT_1P2);
        assert!((v - 0.537 * 1.2).abs() < 1e-9);
    }

    #[test]
    fn clock_divisor_and_freq_are_inverses() {
        let divisor = clock_divisor(3, 1_000_000.0);
        let freq = clock_freq_hz(3, divisor);
        assert!((freq - 1_000_000.0).abs() < 1.0);
    }

    #[test]
    fn clock_divisor_packs_three_bytes_below_minor_three() {
        let packed = pack_clock_divisor(2, 0x00_01_02_03);
        assert_eq!(packed, vec![0x01, 0x02, 0x03]);
        let packed4 = pack_clock_divisor(3, 0x00_01_02_03);
        assert_eq!(packed4, vec![0x00, 0x01, 0x02, 0x03]);
    }
}
