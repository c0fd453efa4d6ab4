//! Code assignment for the compressed recoder mode.
//!
//! The first `direct` character ids get a single label each. Every other id
//! `k` is written as `j = k - direct` in base `radix` with a fixed number of
//! digits. Each digit position owns its own block of `radix` labels, so a
//! label identifies both the digit and its position, and the first label of
//! a code tells how long the code is.
//!
//! ```text
//! labels: [0, direct)                      single-label characters
//!         [direct + p·radix, direct + (p+1)·radix)   digit at position p
//! ```

use super::{MAX_CODE_LEN, RecodedCharId};
use crate::{LinescribeError, Result};

/// Number of base-`radix` digits needed to number `count` values.
pub(crate) fn digits_needed(count: usize, radix: usize) -> usize {
    let mut digits = 1;
    let mut capacity = radix;
    while capacity < count {
        capacity = capacity.saturating_mul(radix);
        digits += 1;
    }
    digits
}

/// Codes for ids `0..size`.
pub(crate) fn assign_codes(size: usize, direct: usize, radix: usize) -> Result<Vec<RecodedCharId>> {
    if direct == 0 || direct > size {
        return Err(LinescribeError::validation(format!(
            "compressed recoder needs 1 <= direct ({direct}) <= character count ({size})"
        )));
    }
    if radix < 2 {
        return Err(LinescribeError::validation(format!(
            "compressed recoder radix must be at least 2, got {radix}"
        )));
    }
    let rest = size - direct;
    let digits = if rest == 0 { 0 } else { digits_needed(rest, radix) };
    if digits > MAX_CODE_LEN {
        return Err(LinescribeError::validation(format!(
            "{size} characters need {digits} labels per code with radix {radix}; at most {MAX_CODE_LEN} are allowed"
        )));
    }

    let mut codes = Vec::with_capacity(size);
    for id in 0..direct {
        codes.push(RecodedCharId::from_labels(&[id as u32]));
    }
    for j in 0..rest {
        let mut code = RecodedCharId::new();
        for p in 0..digits {
            let shift = radix.pow((digits - 1 - p) as u32);
            let digit = (j / shift) % radix;
            code.push((direct + p * radix + digit) as u32);
        }
        codes.push(code);
    }
    Ok(codes)
}

/// Label count used by a compressed table.
///
/// Leading digit blocks are charged in full; the last block only spans the
/// digits that actually occur, which is all of them unless a single digit
/// suffices.
pub(crate) fn code_range(size: usize, direct: usize, radix: usize) -> usize {
    let rest = size.saturating_sub(direct);
    if rest == 0 {
        return direct;
    }
    let digits = digits_needed(rest, radix);
    direct + (digits - 1) * radix + rest.min(radix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digits_needed() {
        assert_eq!(digits_needed(1, 10), 1);
        assert_eq!(digits_needed(10, 10), 1);
        assert_eq!(digits_needed(11, 10), 2);
        assert_eq!(digits_needed(1000, 10), 3);
    }

    #[test]
    fn test_codes_use_position_blocks() {
        let codes = assign_codes(10, 4, 3).unwrap();
        assert_eq!(codes[3].as_slice(), &[3]);
        // 6 remaining ids need two base-3 digits: labels 4..7 then 7..10.
        assert_eq!(codes[4].as_slice(), &[4, 7]);
        assert_eq!(codes[9].as_slice(), &[5, 9]);
        assert_eq!(code_range(10, 4, 3), 10);
    }

    #[test]
    fn test_single_digit_range_counts_used_labels() {
        let codes = assign_codes(5, 4, 3).unwrap();
        assert_eq!(codes[4].as_slice(), &[4]);
        assert_eq!(code_range(5, 4, 3), 5);
        assert_eq!(code_range(7, 4, 3), 7);
        assert_eq!(code_range(4, 4, 3), 4);
    }

    #[test]
    fn test_rejects_too_long_codes() {
        assert!(assign_codes(5000, 1, 2).is_err());
        assert!(assign_codes(10, 0, 4).is_err());
        assert!(assign_codes(10, 2, 1).is_err());
    }
}
