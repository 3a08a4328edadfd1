//! NPI validation
//!
//! National Provider Identifiers are 10-digit numbers whose check digit is
//! computed with the Luhn algorithm over the first nine digits, plus the CMS
//! constant 24 standing in for the implicit `80840` issuer prefix. A generic
//! Luhn implementation rejects valid NPIs, so the constant lives here.

/// Added to the Luhn sum to account for the `80840` prefix that is never
/// transmitted as part of the 10-digit identifier.
const CMS_PREFIX_CONSTANT: u32 = 24;

/// Check whether a string is a structurally valid 10-digit NPI.
pub fn is_valid_npi(npi: &str) -> bool {
    if npi.len() != 10 || !npi.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let digits: Vec<u32> = npi.bytes().map(|b| (b - b'0') as u32).collect();
    let check_digit = digits[9];

    // Luhn over the first nine digits: double every second digit starting
    // from the rightmost of the nine.
    let mut sum = CMS_PREFIX_CONSTANT;
    for (i, &d) in digits[..9].iter().rev().enumerate() {
        if i % 2 == 0 {
            let doubled = d * 2;
            sum += if doubled > 9 { doubled - 9 } else { doubled };
        } else {
            sum += d;
        }
    }

    (10 - (sum % 10)) % 10 == check_digit
}
