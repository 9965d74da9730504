//! GF(256) with irreducible polynomial x^8 + x^4 + x^3 + x + 1 (0x11B).
//!
//! Log/exp lookup tables make multiplication and division two table reads
//! and an add. The generator element is 3 (0x03), which generates the full
//! multiplicative group of order 255.
//!
//! Addition and subtraction are both XOR (characteristic 2).

/// Irreducible polynomial: x^8 + x^4 + x^3 + x + 1.
const MODULUS: u16 = 0x11B;

/// EXP[i] = g^i for g = 3. Doubled to 510 entries (padded to 512) so a sum
/// of two logs never needs reducing mod 255.
const fn build_exp_table() -> [u8; 512] {
    let mut table = [0u8; 512];
    let mut val: u16 = 1;
    let mut i = 0;
    while i < 255 {
        table[i] = val as u8;
        table[i + 255] = val as u8;
        // val * 3 = val * 2 + val
        val = (val << 1) ^ val;
        if val >= 256 {
            val ^= MODULUS;
        }
        i += 1;
    }
    table
}

/// LOG[EXP[i]] = i. LOG[0] is unused.
const fn build_log_table() -> [u8; 256] {
    let exp = build_exp_table();
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 255 {
        table[exp[i] as usize] = i as u8;
        i += 1;
    }
    table
}

static EXP: [u8; 512] = build_exp_table();
static LOG: [u8; 256] = build_log_table();

#[inline]
pub fn add(a: u8, b: u8) -> u8 {
    a ^ b
}

#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
}

/// Multiplicative inverse. Panics on zero, which has none.
#[inline]
pub fn inv(a: u8) -> u8 {
    assert!(a != 0, "zero has no inverse in GF(256)");
    EXP[255 - LOG[a as usize] as usize]
}

/// a / b. Panics if `b` is zero.
#[inline]
pub fn div(a: u8, b: u8) -> u8 {
    mul(a, inv(b))
}

/// Evaluate a polynomial at `x` with Horner's method.
///
/// `coefficients[0]` is the constant term.
pub fn eval_polynomial(coefficients: &[u8], x: u8) -> u8 {
    coefficients
        .iter()
        .rev()
        .fold(0u8, |acc, &coeff| add(mul(acc, x), coeff))
}

/// Lagrange interpolation evaluated at x = 0.
///
/// `xs` must be distinct and non-zero; the caller validates that before any
/// share data reaches this function, so a violation here is a bug and panics.
pub fn interpolate_at_zero(xs: &[u8], ys: &[u8]) -> u8 {
    assert_eq!(xs.len(), ys.len(), "point count mismatch");
    let mut result = 0u8;

    for (i, (&xi, &yi)) in xs.iter().zip(ys).enumerate() {
        let mut numerator = 1u8;
        let mut denominator = 1u8;

        for (j, &xj) in xs.iter().enumerate() {
            if i == j {
                continue;
            }
            // (0 - x_j) = x_j
            numerator = mul(numerator, xj);
            denominator = mul(denominator, add(xi, xj));
        }

        result = add(result, mul(yi, div(numerator, denominator)));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_xor() {
        assert_eq!(add(0xFF, 0xFF), 0);
        assert_eq!(add(0xAB, 0x00), 0xAB);
    }

    #[test]
    fn mul_identity_and_zero() {
        for i in 0..=255u8 {
            assert_eq!(mul(i, 1), i);
            assert_eq!(mul(i, 0), 0);
        }
    }

    #[test]
    fn mul_matches_aes_reference() {
        // FIPS-197 section 4.2 worked example: {57} * {83} = {c1}.
        assert_eq!(mul(0x57, 0x83), 0xC1);
        assert_eq!(mul(0x57, 0x13), 0xFE);
    }

    #[test]
    fn every_nonzero_element_has_inverse() {
        for a in 1..=255u8 {
            assert_eq!(mul(a, inv(a)), 1, "inverse of {a:#04x}");
        }
    }

    #[test]
    fn mul_div_inverse() {
        for a in 1..=255u8 {
            for b in 1..=255u8 {
                assert_eq!(div(mul(a, b), b), a);
            }
        }
    }

    #[test]
    #[should_panic(expected = "zero has no inverse")]
    fn inverse_of_zero_panics() {
        inv(0);
    }

    #[test]
    fn polynomial_eval_constant() {
        assert_eq!(eval_polynomial(&[42], 1), 42);
        assert_eq!(eval_polynomial(&[42], 200), 42);
        // At x = 0 only the constant term survives.
        assert_eq!(eval_polynomial(&[7, 99, 13], 0), 7);
    }

    #[test]
    fn interpolation_recovers_constant_term() {
        let coefficients = [0x5A, 0x11, 0xC3];
        let xs = [2u8, 5, 9];
        let ys: Vec<u8> = xs.iter().map(|&x| eval_polynomial(&coefficients, x)).collect();
        assert_eq!(interpolate_at_zero(&xs, &ys), 0x5A);
    }
}
