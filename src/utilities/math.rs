/// Greatest common divisor by Euclid's algorithm. Signs follow the inputs,
/// as the column analysis feeds raw cell values in.
pub fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(12, 8, 4)]
    #[case(8, 12, 4)]
    #[case(7, 13, 1)]
    #[case(0, 5, 5)]
    #[case(5, 0, 5)]
    #[case(0, 0, 0)]
    #[case(100, 100, 100)]
    fn gcd_cases(#[case] a: i64, #[case] b: i64, #[case] expected: i64) {
        assert_eq!(gcd(a, b), expected);
    }
}
