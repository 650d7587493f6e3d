//! Decimal arithmetic utilities for order sizing.

use rust_decimal::Decimal;

/// Round to tick size (e.g., 0.01 for most prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    ((value / tick_size).round() * tick_size).normalize()
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    ((value / lot_size).floor() * lot_size).normalize()
}

/// Round up to lot size.
pub fn round_up_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    ((value / lot_size).ceil() * lot_size).normalize()
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Calculate weighted average.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Decimal {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    safe_div(sum, weight_sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(50123.456), dec!(0.01)), dec!(50123.46));
        assert_eq!(round_to_tick(dec!(50123.456), dec!(0.10)), dec!(50123.5));
        assert_eq!(round_to_tick(dec!(50123.456), dec!(1.00)), dec!(50123));
    }

    #[test]
    fn test_round_down_to_lot() {
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.001)), dec!(1.567));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.1)), dec!(1.5));
    }

    #[test]
    fn test_round_up_to_lot() {
        assert_eq!(round_up_to_lot(dec!(1.561), dec!(0.01)), dec!(1.57));
        assert_eq!(round_up_to_lot(dec!(1.56), dec!(0.01)), dec!(1.56));
        assert_eq!(round_up_to_lot(dec!(0.2), dec!(1)), dec!(1));
    }

    #[test]
    fn test_weighted_average() {
        let values = vec![(dec!(100), dec!(2)), (dec!(200), dec!(1))];
        let avg = weighted_average(&values);
        assert!(avg > dec!(133) && avg < dec!(134));
        assert_eq!(weighted_average(&[]), Decimal::ZERO);
    }
}
