//! Parsing of Kubernetes resource quantities into byte counts.

use std::num::ParseFloatError;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ParseQuantityError {
    #[snafu(display("unknown unit {unit:?}"))]
    UnknownUnit { unit: String },
    #[snafu(display("failed to parse amount {amount:?}"))]
    UnparseableAmount {
        amount: String,
        source: ParseFloatError,
    },
}

/// Convert a memory quantity such as `512Mi`, `600M` or `2Gi` into bytes.
pub fn to_bytes(quantity: &Quantity) -> Result<f64, ParseQuantityError> {
    use parse_quantity_error::*;

    let start_of_unit = quantity.0.find(|chr: char| chr.is_alphabetic());
    let unit = start_of_unit.map_or("", |i| &quantity.0[i..]);
    let unit_factor: f64 = match unit {
        "" => 1.0,
        "k" => 1000.0,
        "M" => 1000.0 * 1000.0,
        "G" => 1000.0 * 1000.0 * 1000.0,
        "T" => 1000.0 * 1000.0 * 1000.0 * 1000.0,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        unit => return UnknownUnitSnafu { unit }.fail(),
    };
    let amount = start_of_unit.map_or(quantity.0.as_str(), |i| &quantity.0[..i]);
    let amount = amount
        .parse::<f64>()
        .context(UnparseableAmountSnafu { amount })?;
    Ok(amount * unit_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantity(value: &str) -> Quantity {
        Quantity(value.to_string())
    }

    #[test]
    fn decimal_and_binary_units() {
        assert_eq!(to_bytes(&quantity("500M")).unwrap(), 500_000_000.0);
        assert_eq!(to_bytes(&quantity("600M")).unwrap(), 600_000_000.0);
        assert_eq!(
            to_bytes(&quantity("512Mi")).unwrap(),
            512.0 * 1024.0 * 1024.0
        );
        assert_eq!(
            to_bytes(&quantity("2Gi")).unwrap(),
            2.0 * 1024.0 * 1024.0 * 1024.0
        );
        assert_eq!(to_bytes(&quantity("1024")).unwrap(), 1024.0);
    }

    #[test]
    fn unknown_unit_is_rejected() {
        assert!(to_bytes(&quantity("10Zi")).is_err());
        assert!(to_bytes(&quantity("abc")).is_err());
    }
}
