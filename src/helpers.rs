use alloy::primitives::{Address, U256};
use bigdecimal::num_bigint::BigInt;
use bigdecimal::BigDecimal;
use chrono::Utc;
use std::str::FromStr;

use crate::error::Error;

/// Unix timestamp in milliseconds, the wire format for every stored
/// timestamp in this service.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug)]
pub enum Formatter {
    Str(String),
    Number(i64),
}

/// Substitute `$0`, `$1`, ... placeholders in a configured URL template.
pub fn formatter(mut parser: String, args: &[Formatter]) -> String {
    for (index, value) in args.iter().enumerate() {
        match value {
            Formatter::Str(s) => {
                parser = parser.replace(format!("${}", index).as_str(), s);
            },
            Formatter::Number(n) => {
                parser = parser
                    .replace(format!("${}", index).as_str(), &n.to_string());
            },
        }
    }
    parser
}

/// Split a `(a,b,c),(d,e,f)` tuple-list env value into its tuples.
pub fn parse_tuple_string(data: String) -> Vec<String> {
    if data.len() < 2 {
        return Vec::new();
    }
    let str = &data[1..];
    let splited = str.split(",(");
    let mut items: Vec<String> = Vec::new();

    for c in splited {
        if let Some(index) = c.find(')') {
            let tuple_data = &c[0..index];
            items.push(tuple_data.to_owned());
        }
    }

    items
}

pub fn parse_address(value: &str) -> Result<Address, Error> {
    Address::from_str(value.trim())
        .map_err(|_| Error::InvalidAddress(value.to_string()))
}

/// Lowercase 0x-form used for keying.
pub fn address_lower(address: &Address) -> String {
    format!("{address:#x}")
}

/// EIP-55 checksummed form used on-chain and in responses.
pub fn address_checksum(address: &Address) -> String {
    address.to_checksum(None)
}

pub fn clamp_percent(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Minor units to a human decimal string, e.g. (1_500_000, 6) -> "1.5".
/// Display only; balance arithmetic never leaves integer space.
pub fn format_minor_units(amount: U256, decimals: u8) -> String {
    let digits = BigInt::from_str(&amount.to_string())
        .unwrap_or_else(|_| BigInt::from(0));
    BigDecimal::new(digits, i64::from(decimals))
        .normalized()
        .to_string()
}

/// Serde adapter: U256 as a decimal string on the wire, tolerant of
/// plain JSON numbers on the way back in.
pub mod u256_string {
    use alloy::primitives::U256;
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(
        value: &U256,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<U256, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) => {
                U256::from_str(&s).map_err(DeError::custom)
            },
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(U256::from)
                .ok_or_else(|| DeError::custom("expected unsigned integer")),
            other => Err(DeError::custom(format!(
                "expected decimal string, got {}",
                other
            ))),
        }
    }
}

/// Same adapter for optional fields (aggregator `transaction.value`).
pub mod u256_opt_string {
    use alloy::primitives::U256;
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(
        value: &Option<U256>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<U256>, D::Error> {
        let value = Option::<serde_json::Value>::deserialize(deserializer)?;
        match value {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => {
                U256::from_str(&s).map(Some).map_err(DeError::custom)
            },
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .map(|v| Some(U256::from(v)))
                .ok_or_else(|| DeError::custom("expected unsigned integer")),
            Some(other) => Err(DeError::custom(format!(
                "expected decimal string, got {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapped {
        #[serde(with = "u256_string")]
        amount: U256,
    }

    #[test]
    fn test_u256_round_trip() {
        let wrapped = Wrapped {
            amount: U256::from(500_000_000_000_000_000u128),
        };
        let json = serde_json::to_string(&wrapped).unwrap();
        assert_eq!(json, r#"{"amount":"500000000000000000"}"#);

        let back: Wrapped = serde_json::from_str(&json).unwrap();
        assert_eq!(back.amount, wrapped.amount);

        let from_number: Wrapped =
            serde_json::from_str(r#"{"amount":250000}"#).unwrap();
        assert_eq!(from_number.amount, U256::from(250_000u64));
    }

    #[test]
    fn test_format_minor_units() {
        assert_eq!(
            format_minor_units(U256::from(1_500_000u64), 6),
            "1.5"
        );
        assert_eq!(
            format_minor_units(U256::from(500_000_000_000_000_000u128), 18),
            "0.5"
        );
        assert_eq!(format_minor_units(U256::ZERO, 18), "0");
    }

    #[test]
    fn test_address_forms() {
        let address =
            parse_address("0x52908400098527886E0F7030069857D2E4169EE7")
                .unwrap();
        assert_eq!(
            address_lower(&address),
            "0x52908400098527886e0f7030069857d2e4169ee7"
        );
        assert_eq!(
            address_checksum(&address),
            "0x52908400098527886E0F7030069857D2E4169EE7"
        );
    }

    #[test]
    fn test_round4() {
        assert_eq!(round4(59.99996), 60.0);
        assert_eq!(round4(33.33333), 33.3333);
    }
}
