//! Parsing of operator inputs and outputs given on the command line.
//!
//! Inputs take the form `pin=type:value`, outputs `pin:type`. List types
//! take comma separated values, e.g. `0=doubles:3,1,2`.

use anyhow::{anyhow, Result};

use dpf::Value;
use dpf_core::{ObjectKind, Pin, ValueType};

/// Type names accepted on the command line.
pub const TYPE_NAMES: [&str; 8] = [
    "int", "double", "bool", "string", "ints", "doubles", "strings", "object",
];

fn parse_type(name: &str) -> Result<ValueType> {
    let t = match name.trim() {
        "int" | "int32" => ValueType::Int,
        "double" => ValueType::Double,
        "bool" => ValueType::Bool,
        "string" => ValueType::String,
        "ints" => ValueType::IntList,
        "doubles" => ValueType::DoubleList,
        "strings" => ValueType::StringList,
        "object" => ValueType::Object(ObjectKind::Any),
        other => ValueType::from_type_name(other).ok_or_else(|| {
            anyhow!(
                "unknown type: {} (expected one of {})",
                other,
                TYPE_NAMES.join(", ")
            )
        })?,
    };
    Ok(t)
}

fn parse_pin(s: &str) -> Result<Pin> {
    s.trim()
        .parse()
        .map_err(|_| anyhow!("invalid pin number: {}", s))
}

fn parse_list<T: std::str::FromStr>(s: &str, what: &str) -> Result<Vec<T>> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| anyhow!("invalid {} in list: {}", what, v))
        })
        .collect()
}

/// Parses an input argument of the form `pin=type:value`.
pub fn parse_input(arg: &str) -> Result<(Pin, Value)> {
    let (pin, rest) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("input must look like pin=type:value, got {}", arg))?;
    let (type_name, value) = rest
        .split_once(':')
        .ok_or_else(|| anyhow!("input must look like pin=type:value, got {}", arg))?;
    let pin = parse_pin(pin)?;
    let value = match parse_type(type_name)? {
        ValueType::Int => Value::Int(
            value
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid int: {}", value))?,
        ),
        ValueType::Double => Value::Double(
            value
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid double: {}", value))?,
        ),
        ValueType::Bool => Value::Bool(
            value
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid bool: {}", value))?,
        ),
        ValueType::String => Value::String(value.to_string()),
        ValueType::IntList => Value::IntList(parse_list(value, "int")?),
        ValueType::DoubleList => Value::DoubleList(parse_list(value, "double")?),
        ValueType::StringList => {
            Value::StringList(value.split(',').map(|s| s.to_string()).collect())
        }
        other => return Err(anyhow!("{} inputs can't be given on the command line", other)),
    };
    Ok((pin, value))
}

/// Parses an output argument of the form `pin:type`.
pub fn parse_output(arg: &str) -> Result<(Pin, ValueType)> {
    let (pin, type_name) = arg
        .split_once(':')
        .ok_or_else(|| anyhow!("output must look like pin:type, got {}", arg))?;
    Ok((parse_pin(pin)?, parse_type(type_name)?))
}

/// Splits `ip:port`.
pub fn parse_address(addr: &str) -> Result<(String, u16)> {
    let (ip, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("address must look like ip:port, got {}", addr))?;
    let port = port
        .parse()
        .map_err(|_| anyhow!("invalid port in address: {}", addr))?;
    Ok((ip.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs() {
        let (pin, value) = parse_input("0=doubles:3,1,2").unwrap();
        assert_eq!(pin, 0);
        assert_eq!(value, Value::DoubleList(vec![3., 1., 2.]));
        assert_eq!(parse_input("-1=int:1").unwrap(), (-1, Value::Int(1)));
        assert_eq!(
            parse_input("2=string:a:b").unwrap(),
            (2, Value::String("a:b".to_string()))
        );
        assert_eq!(parse_input("1=ints:").unwrap(), (1, Value::IntList(vec![])));
        assert!(parse_input("0=double:abc").is_err());
        assert!(parse_input("0:double").is_err());
        assert!(parse_input("0=object:1").is_err());
    }

    #[test]
    fn outputs() {
        assert_eq!(parse_output("1:double").unwrap(), (1, ValueType::Double));
        assert_eq!(
            parse_output("0:string_field").unwrap(),
            (0, ValueType::Object(ObjectKind::StringField))
        );
        assert!(parse_output("x:double").is_err());
        assert!(parse_output("0:nothing").is_err());
    }

    #[test]
    fn addresses() {
        assert_eq!(
            parse_address("127.0.0.1:50054").unwrap(),
            ("127.0.0.1".to_string(), 50054)
        );
        assert!(parse_address("localhost").is_err());
    }
}
