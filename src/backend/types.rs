// Value and identifier types shared across the backend contract.
//
// Everything here crosses the wire, so each type derives serde and keeps a
// representation that non-JVM clients can produce without a JVM bignum or
// a JDBC constant table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction isolation level on the backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

impl IsolationLevel {
    /// JDBC `Connection.TRANSACTION_*` constant for this level.
    pub fn as_jdbc(&self) -> i32 {
        match self {
            IsolationLevel::ReadUncommitted => 1,
            IsolationLevel::ReadCommitted => 2,
            IsolationLevel::RepeatableRead => 4,
            IsolationLevel::Serializable => 8,
        }
    }

    pub fn from_jdbc(value: i32) -> Option<Self> {
        match value {
            1 => Some(IsolationLevel::ReadUncommitted),
            2 => Some(IsolationLevel::ReadCommitted),
            4 => Some(IsolationLevel::RepeatableRead),
            8 => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// Arbitrary-precision decimal as it travels on the wire.
///
/// `unscaled` is the big-endian two's-complement encoding of the unscaled
/// integer; the represented value is `unscaled * 10^(-scale)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WireDecimal {
    pub scale: i32,
    pub unscaled: Vec<u8>,
}

impl WireDecimal {
    pub fn new(scale: i32, unscaled: Vec<u8>) -> Self {
        Self { scale, unscaled }
    }

    pub fn is_negative(&self) -> bool {
        self.unscaled.first().map(|b| b & 0x80 != 0).unwrap_or(false)
    }

    /// Parses a plain decimal string (`-12.345`, `0.005`, `42`).
    pub fn from_decimal_str(s: &str) -> Option<Self> {
        let s = s.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        if digits.is_empty() {
            return None;
        }
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }
        let mut unscaled_digits = Vec::with_capacity(int_part.len() + frac_part.len());
        for c in int_part.chars().chain(frac_part.chars()) {
            unscaled_digits.push(c.to_digit(10)? as u8);
        }
        let magnitude = decimal_digits_to_bytes(&unscaled_digits);
        let unscaled = magnitude_to_twos_complement(&magnitude, negative);
        Some(Self {
            scale: frac_part.len() as i32,
            unscaled,
        })
    }

    /// Renders the value as a plain decimal string.
    ///
    /// Only non-negative scales are rendered with a decimal point; a
    /// negative scale (an exact multiple of a power of ten) is rendered by
    /// appending zeros.
    pub fn to_decimal_string(&self) -> String {
        let negative = self.is_negative();
        let magnitude = twos_complement_to_magnitude(&self.unscaled, negative);
        let mut digits = bytes_to_decimal_digits(&magnitude);
        if digits.is_empty() {
            digits.push(0);
        }

        let mut body: String = digits.iter().map(|d| (b'0' + d) as char).collect();
        if self.scale > 0 {
            let scale = self.scale as usize;
            if body.len() <= scale {
                let pad = scale - body.len() + 1;
                body = "0".repeat(pad) + &body;
            }
            body.insert(body.len() - scale, '.');
        } else if self.scale < 0 && body != "0" {
            body.push_str(&"0".repeat((-self.scale) as usize));
        }

        if negative && body.trim_matches(|c| c == '0' || c == '.') != "" {
            format!("-{body}")
        } else {
            body
        }
    }
}

/// Converts base-10 digit array (most significant first) to big-endian bytes.
fn decimal_digits_to_bytes(digits: &[u8]) -> Vec<u8> {
    let mut current: Vec<u8> = digits.iter().copied().skip_while(|d| *d == 0).collect();
    let mut bytes_le = Vec::new();
    while !current.is_empty() {
        let mut next = Vec::with_capacity(current.len());
        let mut rem: u32 = 0;
        for &d in &current {
            let acc = rem * 10 + d as u32;
            let q = acc / 256;
            rem = acc % 256;
            if !next.is_empty() || q != 0 {
                next.push(q as u8);
            }
        }
        bytes_le.push(rem as u8);
        current = next;
    }
    bytes_le.reverse();
    bytes_le
}

/// Converts big-endian magnitude bytes to a base-10 digit array.
fn bytes_to_decimal_digits(bytes: &[u8]) -> Vec<u8> {
    let mut digits: Vec<u8> = vec![];
    for &b in bytes {
        // digits = digits * 256 + b
        let mut carry = b as u32;
        for d in digits.iter_mut().rev() {
            let acc = *d as u32 * 256 + carry;
            *d = (acc % 10) as u8;
            carry = acc / 10;
        }
        while carry > 0 {
            digits.insert(0, (carry % 10) as u8);
            carry /= 10;
        }
    }
    digits
}

fn magnitude_to_twos_complement(magnitude: &[u8], negative: bool) -> Vec<u8> {
    if magnitude.is_empty() {
        return vec![0];
    }
    let mut out = magnitude.to_vec();
    // Leading sign byte so the magnitude's high bit is not read as a sign.
    if out[0] & 0x80 != 0 {
        out.insert(0, 0);
    }
    if negative {
        for b in out.iter_mut() {
            *b = !*b;
        }
        for b in out.iter_mut().rev() {
            let (v, overflow) = b.overflowing_add(1);
            *b = v;
            if !overflow {
                break;
            }
        }
    }
    out
}

fn twos_complement_to_magnitude(bytes: &[u8], negative: bool) -> Vec<u8> {
    if !negative {
        return bytes.iter().copied().skip_while(|b| *b == 0).collect();
    }
    let mut out = bytes.to_vec();
    for b in out.iter_mut().rev() {
        let (v, overflow) = b.overflowing_sub(1);
        *b = v;
        if !overflow {
            break;
        }
    }
    for b in out.iter_mut() {
        *b = !*b;
    }
    out.into_iter().skip_while(|b| b == &0).collect()
}

/// A single statement parameter or column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Decimal(WireDecimal),
    Text(String),
    Bytes(Vec<u8>),
    /// Milliseconds since UNIX epoch, UTC.
    TimestampMillis(i64),
}

/// Column description attached to a query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<SqlValue>,
}

/// Fully materialized query result as produced by a backend.
///
/// The engine pages rows out to clients in fetch-size chunks; backends do
/// not stream through this contract.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Row>,
}

/// Global transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    pub gtrid: Vec<u8>,
    pub bqual: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, gtrid: Vec<u8>, bqual: Vec<u8>) -> Self {
        Self {
            format_id,
            gtrid,
            bqual,
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.format_id,
            hex::encode(&self.gtrid),
            hex::encode(&self.bqual)
        )
    }
}

/// Flags accepted by `XaResource::start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XaStartFlags {
    NoFlags,
    Join,
    Resume,
}

/// Flags accepted by `XaResource::end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XaEndFlags {
    Success,
    Fail,
    Suspend,
}

/// Outcome of `XaResource::prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XaVote {
    Ok,
    ReadOnly,
}

/// Scan control for `XaResource::recover`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XaRecoverScan {
    Start,
    End,
    NoScan,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_jdbc_round_trip() {
        for level in [
            IsolationLevel::ReadUncommitted,
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ] {
            assert_eq!(IsolationLevel::from_jdbc(level.as_jdbc()), Some(level));
        }
        assert_eq!(IsolationLevel::from_jdbc(3), None);
    }

    #[test]
    fn test_decimal_positive() {
        let d = WireDecimal::from_decimal_str("12.345").unwrap();
        assert_eq!(d.scale, 3);
        assert_eq!(d.to_decimal_string(), "12.345");
    }

    #[test]
    fn test_decimal_negative() {
        let d = WireDecimal::from_decimal_str("-98765.4321").unwrap();
        assert!(d.is_negative());
        assert_eq!(d.to_decimal_string(), "-98765.4321");
    }

    #[test]
    fn test_decimal_leading_zero_fraction() {
        let d = WireDecimal::from_decimal_str("0.005").unwrap();
        assert_eq!(d.scale, 3);
        assert_eq!(d.to_decimal_string(), "0.005");
    }

    #[test]
    fn test_decimal_zero() {
        let d = WireDecimal::from_decimal_str("0").unwrap();
        assert_eq!(d.to_decimal_string(), "0");
        assert!(!d.is_negative());
    }

    #[test]
    fn test_decimal_large_value_beyond_u128() {
        let s = "123456789012345678901234567890123456789012.99";
        let d = WireDecimal::from_decimal_str(s).unwrap();
        assert_eq!(d.to_decimal_string(), s);
    }

    #[test]
    fn test_decimal_integer_no_scale() {
        let d = WireDecimal::from_decimal_str("42").unwrap();
        assert_eq!(d.scale, 0);
        assert_eq!(d.to_decimal_string(), "42");
    }

    #[test]
    fn test_decimal_unscaled_is_twos_complement() {
        // -1 with scale 0 is the single byte 0xFF.
        let d = WireDecimal::from_decimal_str("-1").unwrap();
        assert_eq!(d.unscaled, vec![0xFF]);
        // 128 needs a leading zero byte to keep the sign bit clear.
        let d = WireDecimal::from_decimal_str("128").unwrap();
        assert_eq!(d.unscaled, vec![0x00, 0x80]);
    }

    #[test]
    fn test_decimal_rejects_garbage() {
        assert!(WireDecimal::from_decimal_str("").is_none());
        assert!(WireDecimal::from_decimal_str("abc").is_none());
        assert!(WireDecimal::from_decimal_str("-").is_none());
        assert!(WireDecimal::from_decimal_str("1.2.3").is_none());
    }

    #[test]
    fn test_xid_display() {
        let xid = Xid::new(0x1234, vec![0xDE, 0xAD], vec![0xBE, 0xEF]);
        assert_eq!(xid.to_string(), "4660:dead:beef");
    }

    #[test]
    fn test_xid_value_equality() {
        let a = Xid::new(1, b"gtrid".to_vec(), b"bq".to_vec());
        let b = Xid::new(1, b"gtrid".to_vec(), b"bq".to_vec());
        let c = Xid::new(1, b"gtrid".to_vec(), b"other".to_vec());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
