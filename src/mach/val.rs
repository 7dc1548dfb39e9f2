use crate::lang::ast::VarType;
use crate::lang::Error;

type Result<T> = std::result::Result<T, Error>;

/// Semantic limit on string length, enforced at concatenation and at the
/// string-building functions.
pub const MAX_STRING: usize = 255;

/// ## Runtime values
///
/// Strings hold bytes as chars U+0000..U+00FF so the binary conversions
/// (`MKI$`/`CVI` and friends) round-trip losslessly.

#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Integer(i16),
    Single(f32),
    Double(f64),
    String(String),
}

impl Val {
    pub fn var_type(&self) -> VarType {
        match self {
            Val::Integer(_) => VarType::Integer,
            Val::Single(_) => VarType::Single,
            Val::Double(_) => VarType::Double,
            Val::String(_) => VarType::String,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Val::String(_))
    }

    pub fn is_numeric(&self) -> bool {
        !self.is_string()
    }

    /// Numeric projection. Strings project to 0.0; callers that want the
    /// strict behavior use `VAL`.
    pub fn to_number(&self) -> f64 {
        match self {
            Val::Integer(n) => f64::from(*n),
            Val::Single(n) => f64::from(*n),
            Val::Double(n) => *n,
            Val::String(_) => 0.0,
        }
    }

    /// 16-bit projection: round half to even, clamp to the i16 range.
    pub fn to_integer(&self) -> i16 {
        to_i16(self.to_number())
    }

    pub fn to_bool(&self) -> bool {
        match self {
            Val::String(s) => !s.is_empty(),
            _ => self.to_number() != 0.0,
        }
    }

    pub fn default_for(var_type: VarType) -> Val {
        match var_type {
            VarType::Integer => Val::Integer(0),
            VarType::Single => Val::Single(0.0),
            VarType::Double => Val::Double(0.0),
            VarType::String => Val::String(String::new()),
        }
    }

    /// Coerces for assignment. The string/numeric divide is strict.
    pub fn coerce_to(self, target: VarType) -> Result<Val> {
        match (&self, target) {
            (Val::String(_), VarType::String) => Ok(self),
            (Val::String(_), _) => Err(error!(TypeMismatch)),
            (_, VarType::String) => Err(error!(TypeMismatch)),
            (_, VarType::Integer) => Ok(Val::Integer(self.to_integer())),
            (_, VarType::Single) => Ok(Val::Single(self.to_number() as f32)),
            (_, VarType::Double) => Ok(Val::Double(self.to_number())),
        }
    }
}

/// Round half to even, clamped to the i16 range.
pub fn to_i16(d: f64) -> i16 {
    if d >= 32767.5 {
        return 32767;
    }
    if d <= -32768.5 {
        return -32768;
    }
    let floor = d.floor();
    let diff = d - floor;
    let r = if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 {
        floor
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    };
    r as i16
}

/// Equality with the tolerance that absorbs f32-to-f64 widening artifacts.
/// This is specified behavior; relational operators rely on it.
pub fn float_equal(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    let diff = (a - b).abs();
    let larger = a.abs().max(b.abs());
    diff <= (larger * 1e-6).max(1e-9)
}

/// String bytes from the char-per-byte representation. Chars above U+00FF
/// narrow to their low byte.
pub fn string_bytes(s: &str) -> Vec<u8> {
    s.chars().map(|c| c as u32 as u8).collect()
}

/// The char-per-byte representation of raw bytes.
pub fn bytes_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn double_string(d: f64) -> String {
    if d == d.trunc() && d.abs() < 1e10 {
        format!("{}", d as i64)
    } else {
        format!("{}", d)
    }
}

fn single_string(f: f32) -> String {
    if f64::from(f) == f64::from(f).trunc() && f.abs() < 1e10 {
        format!("{}", f64::from(f) as i64)
    } else {
        format!("{}", f)
    }
}

impl std::fmt::Display for Val {
    /// The `PRINT`/`STR$` rendering: sign slot before non-negative
    /// numbers, one trailing space after every number, strings unchanged.
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Val::String(s) => write!(f, "{}", s),
            Val::Integer(n) => {
                if *n >= 0 {
                    write!(f, " {} ", n)
                } else {
                    write!(f, "{} ", n)
                }
            }
            Val::Single(n) => {
                let s = single_string(*n);
                if *n >= 0.0 {
                    write!(f, " {} ", s)
                } else {
                    write!(f, "{} ", s)
                }
            }
            Val::Double(n) => {
                let s = double_string(*n);
                if *n >= 0.0 {
                    write!(f, " {} ", s)
                } else {
                    write!(f, "{} ", s)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banker_rounding() {
        assert_eq!(to_i16(0.5), 0);
        assert_eq!(to_i16(1.5), 2);
        assert_eq!(to_i16(2.5), 2);
        assert_eq!(to_i16(-0.5), 0);
        assert_eq!(to_i16(-1.5), -2);
        assert_eq!(to_i16(2.4), 2);
        assert_eq!(to_i16(2.6), 3);
    }

    #[test]
    fn test_integer_clamp() {
        assert_eq!(to_i16(1e9), 32767);
        assert_eq!(to_i16(-1e9), -32768);
    }

    #[test]
    fn test_display_sign_slots() {
        assert_eq!(Val::Double(3.0).to_string(), " 3 ");
        assert_eq!(Val::Double(-3.0).to_string(), "-3 ");
        assert_eq!(Val::Double(3.25).to_string(), " 3.25 ");
        assert_eq!(Val::Integer(42).to_string(), " 42 ");
        assert_eq!(Val::String("x".to_string()).to_string(), "x");
    }

    #[test]
    fn test_float_equal_tolerance() {
        assert!(float_equal(0.1f32 as f64, 0.1));
        assert!(!float_equal(1.0, 1.001));
        assert!(float_equal(1e12, 1e12 + 1.0));
    }

    #[test]
    fn test_coerce_strictness() {
        assert!(Val::String("a".to_string())
            .coerce_to(VarType::Integer)
            .is_err());
        assert!(Val::Double(1.0).coerce_to(VarType::String).is_err());
        assert_eq!(
            Val::Double(1.6).coerce_to(VarType::Integer).unwrap(),
            Val::Integer(2)
        );
    }

    #[test]
    fn test_byte_round_trip() {
        let bytes = vec![0u8, 127, 128, 255];
        assert_eq!(string_bytes(&bytes_string(&bytes)), bytes);
    }
}
