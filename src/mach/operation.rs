use super::val::{self, Val};
use crate::lang::token::Operator;
use crate::lang::Error;

type Result<T> = std::result::Result<T, Error>;

const TRUE: f64 = -1.0;
const FALSE: f64 = 0.0;

/// Expression operators over runtime values. Arithmetic and comparison
/// work on the f64 projection and yield `Double`; assignment narrows the
/// result back to the destination type.
pub struct Operation;

impl Operation {
    pub fn unary(op: Operator, val: Val) -> Result<Val> {
        match op {
            Operator::Minus => Ok(Val::Double(-val.to_number())),
            Operator::Plus => Ok(Val::Double(val.to_number())),
            Operator::Not => Ok(Val::Double(f64::from(!val.to_integer()))),
            _ => Err(error!(InternalError; "NOT A UNARY OPERATOR")),
        }
    }

    pub fn binary(op: Operator, lhs: Val, rhs: Val) -> Result<Val> {
        if op == Operator::Plus && (lhs.is_string() || rhs.is_string()) {
            return Operation::concatenate(lhs, rhs);
        }
        if op.is_comparison() && (lhs.is_string() || rhs.is_string()) {
            return Operation::compare_strings(op, lhs, rhs);
        }
        let l = lhs.to_number();
        let r = rhs.to_number();
        let result = match op {
            Operator::Plus => l + r,
            Operator::Minus => l - r,
            Operator::Multiply => l * r,
            Operator::Divide => {
                if r == 0.0 {
                    return Err(error!(DivisionByZero));
                }
                l / r
            }
            Operator::DivideInt => {
                let ri = r.trunc() as i64;
                if ri == 0 {
                    return Err(error!(DivisionByZero));
                }
                (l.trunc() as i64 / ri) as f64
            }
            Operator::Modulus => {
                let ri = r.trunc() as i64;
                if ri == 0 {
                    return Err(error!(DivisionByZero));
                }
                (l.trunc() as i64 % ri) as f64
            }
            Operator::Caret => l.powf(r),
            Operator::Equal => bool_val(val::float_equal(l, r)),
            Operator::NotEqual => bool_val(!val::float_equal(l, r)),
            Operator::Less => bool_val(l < r && !val::float_equal(l, r)),
            Operator::Greater => bool_val(l > r && !val::float_equal(l, r)),
            Operator::LessEqual => bool_val(l < r || val::float_equal(l, r)),
            Operator::GreaterEqual => bool_val(l > r || val::float_equal(l, r)),
            Operator::And => f64::from(val::to_i16(l) & val::to_i16(r)),
            Operator::Or => f64::from(val::to_i16(l) | val::to_i16(r)),
            Operator::Xor => f64::from(val::to_i16(l) ^ val::to_i16(r)),
            Operator::Eqv => f64::from(!(val::to_i16(l) ^ val::to_i16(r))),
            Operator::Imp => f64::from(!val::to_i16(l) | val::to_i16(r)),
            Operator::Not => return Err(error!(InternalError; "NOT A BINARY OPERATOR")),
        };
        Ok(Val::Double(result))
    }

    /// `+` concatenates when either side is a string; a numeric operand
    /// contributes nothing.
    fn concatenate(lhs: Val, rhs: Val) -> Result<Val> {
        let l = match lhs {
            Val::String(s) => s,
            _ => String::new(),
        };
        let r = match rhs {
            Val::String(s) => s,
            _ => String::new(),
        };
        if l.chars().count() + r.chars().count() > val::MAX_STRING {
            return Err(error!(StringTooLong));
        }
        Ok(Val::String(l + &r))
    }

    fn compare_strings(op: Operator, lhs: Val, rhs: Val) -> Result<Val> {
        let (l, r) = match (lhs, rhs) {
            (Val::String(l), Val::String(r)) => (l, r),
            _ => return Err(error!(TypeMismatch)),
        };
        let l = val::string_bytes(&l);
        let r = val::string_bytes(&r);
        let result = match op {
            Operator::Equal => l == r,
            Operator::NotEqual => l != r,
            Operator::Less => l < r,
            Operator::LessEqual => l <= r,
            Operator::Greater => l > r,
            Operator::GreaterEqual => l >= r,
            _ => return Err(error!(InternalError; "NOT A COMPARISON")),
        };
        Ok(Val::Double(if result { TRUE } else { FALSE }))
    }
}

fn bool_val(b: bool) -> f64 {
    if b {
        TRUE
    } else {
        FALSE
    }
}
