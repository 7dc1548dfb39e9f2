extern crate chrono;

use super::val::{self, Val};
use crate::lang::error::error_message;
use crate::lang::Error;
use chrono::Timelike;

type Result<T> = std::result::Result<T, Error>;

/// Wichmann-Hill triple-seed generator, scoped to the Runtime so RND is
/// reproducible per run rather than process-global.
#[derive(Debug, Clone)]
pub struct RndState {
    s0: u32,
    s1: u32,
    s2: u32,
    last: f64,
}

impl RndState {
    pub fn new() -> RndState {
        let mut state = RndState {
            s0: 1,
            s1: 1,
            s2: 1,
            last: 0.5,
        };
        state.seed(0x00C0_FFEE);
        state
    }

    pub fn seed(&mut self, seed: u32) {
        self.s0 = seed % 30269;
        self.s1 = seed % 30307;
        self.s2 = seed % 30323;
        if self.s0 == 0 {
            self.s0 = 1;
        }
        if self.s1 == 0 {
            self.s1 = 1;
        }
        if self.s2 == 0 {
            self.s2 = 1;
        }
    }

    pub fn next(&mut self) -> f64 {
        self.s0 = (171 * self.s0) % 30269;
        self.s1 = (172 * self.s1) % 30307;
        self.s2 = (170 * self.s2) % 30323;
        self.last = (f64::from(self.s0) / 30269.0
            + f64::from(self.s1) / 30307.0
            + f64::from(self.s2) / 30323.0)
            % 1.0;
        self.last
    }

    pub fn last(&self) -> f64 {
        self.last
    }
}

impl Default for RndState {
    fn default() -> RndState {
        RndState::new()
    }
}

/// ## Built-in functions
///
/// The pure ones live here; the interpreter handles the ones that need
/// the console, the file table, or the error state.

pub struct Function;

impl Function {
    pub fn abs(val: Val) -> Result<Val> {
        Ok(Val::Double(val.to_number().abs()))
    }

    pub fn atn(val: Val) -> Result<Val> {
        Ok(Val::Double(val.to_number().atan()))
    }

    pub fn cos(val: Val) -> Result<Val> {
        Ok(Val::Double(val.to_number().cos()))
    }

    pub fn exp(val: Val) -> Result<Val> {
        Ok(Val::Double(val.to_number().exp()))
    }

    /// Truncation toward zero.
    pub fn fix(val: Val) -> Result<Val> {
        Ok(Val::Double(val.to_number().trunc()))
    }

    /// Floor.
    pub fn int(val: Val) -> Result<Val> {
        Ok(Val::Double(val.to_number().floor()))
    }

    pub fn log(val: Val) -> Result<Val> {
        let n = val.to_number();
        if n <= 0.0 {
            return Err(error!(IllegalFunctionCall));
        }
        Ok(Val::Double(n.ln()))
    }

    pub fn rnd(state: &mut RndState, args: &[Val]) -> Result<Val> {
        let arg = match args.first() {
            Some(v) => v.to_number(),
            None => 1.0,
        };
        if arg == 0.0 {
            return Ok(Val::Double(state.last()));
        }
        if arg < 0.0 {
            state.seed(arg.abs() as u32);
        }
        Ok(Val::Double(state.next()))
    }

    pub fn sgn(val: Val) -> Result<Val> {
        let n = val.to_number();
        Ok(Val::Double(if n > 0.0 {
            1.0
        } else if n < 0.0 {
            -1.0
        } else {
            0.0
        }))
    }

    pub fn sin(val: Val) -> Result<Val> {
        Ok(Val::Double(val.to_number().sin()))
    }

    pub fn sqr(val: Val) -> Result<Val> {
        let n = val.to_number();
        if n < 0.0 {
            return Err(error!(IllegalFunctionCall));
        }
        Ok(Val::Double(n.sqrt()))
    }

    pub fn tan(val: Val) -> Result<Val> {
        Ok(Val::Double(val.to_number().tan()))
    }

    pub fn cint(val: Val) -> Result<Val> {
        Ok(Val::Double(f64::from(val.to_integer())))
    }

    pub fn csng(val: Val) -> Result<Val> {
        Ok(Val::Single(val.to_number() as f32))
    }

    pub fn cdbl(val: Val) -> Result<Val> {
        Ok(Val::Double(val.to_number()))
    }

    pub fn asc(val: Val) -> Result<Val> {
        let s = string_arg(val)?;
        match s.chars().next() {
            Some(c) => Ok(Val::Double(f64::from(c as u32 as u8))),
            None => Err(error!(IllegalFunctionCall)),
        }
    }

    pub fn chr(val: Val) -> Result<Val> {
        let n = val.to_number() as i64;
        if !(0..=255).contains(&n) {
            return Err(error!(IllegalFunctionCall));
        }
        Ok(Val::String(char::from(n as u8).to_string()))
    }

    pub fn hex(val: Val) -> Result<Val> {
        Ok(Val::String(format!("{:X}", val.to_integer())))
    }

    pub fn oct(val: Val) -> Result<Val> {
        Ok(Val::String(format!("{:o}", val.to_integer())))
    }

    pub fn left(string: Val, len: Val) -> Result<Val> {
        let s = string_arg(string)?;
        let n = len.to_number() as i64;
        if n < 0 {
            return Err(error!(IllegalFunctionCall));
        }
        Ok(Val::String(s.chars().take(n as usize).collect()))
    }

    pub fn right(string: Val, len: Val) -> Result<Val> {
        let s = string_arg(string)?;
        let n = len.to_number() as i64;
        if n < 0 {
            return Err(error!(IllegalFunctionCall));
        }
        let count = s.chars().count();
        let skip = count.saturating_sub(n as usize);
        Ok(Val::String(s.chars().skip(skip).collect()))
    }

    pub fn mid(args: Vec<Val>) -> Result<Val> {
        let mut args = args.into_iter();
        let s = string_arg(args.next().ok_or_else(|| error!(IllegalFunctionCall))?)?;
        let start = args
            .next()
            .ok_or_else(|| error!(IllegalFunctionCall))?
            .to_number() as i64;
        let start = if start < 1 { 0 } else { (start - 1) as usize };
        let length = match args.next() {
            Some(v) => v.to_number().max(0.0) as usize,
            None => usize::max_value(),
        };
        Ok(Val::String(s.chars().skip(start).take(length).collect()))
    }

    pub fn len(val: Val) -> Result<Val> {
        let s = string_arg(val)?;
        Ok(Val::Double(s.chars().count() as f64))
    }

    pub fn str(val: Val) -> Result<Val> {
        if val.is_string() {
            return Err(error!(TypeMismatch));
        }
        Ok(Val::String(val.to_string()))
    }

    pub fn val(v: Val) -> Result<Val> {
        let s = string_arg(v)?;
        Ok(Val::Double(parse_number_prefix(s.trim())))
    }

    pub fn space(val: Val) -> Result<Val> {
        let n = val.to_number() as i64;
        if n < 0 {
            return Err(error!(IllegalFunctionCall));
        }
        if n as usize > val::MAX_STRING {
            return Err(error!(StringTooLong));
        }
        Ok(Val::String(" ".repeat(n as usize)))
    }

    pub fn string(args: Vec<Val>) -> Result<Val> {
        let mut args = args.into_iter();
        let n = args
            .next()
            .ok_or_else(|| error!(IllegalFunctionCall))?
            .to_number() as i64;
        if n < 0 {
            return Err(error!(IllegalFunctionCall));
        }
        if n as usize > val::MAX_STRING {
            return Err(error!(StringTooLong));
        }
        let fill = args.next().ok_or_else(|| error!(IllegalFunctionCall))?;
        let c = match fill {
            Val::String(s) => s.chars().next().unwrap_or(' '),
            v => char::from(v.to_number() as i64 as u8),
        };
        Ok(Val::String(c.to_string().repeat(n as usize)))
    }

    pub fn instr(mut args: Vec<Val>) -> Result<Val> {
        if args.len() < 2 || args.len() > 3 {
            return Err(error!(IllegalFunctionCall));
        }
        let needle = string_arg(args.pop().ok_or_else(|| error!(IllegalFunctionCall))?)?;
        let haystack = string_arg(args.pop().ok_or_else(|| error!(IllegalFunctionCall))?)?;
        let start = match args.pop() {
            Some(v) => {
                let start = v.to_number() as i64;
                if start < 1 {
                    0
                } else {
                    (start - 1) as usize
                }
            }
            None => 0,
        };
        let hay = val::string_bytes(&haystack);
        let pat = val::string_bytes(&needle);
        if start >= hay.len() {
            return Ok(Val::Double(0.0));
        }
        if pat.is_empty() {
            return Ok(Val::Double((start + 1) as f64));
        }
        let found = hay[start..]
            .windows(pat.len())
            .position(|window| window == pat.as_slice());
        Ok(Val::Double(match found {
            Some(at) => (start + at + 1) as f64,
            None => 0.0,
        }))
    }

    /// Spaces up to a 1-based column; no-op when already past it.
    pub fn tab(print_column: usize, val: Val) -> Result<Val> {
        let target = val.to_number() as i64 - 1;
        if target > print_column as i64 {
            Ok(Val::String(" ".repeat((target - print_column as i64) as usize)))
        } else {
            Ok(Val::String(String::new()))
        }
    }

    pub fn spc(val: Val) -> Result<Val> {
        let n = val.to_number() as i64;
        Ok(Val::String(" ".repeat(n.max(0) as usize)))
    }

    pub fn fre(_val: Option<Val>) -> Result<Val> {
        // Memory is not modeled.
        Ok(Val::Double(32767.0))
    }

    pub fn cvi(val: Val) -> Result<Val> {
        let bytes = padded_bytes(string_arg(val)?, 2);
        let n = i16::from_le_bytes([bytes[0], bytes[1]]);
        Ok(Val::Double(f64::from(n)))
    }

    pub fn cvs(val: Val) -> Result<Val> {
        let bytes = padded_bytes(string_arg(val)?, 4);
        let n = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(Val::Double(f64::from(n)))
    }

    pub fn cvd(val: Val) -> Result<Val> {
        let bytes = padded_bytes(string_arg(val)?, 8);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        Ok(Val::Double(f64::from_le_bytes(raw)))
    }

    pub fn mki(val: Val) -> Result<Val> {
        let n = val.to_integer();
        Ok(Val::String(val::bytes_string(&n.to_le_bytes())))
    }

    pub fn mks(val: Val) -> Result<Val> {
        let n = val.to_number() as f32;
        Ok(Val::String(val::bytes_string(&n.to_le_bytes())))
    }

    pub fn mkd(val: Val) -> Result<Val> {
        let n = val.to_number();
        Ok(Val::String(val::bytes_string(&n.to_le_bytes())))
    }

    /// Seconds since midnight.
    pub fn timer() -> Result<Val> {
        let now = chrono::Local::now();
        Ok(Val::Double(f64::from(now.num_seconds_from_midnight())))
    }

    pub fn date() -> Result<Val> {
        Ok(Val::String(
            chrono::Local::now().format("%m-%d-%Y").to_string(),
        ))
    }

    pub fn time() -> Result<Val> {
        Ok(Val::String(
            chrono::Local::now().format("%H:%M:%S").to_string(),
        ))
    }

    pub fn environ(val: Val) -> Result<Val> {
        let name = string_arg(val)?;
        Ok(Val::String(std::env::var(name).unwrap_or_default()))
    }

    pub fn error_text(code: u16) -> Result<Val> {
        Ok(Val::String(error_message(code).to_string()))
    }
}

fn string_arg(val: Val) -> Result<String> {
    match val {
        Val::String(s) => Ok(s),
        _ => Err(error!(TypeMismatch)),
    }
}

fn padded_bytes(s: String, n: usize) -> Vec<u8> {
    let mut bytes = val::string_bytes(&s);
    bytes.resize(bytes.len().max(n), 0);
    bytes
}

/// Longest numeric prefix, VAL-style: sign, digits, fraction, exponent.
/// Anything unparsable is 0. INPUT field conversion uses the same rule.
pub fn parse_number_prefix(s: &str) -> f64 {
    let chars: Vec<char> = s.chars().collect();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let mut i = 0;
    if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
        i += 1;
    }
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() {
            seen_digit = true;
            i += 1;
            end = i;
        } else if c == '.' && !seen_dot && !seen_exp {
            seen_dot = true;
            i += 1;
            if seen_digit {
                end = i;
            }
        } else if (c == 'e' || c == 'E' || c == 'd' || c == 'D') && seen_digit && !seen_exp {
            let mut j = i + 1;
            if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                j += 1;
            }
            if j < chars.len() && chars[j].is_ascii_digit() {
                seen_exp = true;
                i = j;
            } else {
                break;
            }
        } else {
            break;
        }
    }
    if !seen_digit {
        return 0.0;
    }
    let text: String = chars[..end]
        .iter()
        .map(|c| match c {
            'd' | 'D' => 'E',
            'e' => 'E',
            c => *c,
        })
        .collect();
    text.parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_and_fix() {
        assert_eq!(Function::int(Val::Double(-2.5)).unwrap(), Val::Double(-3.0));
        assert_eq!(Function::fix(Val::Double(-2.5)).unwrap(), Val::Double(-2.0));
    }

    #[test]
    fn test_domain_errors() {
        assert!(Function::log(Val::Double(0.0)).is_err());
        assert!(Function::sqr(Val::Double(-1.0)).is_err());
        assert!(Function::asc(Val::String(String::new())).is_err());
        assert!(Function::chr(Val::Double(256.0)).is_err());
    }

    #[test]
    fn test_chr_asc_identity() {
        for n in 0..=255u32 {
            let c = Function::chr(Val::Double(f64::from(n))).unwrap();
            assert_eq!(Function::asc(c).unwrap(), Val::Double(f64::from(n)));
        }
    }

    #[test]
    fn test_left_right_mid() {
        let s = || Val::String("HELLO".to_string());
        assert_eq!(
            Function::left(s(), Val::Double(2.0)).unwrap(),
            Val::String("HE".to_string())
        );
        assert_eq!(
            Function::left(s(), Val::Double(99.0)).unwrap(),
            Val::String("HELLO".to_string())
        );
        assert_eq!(
            Function::right(s(), Val::Double(2.0)).unwrap(),
            Val::String("LO".to_string())
        );
        assert_eq!(
            Function::mid(vec![s(), Val::Double(2.0), Val::Double(3.0)]).unwrap(),
            Val::String("ELL".to_string())
        );
        assert_eq!(
            Function::mid(vec![s(), Val::Double(2.0)]).unwrap(),
            Val::String("ELLO".to_string())
        );
    }

    #[test]
    fn test_left_mid_partition() {
        let s = "PARTITION";
        for k in 0..=s.len() {
            let left = Function::left(
                Val::String(s.to_string()),
                Val::Double(k as f64),
            )
            .unwrap();
            let mid = Function::mid(vec![
                Val::String(s.to_string()),
                Val::Double((k + 1) as f64),
            ])
            .unwrap();
            match (left, mid) {
                (Val::String(l), Val::String(m)) => assert_eq!(l + &m, s),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn test_instr() {
        let f = |args: Vec<Val>| Function::instr(args).unwrap().to_number();
        let s = |s: &str| Val::String(s.to_string());
        assert_eq!(f(vec![s("HELLO"), s("LL")]), 3.0);
        assert_eq!(f(vec![s("HELLO"), s("X")]), 0.0);
        assert_eq!(f(vec![s("HELLO"), s("")]), 1.0);
        assert_eq!(f(vec![Val::Double(3.0), s("HELLO"), s("L")]), 3.0);
        assert_eq!(f(vec![Val::Double(5.0), s("HELLO"), s("L")]), 0.0);
    }

    #[test]
    fn test_string_builders() {
        assert_eq!(
            Function::space(Val::Double(3.0)).unwrap(),
            Val::String("   ".to_string())
        );
        assert_eq!(
            Function::string(vec![Val::Double(3.0), Val::String("ab".to_string())]).unwrap(),
            Val::String("aaa".to_string())
        );
        assert_eq!(
            Function::string(vec![Val::Double(2.0), Val::Double(65.0)]).unwrap(),
            Val::String("AA".to_string())
        );
        assert!(Function::space(Val::Double(256.0)).is_err());
    }

    #[test]
    fn test_val_parses_prefix() {
        let v = |s: &str| Function::val(Val::String(s.to_string())).unwrap().to_number();
        assert_eq!(v("42"), 42.0);
        assert_eq!(v("  -3.5xyz"), -3.5);
        assert_eq!(v("1E2"), 100.0);
        assert_eq!(v("abc"), 0.0);
        assert_eq!(v(""), 0.0);
    }

    #[test]
    fn test_val_str_round_trip() {
        for &n in &[0.0, 1.0, -1.0, 3.25, -123456.5, 1e9] {
            let s = Function::str(Val::Double(n)).unwrap();
            assert_eq!(Function::val(s).unwrap().to_number(), n);
        }
    }

    #[test]
    fn test_binary_round_trip() {
        for &n in &[-32768i16, -1, 0, 1, 32767] {
            let packed = Function::mki(Val::Double(f64::from(n))).unwrap();
            assert_eq!(Function::cvi(packed).unwrap().to_number(), f64::from(n));
        }
        let packed = Function::mks(Val::Double(3.25)).unwrap();
        assert_eq!(Function::cvs(packed).unwrap().to_number(), 3.25);
        let packed = Function::mkd(Val::Double(-1.5e100)).unwrap();
        assert_eq!(Function::cvd(packed).unwrap().to_number(), -1.5e100);
    }

    #[test]
    fn test_hex_oct() {
        assert_eq!(
            Function::hex(Val::Double(255.0)).unwrap(),
            Val::String("FF".to_string())
        );
        assert_eq!(
            Function::oct(Val::Double(8.0)).unwrap(),
            Val::String("10".to_string())
        );
        assert_eq!(
            Function::hex(Val::Double(-1.0)).unwrap(),
            Val::String("FFFF".to_string())
        );
    }

    #[test]
    fn test_tab() {
        assert_eq!(
            Function::tab(0, Val::Double(5.0)).unwrap(),
            Val::String("    ".to_string())
        );
        assert_eq!(
            Function::tab(10, Val::Double(5.0)).unwrap(),
            Val::String(String::new())
        );
    }

    #[test]
    fn test_rnd_modes() {
        let mut state = RndState::new();
        let a = Function::rnd(&mut state, &[]).unwrap().to_number();
        assert!((0.0..1.0).contains(&a));
        let again = Function::rnd(&mut state, &[Val::Double(0.0)])
            .unwrap()
            .to_number();
        assert_eq!(a, again);
        let b = Function::rnd(&mut state, &[Val::Double(1.0)])
            .unwrap()
            .to_number();
        assert_ne!(a, b);

        let mut s1 = RndState::new();
        let mut s2 = RndState::new();
        let x = Function::rnd(&mut s1, &[Val::Double(-7.0)]).unwrap();
        let y = Function::rnd(&mut s2, &[Val::Double(-7.0)]).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn test_string_homogeneity() {
        for n in [0usize, 1, 17, 255] {
            let v =
                Function::string(vec![Val::Double(n as f64), Val::Double(42.0)]).unwrap();
            match v {
                Val::String(s) => {
                    assert_eq!(s.chars().count(), n);
                    assert!(s.chars().all(|c| c == '*'));
                }
                _ => unreachable!(),
            }
        }
    }
}
