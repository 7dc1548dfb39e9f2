use super::val::Val;
use crate::lang::Error;
use std::collections::VecDeque;

type Result<T> = std::result::Result<T, Error>;

/// Expands a `PRINT USING` format string over a list of values.
/// Field characters: `#` digit, `.` decimal point, `,` thousands,
/// leading `+`/`$`/`$$`/`**`/`**$`, trailing `+`/`-`, `^^^^` exponent,
/// `!` first char, `\ .. \` fixed width, `&` unchanged, `_` literal-next.
pub fn print_using(format: &str, values: Vec<Val>) -> Result<String> {
    let chars: Vec<char> = format.chars().collect();
    let mut values: VecDeque<Val> = values.into();
    let mut output = String::new();
    let mut pos = 0;

    while pos < chars.len() && !values.is_empty() {
        let c = chars[pos];
        if c == '#' || c == '+' || c == '$' || c == '*' || c == '.' {
            match (numeric_field(&chars, pos), values.pop_front()) {
                (Some(field), Some(value)) => {
                    output.push_str(&field.render(value.to_number()));
                    pos = field.end;
                }
                (Some(_), None) => break,
                (None, value) => {
                    if let Some(value) = value {
                        values.push_front(value);
                    }
                    output.push(c);
                    pos += 1;
                }
            }
        } else if c == '!' {
            let s = match values.pop_front() {
                Some(value) => string_value(value),
                None => break,
            };
            output.push(s.chars().next().unwrap_or(' '));
            pos += 1;
        } else if c == '&' {
            let s = match values.pop_front() {
                Some(value) => string_value(value),
                None => break,
            };
            output.push_str(&s);
            pos += 1;
        } else if c == '\\' {
            match chars[pos + 1..].iter().position(|&c| c == '\\') {
                Some(found) => {
                    let width = found + 2;
                    let mut s = match values.pop_front() {
                        Some(value) => string_value(value),
                        None => break,
                    };
                    let len = s.chars().count();
                    if len < width {
                        s.push_str(&" ".repeat(width - len));
                    } else {
                        s = s.chars().take(width).collect();
                    }
                    output.push_str(&s);
                    pos += width;
                }
                None => {
                    output.push(c);
                    pos += 1;
                }
            }
        } else if c == '_' {
            pos += 1;
            if pos < chars.len() {
                output.push(chars[pos]);
                pos += 1;
            }
        } else {
            output.push(c);
            pos += 1;
        }
    }

    // Whatever format text remains is literal.
    while pos < chars.len() {
        output.push(chars[pos]);
        pos += 1;
    }
    Ok(output)
}

struct NumericField {
    end: usize,
    digits: usize,
    decimals: usize,
    has_decimal: bool,
    has_comma: bool,
    leading_sign: bool,
    trailing_sign: bool,
    dollar: bool,
    asterisk_fill: bool,
    exponential: bool,
}

fn numeric_field(chars: &[char], start: usize) -> Option<NumericField> {
    let mut pos = start;
    let at = |p: usize| chars.get(p).copied().unwrap_or('\0');

    let mut field = NumericField {
        end: 0,
        digits: 0,
        decimals: 0,
        has_decimal: false,
        has_comma: false,
        leading_sign: false,
        trailing_sign: false,
        dollar: false,
        asterisk_fill: false,
        exponential: false,
    };

    if at(pos) == '+' {
        field.leading_sign = true;
        pos += 1;
    } else if at(pos) == '$' && at(pos + 1) == '$' {
        field.dollar = true;
        field.digits += 1;
        pos += 2;
    } else if at(pos) == '$' {
        field.dollar = true;
        pos += 1;
    } else if at(pos) == '*' && at(pos + 1) == '*' {
        field.asterisk_fill = true;
        field.digits += 2;
        pos += 2;
        if at(pos) == '$' {
            field.dollar = true;
            pos += 1;
        }
    }

    while at(pos) == '#' || at(pos) == ',' {
        if at(pos) == '#' {
            field.digits += 1;
        } else {
            field.has_comma = true;
        }
        pos += 1;
    }

    if at(pos) == '.' {
        field.has_decimal = true;
        pos += 1;
        while at(pos) == '#' {
            field.decimals += 1;
            pos += 1;
        }
    }

    if at(pos) == '-' || at(pos) == '+' {
        if !field.leading_sign {
            field.trailing_sign = true;
            pos += 1;
        }
    }

    if at(pos) == '^' && at(pos + 1) == '^' && at(pos + 2) == '^' && at(pos + 3) == '^' {
        field.exponential = true;
        pos += 4;
    }

    if field.digits == 0 && field.decimals == 0 && !field.exponential {
        return None;
    }
    field.end = pos;
    Some(field)
}

impl NumericField {
    fn render(&self, num: f64) -> String {
        let has_sign = self.leading_sign || self.trailing_sign;
        let mut total_width = self.digits + self.decimals + usize::from(self.has_decimal);
        if has_sign {
            total_width += 1;
        }
        if self.dollar {
            total_width += 1;
        }

        let mut body = if self.exponential {
            let precision = if self.decimals > 0 { self.decimals } else { 2 };
            scientific(num, precision)
        } else if self.has_decimal {
            format!("{:.*}", self.decimals, num)
        } else {
            format!("{:.0}", num)
        };

        let sign_char = if num < 0.0 {
            '-'
        } else if has_sign {
            '+'
        } else {
            ' '
        };
        // With an explicit sign position the minus moves there; otherwise
        // it stays glued to the digits.
        if num < 0.0 && has_sign && body.starts_with('-') {
            body.remove(0);
        }

        if self.has_comma && !self.exponential {
            body = insert_thousands(&body);
        }

        let pad_width = total_width
            .saturating_sub(usize::from(self.dollar))
            .saturating_sub(usize::from(has_sign));
        while body.chars().count() < pad_width {
            body.insert(0, if self.asterisk_fill { '*' } else { ' ' });
        }

        let mut result = String::new();
        if self.leading_sign {
            result.push(sign_char);
        }
        if self.dollar {
            result.push('$');
        }
        result.push_str(&body);
        if self.trailing_sign {
            result.push(sign_char);
        }
        result
    }
}

fn insert_thousands(body: &str) -> String {
    let (int_part, dec_part) = match body.find('.') {
        Some(dot) => (&body[..dot], &body[dot..]),
        None => (body, ""),
    };
    let mut grouped = String::new();
    let mut count = 0;
    for c in int_part.chars().rev() {
        if count > 0 && count % 3 == 0 && c.is_ascii_digit() {
            grouped.insert(0, ',');
        }
        grouped.insert(0, c);
        if c.is_ascii_digit() {
            count += 1;
        }
    }
    grouped + dec_part
}

/// `^^^^` notation: `d.ddE+xx` with a signed two-digit exponent.
fn scientific(num: f64, precision: usize) -> String {
    if num == 0.0 {
        return format!("{:.*}E+00", precision, 0.0);
    }
    let formatted = format!("{:.*e}", precision, num);
    match formatted.find('e') {
        Some(at) => {
            let mantissa = &formatted[..at];
            let exponent: i32 = formatted[at + 1..].parse().unwrap_or(0);
            format!("{}E{:+03}", mantissa, exponent)
        }
        None => formatted,
    }
}

fn string_value(val: Val) -> String {
    match val {
        Val::String(s) => s,
        v => v.to_string(),
    }
}
