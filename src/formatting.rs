use crate::schema::DisplayFormat;

/// Renders a metric value the way downstream reports print it. `None` stays `None`.
pub fn format_value(value: Option<f64>, display: DisplayFormat) -> Option<String> {
    let v = value?;
    if !v.is_finite() {
        return Some(v.to_string());
    }

    let formatted = match display {
        DisplayFormat::Percentage => {
            if v < 0.0 {
                format!("({:.1}%)", v.abs())
            } else {
                format!("{:.1}%", v)
            }
        }
        DisplayFormat::Multiple => {
            if v < 0.0 {
                format!("({:.2}x)", v.abs())
            } else {
                format!("{:.2}x", v)
            }
        }
        DisplayFormat::Thousands => format_thousands(v),
    };
    Some(formatted)
}

fn format_thousands(value: f64) -> String {
    let scaled = value / 1000.0;
    let body = if (scaled - scaled.trunc()).abs() < 1e-6 {
        group_digits(&format!("{:.0}", scaled.trunc().abs()))
    } else {
        group_digits(&format!("{:.1}", scaled.abs()))
    };

    if scaled < 0.0 {
        format!("({})", body)
    } else {
        body
    }
}

/// Inserts thousands separators into the integer part of an unsigned decimal string.
fn group_digits(digits: &str) -> String {
    let (int_part, frac_part) = match digits.find('.') {
        Some(idx) => digits.split_at(idx),
        None => (digits, ""),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3 + frac_part.len());
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped.push_str(frac_part);
    grouped
}
