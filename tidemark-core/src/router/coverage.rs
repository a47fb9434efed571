//! Coverage expansion: `(start, end, grain)` to partition keys.

use crate::error::RoutingError;
use crate::types::Grain;

/// A calendar month, ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    fn next(self) -> Self {
        if self.month == 12 {
            YearMonth {
                year: self.year + 1,
                month: 1,
            }
        } else {
            YearMonth {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    fn key(self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

/// Which end of a range a token bounds. A bare year covers January when it
/// opens a range and December when it closes one.
#[derive(Clone, Copy)]
enum Bound {
    Start,
    End,
}

fn parse_bound(token: &str, bound: Bound, grain: Grain) -> Result<YearMonth, RoutingError> {
    let unparsable = || RoutingError::UnparsableBound {
        token: token.to_string(),
        grain: grain.to_string(),
    };
    let digits = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_digit());

    let token = token.trim();
    let (year, month) = match token.split_once('-') {
        None if digits(token, 4) => {
            let month = match bound {
                Bound::Start => 1,
                Bound::End => 12,
            };
            (token, month)
        }
        Some((y, m)) if digits(y, 4) && digits(m, 2) => {
            let month: u32 = m.parse().map_err(|_| unparsable())?;
            (y, month)
        }
        _ => return Err(unparsable()),
    };
    if !(1..=12).contains(&month) {
        return Err(unparsable());
    }
    let year: i32 = year.parse().map_err(|_| unparsable())?;
    Ok(YearMonth { year, month })
}

/// Expand an inclusive coverage range into partition keys of `grain`.
///
/// Year keys are `YYYY`, month keys `YYYY-MM`. Tokens may be either shape
/// regardless of `grain`. The result is deterministic and ascending; a
/// malformed or inverted range yields an error and no keys.
pub fn expand_coverage(start: &str, end: &str, grain: Grain) -> Result<Vec<String>, RoutingError> {
    let first = parse_bound(start, Bound::Start, grain)?;
    let last = parse_bound(end, Bound::End, grain)?;
    if first > last {
        return Err(RoutingError::InvertedRange {
            start: start.to_string(),
            end: end.to_string(),
        });
    }

    let keys = match grain {
        Grain::Year => (first.year..=last.year)
            .map(|y| format!("{y:04}"))
            .collect(),
        Grain::Month => {
            let mut keys = Vec::new();
            let mut cursor = first;
            while cursor <= last {
                keys.push(cursor.key());
                cursor = cursor.next();
            }
            keys
        }
    };
    Ok(keys)
}
