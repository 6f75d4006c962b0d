/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::fmt;

/// Helper type for printing repeated strings more efficiently. You should use
/// `repeat_display`, or one of the `repeat_sql_*` helpers to construct it.
#[derive(Debug, Clone)]
pub struct RepeatDisplay<'a, F> {
    count: usize,
    sep: &'a str,
    fmt_one: F,
}

impl<'a, F> fmt::Display for RepeatDisplay<'a, F>
where
    F: Fn(usize, &mut fmt::Formatter<'_>) -> fmt::Result,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.count {
            if i != 0 {
                f.write_str(self.sep)?;
            }
            (self.fmt_one)(i, f)?;
        }
        Ok(())
    }
}

/// Construct a RepeatDisplay that will repeatedly call `fmt_one` with a
/// formatter `count` times, separated by `sep`.
#[inline]
pub fn repeat_display<F>(count: usize, sep: &str, fmt_one: F) -> RepeatDisplay<'_, F>
where
    F: Fn(usize, &mut fmt::Formatter<'_>) -> fmt::Result,
{
    RepeatDisplay {
        count,
        sep,
        fmt_one,
    }
}

/// Returns a value that formats as `count` instances of `?` separated by
/// commas.
#[inline]
pub fn repeat_sql_vars(count: usize) -> impl fmt::Display {
    repeat_display(count, ",", |_, f| write!(f, "?"))
}

/// Returns a value that formats as `count` instances of `(?)` separated by
/// commas.
#[inline]
pub fn repeat_sql_values(count: usize) -> impl fmt::Display {
    // Note: it's important we don't use `?1` here.
    repeat_display(count, ",", |_, f| write!(f, "(?)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_display() {
        let o = repeat_display(1, ",", |i, f| write!(f, "({},?)", i));
        assert_eq!(format!("{}", o), "(0,?)");

        let o2 = repeat_display(2, ",", |i, f| write!(f, "({},?)", i));
        assert_eq!(format!("{}", o2), "(0,?),(1,?)");
    }

    #[test]
    fn test_repeat_sql_helpers() {
        assert_eq!(format!("{}", repeat_sql_vars(0)), "");
        assert_eq!(format!("{}", repeat_sql_vars(3)), "?,?,?");
        assert_eq!(format!("{}", repeat_sql_values(3)), "(?),(?),(?)");
    }
}
