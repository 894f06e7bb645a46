use itertools::{EitherOrBoth, Itertools};

use crate::core::domain::LineMismatch;

/// Decides whether the candidate's output matches the reference output.
pub trait OutputMatcher: std::fmt::Debug + Send + Sync {
    fn matches(&self, expected: &[u8], actual: &[u8]) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ExactMatch;

impl OutputMatcher for ExactMatch {
    fn matches(&self, expected: &[u8], actual: &[u8]) -> bool {
        expected == actual
    }
}

/// Ignores whitespace at the end of each line and trailing empty lines.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrailingWhitespaceInsensitive;

impl OutputMatcher for TrailingWhitespaceInsensitive {
    fn matches(&self, expected: &[u8], actual: &[u8]) -> bool {
        normalized_lines(expected).eq(normalized_lines(actual))
    }
}

fn normalized_lines(output: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut lines: Vec<&[u8]> = output
        .split(|&b| b == b'\n')
        .map(|line| line.trim_ascii_end())
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.into_iter()
}

/// First line (1-based) where the outputs differ after trimming line ends.
pub fn first_mismatch(expected: &str, actual: &str) -> Option<LineMismatch> {
    expected
        .trim_end()
        .lines()
        .zip_longest(actual.trim_end().lines())
        .enumerate()
        .find_map(|(idx, pair)| {
            let (expected, actual, both) = match pair {
                EitherOrBoth::Both(e, a) => (e.trim_end(), a.trim_end(), true),
                EitherOrBoth::Left(e) => (e.trim_end(), "", false),
                EitherOrBoth::Right(a) => ("", a.trim_end(), false),
            };
            (expected != actual || !both).then(|| {
                LineMismatch {
                    line: idx + 1,
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                }
            })
        })
}
