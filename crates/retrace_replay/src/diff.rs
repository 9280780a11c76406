//! Divergence and stack difference reports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker placed on the first differing line of a report
pub const DIVERGENCE_MARKER: &str = "<-- divergence";

/// Length of the longest common prefix of `a` and `b`
#[must_use]
pub fn common_prefix<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Length of the longest prefix common to every sequence
#[must_use]
pub fn common_prefix_all<T: PartialEq>(seqs: &[&[T]]) -> usize {
    let Some((first, rest)) = seqs.split_first() else {
        return 0;
    };
    rest.iter()
        .map(|s| common_prefix(first, s))
        .min()
        .unwrap_or(first.len())
}

/// Side-by-side view of where a replay left its recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceReport {
    /// Thread the divergence happened on
    pub thread: String,
    /// Index of the first differing event
    pub index: usize,
    /// Matching events before the divergence, most recent last
    pub common: Vec<String>,
    /// Recorded events from the divergence on
    pub recorded: Vec<String>,
    /// Replayed events from the divergence on
    pub replayed: Vec<String>,
}

impl DivergenceReport {
    /// Compare two event sequences; `None` if they are equal. `context`
    /// bounds how many events each section keeps.
    #[must_use]
    pub fn compare<T: PartialEq + fmt::Display>(
        thread: impl Into<String>,
        recorded: &[T],
        replayed: &[T],
        context: usize,
    ) -> Option<Self> {
        let index = common_prefix(recorded, replayed);
        if index == recorded.len() && index == replayed.len() {
            return None;
        }
        let render = |items: &[T]| -> Vec<String> {
            items.iter().take(context).map(ToString::to_string).collect()
        };
        Some(Self {
            thread: thread.into(),
            index,
            common: recorded[index.saturating_sub(context)..index]
                .iter()
                .map(ToString::to_string)
                .collect(),
            recorded: render(&recorded[index..]),
            replayed: render(&replayed[index..]),
        })
    }
}

impl fmt::Display for DivergenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "trace divergence on thread {} at event {}", self.thread, self.index)?;
        if !self.common.is_empty() {
            writeln!(f, "common:")?;
            for line in &self.common {
                writeln!(f, "    {}", line)?;
            }
        }
        for (title, lines) in [("recorded:", &self.recorded), ("replayed:", &self.replayed)] {
            writeln!(f, "{}", title)?;
            if lines.is_empty() {
                writeln!(f, "    <end of trace> {}", DIVERGENCE_MARKER)?;
            }
            for (i, line) in lines.iter().enumerate() {
                if i == 0 {
                    writeln!(f, "    {} {}", line, DIVERGENCE_MARKER)?;
                } else {
                    writeln!(f, "    {}", line)?;
                }
            }
        }
        Ok(())
    }
}

/// Difference between the stack captured at record time and at replay time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDifference {
    /// Frames shared by every stack
    pub common: Vec<String>,
    /// Frames of the last matching stack below the common root
    pub last_matching: Vec<String>,
    /// Recorded frames below the common root
    pub record: Vec<String>,
    /// Replayed frames below the common root
    pub replay: Vec<String>,
}

impl StackDifference {
    /// Compare two stacks, rooted at the first frame. `previous` is the last
    /// stack both runs agreed on. `None` if the stacks are identical.
    #[must_use]
    pub fn compute(previous: Option<&[String]>, record: &[String], replay: &[String]) -> Option<Self> {
        if record == replay {
            return None;
        }
        let common = match previous {
            Some(prev) if !prev.is_empty() => common_prefix_all(&[prev, record, replay]),
            _ => common_prefix(record, replay),
        };
        Some(Self {
            common: record[..common].to_vec(),
            last_matching: previous.map(|p| p[common.min(p.len())..].to_vec()).unwrap_or_default(),
            record: record[common..].to_vec(),
            replay: replay[common..].to_vec(),
        })
    }
}

impl fmt::Display for StackDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sections = [
            ("Common root:", &self.common),
            ("last matching:", &self.last_matching),
            ("record:", &self.record),
            ("replay:", &self.replay),
        ];
        for (title, frames) in sections {
            if frames.is_empty() && (title == "Common root:" || title == "last matching:") {
                continue;
            }
            writeln!(f, "{}", title)?;
            for frame in frames {
                writeln!(f, "    {}", frame)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_common_prefix() {
        assert_eq!(common_prefix(&[1, 2, 3], &[1, 2, 4]), 2);
        assert_eq!(common_prefix::<i32>(&[], &[1]), 0);
        assert_eq!(common_prefix_all(&[&[1, 2, 3][..], &[1, 2][..], &[1, 9][..]]), 1);
        assert_eq!(common_prefix_all::<i32>(&[]), 0);
    }

    #[test]
    fn test_report_marks_divergence() {
        let recorded = strings(&["a", "b", "c", "d"]);
        let replayed = strings(&["a", "b", "x"]);
        let report = DivergenceReport::compare("main", &recorded, &replayed, 5).unwrap();
        assert_eq!(report.index, 2);
        assert_eq!(report.common, strings(&["a", "b"]));
        assert_eq!(report.recorded, strings(&["c", "d"]));
        assert_eq!(report.replayed, strings(&["x"]));

        let text = report.to_string();
        assert!(text.contains("c <-- divergence"));
        assert!(text.contains("x <-- divergence"));
        assert!(!text.contains("d <-- divergence"));
    }

    #[test]
    fn test_report_context_window() {
        let recorded: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        let mut replayed = recorded.clone();
        replayed[10] = "x".to_string();
        let report = DivergenceReport::compare("main", &recorded, &replayed, 3).unwrap();
        assert_eq!(report.common, strings(&["7", "8", "9"]));
        assert_eq!(report.recorded.len(), 3);
    }

    #[test]
    fn test_report_shorter_replay() {
        let recorded = strings(&["a", "b"]);
        let replayed = strings(&["a"]);
        let report = DivergenceReport::compare("main", &recorded, &replayed, 5).unwrap();
        assert!(report.replayed.is_empty());
        assert!(report.to_string().contains("<end of trace> <-- divergence"));
        assert!(DivergenceReport::compare("main", &recorded, &recorded, 5).is_none());
    }

    #[test]
    fn test_stack_difference() {
        let record = strings(&["main", "run", "read"]);
        let replay = strings(&["main", "run", "write"]);
        assert!(StackDifference::compute(None, &record, &record).is_none());

        let diff = StackDifference::compute(None, &record, &replay).unwrap();
        assert_eq!(diff.common, strings(&["main", "run"]));
        assert_eq!(diff.record, strings(&["read"]));
        assert_eq!(diff.replay, strings(&["write"]));

        let previous = strings(&["main", "setup"]);
        let diff = StackDifference::compute(Some(&previous), &record, &replay).unwrap();
        assert_eq!(diff.common, strings(&["main"]));
        assert_eq!(diff.last_matching, strings(&["setup"]));
        assert!(diff.to_string().starts_with("Common root:"));
    }

    proptest! {
        #[test]
        fn prop_prefix_is_common(a in proptest::collection::vec(0u8..4, 0..20), b in proptest::collection::vec(0u8..4, 0..20)) {
            let n = common_prefix(&a, &b);
            prop_assert_eq!(&a[..n], &b[..n]);
            if n < a.len() && n < b.len() {
                prop_assert_ne!(a[n], b[n]);
            }
        }
    }
}
