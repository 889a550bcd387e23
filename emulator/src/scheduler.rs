//! Deterministic hardware thread selection.

use std::fmt;
use std::str::FromStr;

/// How the next thread to run is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SchedulePolicy {
    /// One instruction per runnable thread per round, in thread order.
    #[default]
    RoundRobin,
    /// Repeat this thread sequence. Entries naming a thread that cannot
    /// run are skipped.
    Fixed(Vec<usize>),
}

impl FromStr for SchedulePolicy {
    type Err = String;

    /// `round-robin`, or a comma separated thread list such as `0,0,1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "round-robin" {
            return Ok(SchedulePolicy::RoundRobin);
        }
        let sequence = s
            .split(',')
            .map(|t| {
                t.trim()
                    .parse::<usize>()
                    .map_err(|_| format!("invalid thread id '{}' in schedule", t))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SchedulePolicy::Fixed(sequence))
    }
}

impl fmt::Display for SchedulePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulePolicy::RoundRobin => f.write_str("round-robin"),
            SchedulePolicy::Fixed(sequence) => {
                let ids: Vec<String> = sequence.iter().map(|id| id.to_string()).collect();
                f.write_str(&ids.join(","))
            }
        }
    }
}

pub struct Scheduler {
    policy: SchedulePolicy,
    cursor: usize,
}

impl Scheduler {
    pub fn new(policy: SchedulePolicy) -> Self {
        Self { policy, cursor: 0 }
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    /// Pick the next thread for which `runnable` holds. Returns `None` when
    /// a full pass over the policy finds nothing to run.
    pub fn next<F>(&mut self, thread_count: usize, runnable: F) -> Option<usize>
    where
        F: Fn(usize) -> bool,
    {
        match &self.policy {
            SchedulePolicy::RoundRobin => {
                for i in 0..thread_count {
                    let id = (self.cursor + i) % thread_count;
                    if runnable(id) {
                        self.cursor = (id + 1) % thread_count;
                        return Some(id);
                    }
                }
                None
            }
            SchedulePolicy::Fixed(sequence) => {
                let len = sequence.len();
                for i in 0..len {
                    let slot = (self.cursor + i) % len;
                    let id = sequence[slot];
                    if id < thread_count && runnable(id) {
                        self.cursor = (slot + 1) % len;
                        return Some(id);
                    }
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picks(scheduler: &mut Scheduler, count: usize, runnable: &[bool]) -> Vec<usize> {
        (0..count)
            .filter_map(|_| scheduler.next(runnable.len(), |id| runnable[id]))
            .collect()
    }

    #[test]
    fn round_robin_skips_halted_threads() {
        let mut s = Scheduler::new(SchedulePolicy::RoundRobin);
        assert_eq!(picks(&mut s, 6, &[true, false, true, true]), vec![0, 2, 3, 0, 2, 3]);
        assert_eq!(s.next(2, |_| false), None);
    }

    #[test]
    fn fixed_sequence_repeats() {
        let mut s = Scheduler::new("1,1,0".parse().unwrap());
        assert_eq!(picks(&mut s, 5, &[true, true]), vec![1, 1, 0, 1, 1]);
        let mut s = Scheduler::new(SchedulePolicy::Fixed(vec![0, 3]));
        assert_eq!(picks(&mut s, 3, &[false, true]), Vec::<usize>::new());
    }

    #[test]
    fn policy_text_form() {
        assert_eq!("".parse::<SchedulePolicy>(), Ok(SchedulePolicy::RoundRobin));
        assert_eq!(SchedulePolicy::Fixed(vec![0, 2]).to_string(), "0,2");
        assert!("0,x".parse::<SchedulePolicy>().is_err());
    }
}
