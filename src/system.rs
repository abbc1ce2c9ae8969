//! Process observation through `/proc/<pid>/stat`.
//!
//! PIDs are reusable, so the start time (field 22, in clock ticks since
//! boot) is recorded at spawn and compared before trusting a stored PID.

use std::fs;
use std::io;

/// Process state, third field of `/proc/<pid>/stat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    Running,
    Sleeping,
    DiskSleep,
    Zombie,
    Stopped,
    TracingStop,
    Dead,
    Idle,
    Other(char),
}

impl From<char> for ProcState {
    fn from(c: char) -> Self {
        match c {
            'R' => ProcState::Running,
            'S' => ProcState::Sleeping,
            'D' => ProcState::DiskSleep,
            'Z' => ProcState::Zombie,
            'T' => ProcState::Stopped,
            't' => ProcState::TracingStop,
            'X' | 'x' => ProcState::Dead,
            'I' => ProcState::Idle,
            other => ProcState::Other(other),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProcStat {
    pub state: ProcState,
    /// Clock ticks between boot and the process start.
    pub start_time: u64,
}

impl ProcStat {
    pub fn is_gone(&self) -> bool {
        matches!(self.state, ProcState::Zombie | ProcState::Dead)
    }
}

/// Reads `/proc/<pid>/stat`. Fails with `NotFound` once the process is
/// fully reaped.
pub fn stat(pid: i32) -> io::Result<ProcStat> {
    let raw = fs::read_to_string(format!("/proc/{}/stat", pid))?;
    parse_stat(&raw)
}

/// The comm field (2) is an arbitrary string wrapped in parentheses and may
/// itself contain spaces and parentheses; everything is indexed from the
/// last `)`.
fn parse_stat(raw: &str) -> io::Result<ProcStat> {
    let rest = raw
        .rfind(')')
        .map(|i| &raw[i + 1..])
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed stat line"))?;

    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 of the stat line; start time is field 22.
    if fields.len() < 20 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated stat line",
        ));
    }

    let state = fields[0]
        .chars()
        .next()
        .map(ProcState::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing state field"))?;

    let start_time = fields[19]
        .parse::<u64>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(ProcStat { state, start_time })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "1234 (sleep) S 1 1234 1234 0 -1 4194560 159 0 0 0 0 0 0 0 \
                          20 0 1 0 5171264 8110080 195 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 \
                          17 3 0 0 0 0 0 0 0 0 0 0 0 0 0";

    #[test]
    fn parses_state_and_start_time() {
        let st = parse_stat(SAMPLE).unwrap();
        assert_eq!(st.state, ProcState::Sleeping);
        assert_eq!(st.start_time, 5171264);
        assert!(!st.is_gone());
    }

    #[test]
    fn comm_with_spaces_and_parens() {
        let raw = "42 (tmux: server) (x) Z 1 42 42 0 -1 4194560 0 0 0 0 0 0 0 0 \
                   20 0 1 0 999 0 0 0 0 0 0 0 0 0 0 0 0 0 0 \
                   17 3 0 0 0 0 0 0 0 0 0 0 0 0 0";
        let st = parse_stat(raw).unwrap();
        assert_eq!(st.state, ProcState::Zombie);
        assert_eq!(st.start_time, 999);
        assert!(st.is_gone());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_stat("not a stat line").is_err());
        assert!(parse_stat("1 (x) S 1 2").is_err());
    }

    #[test]
    fn dead_states_are_gone() {
        for (c, gone) in [('Z', true), ('X', true), ('x', true), ('R', false)] {
            assert_eq!(ProcStat { state: c.into(), start_time: 0 }.is_gone(), gone);
        }
    }

    #[test]
    fn reads_own_stat() {
        let st = stat(std::process::id() as i32).unwrap();
        assert!(st.start_time > 0);
        assert!(!st.is_gone());
    }

    #[test]
    fn missing_pid_is_an_error() {
        // PIDs are capped at /proc/sys/kernel/pid_max; this one is above
        // the default 4194304 ceiling.
        assert!(stat(i32::MAX).is_err());
    }
}
