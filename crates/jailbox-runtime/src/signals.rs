//! Signal argument parsing for `kill`.
//!
//! The argument is either a decimal number or a name from the FreeBSD
//! signal-name table (with or without the `SIG` prefix, any case).

use crate::error::{Error, Result};

/// FreeBSD `sys_signame`, by signal number.
const SIGNAL_NAMES: &[(&str, i32)] = &[
    ("HUP", 1),
    ("INT", 2),
    ("QUIT", 3),
    ("ILL", 4),
    ("TRAP", 5),
    ("ABRT", 6),
    ("EMT", 7),
    ("FPE", 8),
    ("KILL", 9),
    ("BUS", 10),
    ("SEGV", 11),
    ("SYS", 12),
    ("PIPE", 13),
    ("ALRM", 14),
    ("TERM", 15),
    ("URG", 16),
    ("STOP", 17),
    ("TSTP", 18),
    ("CONT", 19),
    ("CHLD", 20),
    ("TTIN", 21),
    ("TTOU", 22),
    ("IO", 23),
    ("XCPU", 24),
    ("XFSZ", 25),
    ("VTALRM", 26),
    ("PROF", 27),
    ("WINCH", 28),
    ("INFO", 29),
    ("USR1", 30),
    ("USR2", 31),
    ("THR", 32),
];

const SIGTERM: i32 = 15;

/// Parse a `kill` signal argument; `None` defaults to `SIGTERM`.
pub fn parse_signal(arg: Option<&str>) -> Result<i32> {
    let Some(arg) = arg else {
        return Ok(SIGTERM);
    };
    // The argument can be either the signal number or its name. Try the
    // number first.
    if let Ok(number) = arg.parse::<i32>() {
        return Ok(number);
    }
    let name = arg
        .strip_prefix("SIG")
        .or_else(|| arg.strip_prefix("sig"))
        .unwrap_or(arg);
    SIGNAL_NAMES
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        .map(|&(_, number)| number)
        .ok_or_else(|| Error::UnknownSignal(arg.to_string()))
}
