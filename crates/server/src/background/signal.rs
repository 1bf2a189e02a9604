//! POSIX signal helpers for supervised process groups.

use std::io;

const SIGNALS: &[(&str, i32)] = &[
    ("SIGHUP", libc::SIGHUP),
    ("SIGINT", libc::SIGINT),
    ("SIGQUIT", libc::SIGQUIT),
    ("SIGKILL", libc::SIGKILL),
    ("SIGUSR1", libc::SIGUSR1),
    ("SIGUSR2", libc::SIGUSR2),
    ("SIGTERM", libc::SIGTERM),
];

/// Accepts `SIGTERM`, `term`, `TERM`, or `15`.
pub fn parse_signal(value: &str) -> Option<i32> {
    let trimmed = value.trim();
    if let Ok(number) = trimmed.parse::<i32>() {
        return SIGNALS
            .iter()
            .find(|(_, n)| *n == number)
            .map(|(_, n)| *n);
    }
    let upper = trimmed.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    SIGNALS.iter().find(|(n, _)| *n == name).map(|(_, n)| *n)
}

pub fn signal_name(signal: i32) -> String {
    SIGNALS
        .iter()
        .find(|(_, n)| *n == signal)
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| format!("SIG{signal}"))
}

/// Signal every process in the group led by `pgid`.
pub fn signal_group(pgid: u32, signal: i32) -> io::Result<()> {
    let rc = unsafe { libc::kill(-(pgid as i32), signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// `kill -0`: the process exists, even if we may not signal it.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_numbers() {
        assert_eq!(parse_signal("SIGTERM"), Some(libc::SIGTERM));
        assert_eq!(parse_signal("kill"), Some(libc::SIGKILL));
        assert_eq!(parse_signal(" int "), Some(libc::SIGINT));
        assert_eq!(parse_signal("9"), Some(libc::SIGKILL));
        assert_eq!(parse_signal("SIGBOGUS"), None);
        assert_eq!(parse_signal("0"), None);
    }

    #[test]
    fn names_round_trip() {
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(parse_signal(&signal_name(libc::SIGHUP)), Some(libc::SIGHUP));
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }
}
