//! Console key handling
//!
//! One byte from the serial console becomes at most one [`Command`]. Line
//! endings and spaces are ignored, so `3\r\n` and `3` do the same thing.

use flashbench::Action;

/// What a console key asks the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Run a bench action.
    Run(Action),
    /// Print the menu again.
    Menu,
    /// Drop the advisory state back to idle.
    Reset,
    /// Leave the menu loop.
    Quit,
    /// A key with no meaning; the worker says so.
    Unknown(u8),
}

/// Decode one console byte.
///
/// Returns `None` for whitespace.
pub fn parse_key(key: u8) -> Option<Command> {
    match key {
        b'\r' | b'\n' | b' ' | b'\t' => None,
        b'm' | b'M' | b'?' => Some(Command::Menu),
        b'r' | b'R' => Some(Command::Reset),
        b'q' | b'Q' => Some(Command::Quit),
        other => Some(
            Action::from_menu_key(char::from(other))
                .map_or(Command::Unknown(other), Command::Run),
        ),
    }
}

/// Decode every key in `line`, skipping whitespace.
pub fn parse_line(line: &str) -> impl Iterator<Item = Command> + '_ {
    line.bytes().filter_map(parse_key)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn digits_map_to_actions() {
        assert_eq!(
            parse_key(b'2'),
            Some(Command::Run(Action::TestConnection { write_check: false }))
        );
        assert_eq!(parse_key(b'5'), Some(Command::Run(Action::QuickBenchmark)));
        assert_eq!(parse_key(b'S'), Some(Command::Run(Action::Status)));
        assert!(matches!(
            parse_key(b'3'),
            Some(Command::Run(Action::RunBenchmark { save: true, .. }))
        ));
    }

    #[test]
    fn control_keys() {
        assert_eq!(parse_key(b'm'), Some(Command::Menu));
        assert_eq!(parse_key(b'R'), Some(Command::Reset));
        assert_eq!(parse_key(b'q'), Some(Command::Quit));
        assert_eq!(parse_key(b'x'), Some(Command::Unknown(b'x')));
        assert_eq!(parse_key(b'0'), Some(Command::Unknown(b'0')));
    }

    #[test]
    fn line_endings_are_skipped() {
        let keys: Vec<Command> = parse_line("7\r\n q").collect();
        assert_eq!(keys, [Command::Run(Action::Identify), Command::Quit]);
    }
}
