/// Operator key actions, shared by the presenter's keyboard and the daemon's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Quit,
    TogglePause,
    ToggleMute,
    /// Seek to this percentage of the stream (0, 10, ... 90)
    SeekPercent(u8),
    /// Broadcast a sync cue for the current frame
    SyncNow,
}

const ESC: char = '\u{1b}';

impl KeyAction {
    pub fn from_key(key: char) -> Option<Self> {
        match key {
            'q' | 'Q' | ESC => Some(Self::Quit),
            ' ' => Some(Self::TogglePause),
            'm' | 'M' => Some(Self::ToggleMute),
            's' | 'S' => Some(Self::SyncNow),
            '0'..='9' => key.to_digit(10).map(|d| Self::SeekPercent(d as u8 * 10)),
            _ => None,
        }
    }

    /// Interpret one line of terminal input. Only the first character counts,
    /// so "space + enter" toggles pause.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        line.chars().next().and_then(Self::from_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_keys_map_to_tenths() {
        assert_eq!(KeyAction::from_key('0'), Some(KeyAction::SeekPercent(0)));
        assert_eq!(KeyAction::from_key('7'), Some(KeyAction::SeekPercent(70)));
        assert_eq!(KeyAction::from_key('9'), Some(KeyAction::SeekPercent(90)));
    }

    #[test]
    fn transport_keys() {
        assert_eq!(KeyAction::from_key('q'), Some(KeyAction::Quit));
        assert_eq!(KeyAction::from_key('\u{1b}'), Some(KeyAction::Quit));
        assert_eq!(KeyAction::from_key(' '), Some(KeyAction::TogglePause));
        assert_eq!(KeyAction::from_key('m'), Some(KeyAction::ToggleMute));
        assert_eq!(KeyAction::from_key('s'), Some(KeyAction::SyncNow));
        assert_eq!(KeyAction::from_key('x'), None);
    }

    #[test]
    fn lines_use_first_char() {
        assert_eq!(KeyAction::from_line(" \n"), Some(KeyAction::TogglePause));
        assert_eq!(KeyAction::from_line("5\r\n"), Some(KeyAction::SeekPercent(50)));
        assert_eq!(KeyAction::from_line("\n"), None);
    }
}
