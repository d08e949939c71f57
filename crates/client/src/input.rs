//! Keyboard and pointer handling for the tab strip.

use std::fmt;
use std::str::FromStr;

use crate::error::ClientError;

/// Modifier keys held during a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers {
    pub ctrl: bool,
    pub meta: bool,
    pub alt: bool,
    pub shift: bool,
}

/// A key press as delivered by the UI toolkit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: char,
    pub modifiers: Modifiers,
}

impl KeyEvent {
    pub fn new(key: char, modifiers: Modifiers) -> Self {
        Self { key, modifiers }
    }

    /// Ctrl plus `key`.
    pub fn ctrl(key: char) -> Self {
        Self::new(
            key,
            Modifiers {
                ctrl: true,
                ..Default::default()
            },
        )
    }

    /// Cmd (meta) plus `key`.
    pub fn meta(key: char) -> Self {
        Self::new(
            key,
            Modifiers {
                meta: true,
                ..Default::default()
            },
        )
    }

    /// `key` without modifiers.
    pub fn plain(key: char) -> Self {
        Self::new(key, Modifiers::default())
    }
}

/// What the UI should do with an event after the multiplexer saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; suppress the platform default and stop propagation.
    Consumed,
    /// Not handled; deliver it normally.
    PassThrough,
}

/// Mouse buttons the tab strip distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerButton {
    Primary,
    Middle,
    Secondary,
}

/// Which platform modifier a shortcut requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrimaryModifier {
    Ctrl,
    Meta,
    /// Ctrl or Cmd, whichever the platform uses.
    Either,
    None,
}

/// A key combination such as `Mod+W`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortcut {
    key: char,
    primary: PrimaryModifier,
    alt: bool,
    shift: bool,
}

impl Shortcut {
    /// Whether `event` triggers this shortcut.
    pub fn matches(&self, event: &KeyEvent) -> bool {
        let m = event.modifiers;
        let primary = match self.primary {
            PrimaryModifier::Ctrl => m.ctrl && !m.meta,
            PrimaryModifier::Meta => m.meta && !m.ctrl,
            PrimaryModifier::Either => m.ctrl ^ m.meta,
            PrimaryModifier::None => !m.ctrl && !m.meta,
        };
        primary
            && m.alt == self.alt
            && m.shift == self.shift
            && event.key.eq_ignore_ascii_case(&self.key)
    }
}

impl Default for Shortcut {
    fn default() -> Self {
        Self {
            key: 'w',
            primary: PrimaryModifier::Either,
            alt: false,
            shift: false,
        }
    }
}

impl FromStr for Shortcut {
    type Err = ClientError;

    /// Parses `Ctrl+W`, `Cmd+W`, `Mod+Shift+W` and similar.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::InvalidShortcut(s.to_string());

        let mut primary = PrimaryModifier::None;
        let mut alt = false;
        let mut shift = false;
        let mut key = None;

        for part in s.split('+').map(str::trim) {
            match part.to_ascii_lowercase().as_str() {
                "ctrl" | "control" => primary = PrimaryModifier::Ctrl,
                "cmd" | "meta" | "super" => primary = PrimaryModifier::Meta,
                "mod" | "cmdorctrl" => primary = PrimaryModifier::Either,
                "alt" | "option" => alt = true,
                "shift" => shift = true,
                other => {
                    let mut chars = other.chars();
                    match (chars.next(), chars.next(), key) {
                        (Some(c), None, None) => key = Some(c.to_ascii_lowercase()),
                        _ => return Err(invalid()),
                    }
                }
            }
        }

        Ok(Self {
            key: key.ok_or_else(invalid)?,
            primary,
            alt,
            shift,
        })
    }
}

impl fmt::Display for Shortcut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primary {
            PrimaryModifier::Ctrl => write!(f, "Ctrl+")?,
            PrimaryModifier::Meta => write!(f, "Cmd+")?,
            PrimaryModifier::Either => write!(f, "Mod+")?,
            PrimaryModifier::None => {}
        }
        if self.alt {
            write!(f, "Alt+")?;
        }
        if self.shift {
            write!(f, "Shift+")?;
        }
        write!(f, "{}", self.key.to_ascii_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_ctrl_and_cmd_w() {
        let shortcut = Shortcut::default();
        assert!(shortcut.matches(&KeyEvent::ctrl('w')));
        assert!(shortcut.matches(&KeyEvent::meta('W')));
        assert!(!shortcut.matches(&KeyEvent::plain('w')));
        assert!(!shortcut.matches(&KeyEvent::ctrl('q')));
    }

    #[test]
    fn test_extra_modifiers_do_not_match() {
        let shortcut = Shortcut::default();
        let event = KeyEvent::new(
            'w',
            Modifiers {
                ctrl: true,
                shift: true,
                ..Default::default()
            },
        );
        assert!(!shortcut.matches(&event));
    }

    #[test]
    fn test_parse_and_display() {
        let shortcut: Shortcut = "Ctrl+Shift+W".parse().unwrap();
        assert_eq!(shortcut.to_string(), "Ctrl+Shift+W");
        assert!(!shortcut.matches(&KeyEvent::meta('w')));

        let parsed: Shortcut = "mod+w".parse().unwrap();
        assert_eq!(parsed, Shortcut::default());
        assert_eq!(parsed.to_string(), "Mod+W");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("Ctrl+".parse::<Shortcut>().is_err());
        assert!("Ctrl+WW".parse::<Shortcut>().is_err());
        assert!("Ctrl+A+B".parse::<Shortcut>().is_err());
    }
}
