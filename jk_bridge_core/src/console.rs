use std::sync::LazyLock;

use event_loop::{try_get, Handled, Is, Message, MessageHandler};
use regex::Regex;

use crate::state::BridgeState;

pub mod classify;
pub mod tailer;

use classify::{classify, LogEvent};

static COLOR_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\^[0-9]").expect("valid color regex"));

/// Removes `^N` color escapes. Repeats until nothing is left to remove so
/// sequences like `^^11` don't leave a fresh escape behind.
#[must_use]
pub fn strip_colors(text: &str) -> String {
    let mut current = text.to_owned();
    loop {
        let stripped = COLOR_CODE.replace_all(&current, "");
        if stripped.len() == current.len() {
            return current;
        }
        current = stripped.into_owned();
    }
}

// Messages *************************

/// One complete line read from the server log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLogLine(pub String);
impl<S> Message<S> for RawLogLine {}

// Handlers *************************

/// Classifies each raw line in file order.
#[derive(Debug, Default)]
pub struct LogParser;

impl<IM, OM> MessageHandler<BridgeState, IM, OM> for LogParser
where
    IM: Is<RawLogLine>,
    OM: Is<LogEvent>,
{
    fn handle_message(&mut self, state: &BridgeState, message: &IM) -> Option<Handled<OM>> {
        let RawLogLine(line) = try_get(message)?;
        match classify(line, &state.settings.markers) {
            Some(event) => {
                tracing::debug!("{event:?}");
                Handled::single(event)
            }
            None => {
                tracing::trace!("Unclassified line: {line}");
                Handled::none()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        assert_eq!(strip_colors("^1Padawan^7Name"), "PadawanName");
        assert_eq!(strip_colors("no colors"), "no colors");
        assert_eq!(strip_colors("^^11nested"), "nested");
    }

    #[test]
    fn stripping_is_idempotent() {
        for sample in ["^1Padawan^7Name", "^^11x", "^a^", "^5^^77", "plain"] {
            let once = strip_colors(sample);
            assert_eq!(strip_colors(&once), once, "{sample}");
        }
    }
}
