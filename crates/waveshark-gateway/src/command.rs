//! Radio command grammar and the gateway's replies
//!
//! Radio users address the gateway by its device name:
//!
//! ```text
//! <name> SEND <message>
//! ```
//!
//! The device repeats its own name inside the command it prints, so the
//! message is recovered by dropping the `SEND` token and one token per word
//! of the device name from the frame body. A device name that the radio
//! normalizes differently (punctuation, spacing) shifts this by a token.

use crate::frame::RadioFrame;

/// Echo lines the device prints after a reply to a radio user
pub const REPLY_ECHO_LINES: usize = 1;

/// Echo lines the device prints after an announcement
pub const ANNOUNCEMENT_ECHO_LINES: usize = 2;

/// Echo lines the device prints after the setup command
pub const SETUP_ECHO_LINES: usize = 3;

/// Echo lines consumed after relaying a network message to the radio
pub const NETWORK_ECHO_LINES: usize = 0;

/// What a radio frame asks the gateway to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `<name> SEND <post>`; an empty post asks the sender for content
    Send {
        /// Message to publish
        post: String,
    },
    /// Repeat-all mode: republish the whole frame body
    Repeat {
        /// Frame body
        body: String,
    },
    /// Addressed to the gateway but not a known command
    Unrecognized,
    /// Not for the gateway
    NotAddressed,
}

/// Classify a frame received by the device named `device_name`
///
/// `line` is the raw line the frame was parsed from; the SEND trigger is
/// matched against the whole line.
pub fn classify(line: &str, frame: &RadioFrame, device_name: &str, repeat_all: bool) -> Command {
    let trigger = format!("{} send", device_name.to_lowercase());
    if line.to_lowercase().contains(&trigger) {
        return Command::Send {
            post: extract_post(&frame.body, device_name),
        };
    }

    if repeat_all {
        return Command::Repeat {
            body: frame.body.clone(),
        };
    }

    if mentions_name(&frame.body, device_name) {
        return Command::Unrecognized;
    }

    Command::NotAddressed
}

/// Strip `SEND` and the device name's words from the front of `body`
pub fn extract_post(body: &str, device_name: &str) -> String {
    let skip = 1 + device_name.split_whitespace().count();
    body.split_whitespace()
        .skip(skip)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether the name's words appear as consecutive tokens of `body`
fn mentions_name(body: &str, device_name: &str) -> bool {
    let name: Vec<String> = device_name
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();
    if name.is_empty() {
        return false;
    }

    let tokens: Vec<String> = body.split_whitespace().map(str::to_lowercase).collect();
    tokens.windows(name.len()).any(|window| window == name.as_slice())
}

/// Reply after a post was published
pub fn ack_text(sender: &str) -> String {
    format!("{}, your message has been sent.", sender)
}

/// Reply to a SEND without content
pub fn prompt_text(sender: &str) -> String {
    format!("{}, what is your message?", sender)
}

/// Reply to an unrecognized command
pub fn usage_text(sender: &str, device_name: &str) -> String {
    format!(
        "{sender}, I don't understand what you mean. Say {name} SEND and your message to send \
         a message to my area. For example, {name} SEND Hello World.",
        sender = sender,
        name = device_name
    )
}

/// Periodic presence announcement
pub fn announcement_text(device_name: &str) -> String {
    format!(
        "Hello from the {name} Internet Gateway! Say {name} SEND <message> to send a message \
         to my area.",
        name = device_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(line: &str) -> RadioFrame {
        RadioFrame::parse(line).unwrap()
    }

    #[test]
    fn test_extract_post_multi_word_name() {
        assert_eq!(
            extract_post("SEND Base Camp hello there", "Base Camp"),
            "hello there"
        );
    }

    #[test]
    fn test_extract_post_collapses_whitespace() {
        assert_eq!(extract_post("SEND Ridge   a  b ", "Ridge"), "a b");
        assert_eq!(extract_post("SEND Ridge", "Ridge"), "");
        assert_eq!(extract_post("", "Ridge"), "");
    }

    #[test]
    fn test_send_is_case_insensitive() {
        let line = "[RSS: -40] [SNR: 9] <Alice> ridge send hi all";
        let command = classify(line, &frame(line), "Ridge", false);
        assert_eq!(
            command,
            Command::Send {
                post: "hi all".to_string()
            }
        );
    }

    #[test]
    fn test_send_matches_whole_line() {
        let line = "[RSS: -40] [SNR: 9] <Alice> Ridge SEND";
        assert_eq!(
            classify(line, &frame(line), "Ridge", false),
            Command::Send {
                post: String::new()
            }
        );
    }

    #[test]
    fn test_send_wins_over_repeat_all() {
        let line = "[RSS: -40] [SNR: 9] <Alice> Ridge SEND x y";
        assert!(matches!(
            classify(line, &frame(line), "Ridge", true),
            Command::Send { .. }
        ));
    }

    #[test]
    fn test_repeat_all_takes_any_frame() {
        let line = "[RSS: -40] [SNR: 9] <Alice> good morning";
        assert_eq!(
            classify(line, &frame(line), "Ridge", true),
            Command::Repeat {
                body: "good morning".to_string()
            }
        );
    }

    #[test]
    fn test_unrecognized_when_addressed() {
        let line = "[RSS: -40] [SNR: 9] <Alice> base camp status please";
        assert_eq!(
            classify(line, &frame(line), "Base Camp", false),
            Command::Unrecognized
        );
    }

    #[test]
    fn test_not_addressed() {
        let line = "[RSS: -40] [SNR: 9] <Alice> anyone on frequency";
        assert_eq!(
            classify(line, &frame(line), "Ridge", false),
            Command::NotAddressed
        );

        let line = "[RSS: -40] [SNR: 9] <Alice> Ridgeline is clear";
        assert_eq!(
            classify(line, &frame(line), "Ridge", false),
            Command::NotAddressed
        );
    }

    #[test]
    fn test_reply_texts() {
        assert_eq!(ack_text("Alice"), "Alice, your message has been sent.");
        assert_eq!(prompt_text("Alice"), "Alice, what is your message?");
        assert_eq!(
            usage_text("Alice", "Ridge"),
            "Alice, I don't understand what you mean. Say Ridge SEND and your message to \
             send a message to my area. For example, Ridge SEND Hello World."
        );
        assert_eq!(
            announcement_text("Ridge"),
            "Hello from the Ridge Internet Gateway! Say Ridge SEND <message> to send a \
             message to my area."
        );
    }
}
