//! Pure decision function for sorting broker errors into recoverable vs.
//! terminal, grounded on the AMQP 0-9-1 reply-code table. Recoverable errors
//! drive the reconnect loop in [`crate::connection`]; terminal errors
//! propagate to the caller and the event bus unchanged.

/// AMQP soft/hard errors that reconnecting cannot cure.
const TERMINAL_CODES: &[u16] = &[
    402, // INVALID_PATH
    403, // ACCESS_REFUSED
    404, // NOT_FOUND
    406, // PRECONDITION_FAILED
    501, // FRAME_ERROR
    502, // SYNTAX_ERROR
    503, // COMMAND_INVALID
    504, // CHANNEL_ERROR
    505, // UNEXPECTED_FRAME
    530, // NOT_ALLOWED
    541, // INTERNAL_ERROR
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Terminal,
    Recoverable,
}

/// Classifies an error from its optional AMQP reply code and message text.
///
/// `reply_code` is `None` for transport-level failures (DNS, TCP reset,
/// connect timeout) that never reach the protocol layer — those are always
/// recoverable.
pub fn classify(reply_code: Option<u16>, message: &str) -> ErrorClass {
    if let Some(code) = reply_code {
        if TERMINAL_CODES.contains(&code) {
            return ErrorClass::Terminal;
        }
    }

    if message.contains("ACCESS_REFUSED") || message.to_ascii_lowercase().contains("authentication")
    {
        return ErrorClass::Terminal;
    }

    ErrorClass::Recoverable
}

/// Extracts a best-effort reply code and message from a `lapin::Error` by
/// inspecting its `Display` output, since `lapin::Error` does not expose a
/// structured reply code for every variant it wraps.
pub fn classify_lapin_error(err: &lapin::Error) -> ErrorClass {
    let message = err.to_string();
    let reply_code = extract_reply_code(&message);
    classify(reply_code, &message)
}

fn extract_reply_code(message: &str) -> Option<u16> {
    // lapin/amq-protocol render AMQP exceptions as e.g. "...REPLY_CODE (CODE) ...";
    // scan for the first purely-numeric token as a conservative heuristic.
    message
        .split(|c: char| !c.is_ascii_digit())
        .find(|tok| tok.len() == 3)
        .and_then(|tok| tok.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_codes_are_terminal() {
        for code in TERMINAL_CODES {
            assert_eq!(classify(Some(*code), "boom"), ErrorClass::Terminal);
        }
    }

    #[test]
    fn access_refused_message_is_terminal_without_a_code() {
        assert_eq!(
            classify(None, "ACCESS_REFUSED - login was refused"),
            ErrorClass::Terminal
        );
    }

    #[test]
    fn authentication_message_is_terminal_case_insensitive() {
        assert_eq!(
            classify(None, "Authentication failed for user"),
            ErrorClass::Terminal
        );
    }

    #[test]
    fn connection_forced_is_recoverable() {
        assert_eq!(classify(Some(320), "CONNECTION_FORCED"), ErrorClass::Recoverable);
    }

    #[test]
    fn unclassified_is_recoverable() {
        assert_eq!(classify(None, "connection reset by peer"), ErrorClass::Recoverable);
    }
}
