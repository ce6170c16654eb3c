//! Prompt detection strategy.
//!
//! The detector decides when a router has finished responding: RTX has
//! no structured protocol, so completion is inferred from the shell
//! prompt reappearing as the final line of output.

use regex::bytes::Regex;

/// What the detector concluded from the accumulated output so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSignal {
    /// The response is complete. `prompt_start` is the byte offset of
    /// the prompt line within the inspected buffer.
    Complete { prompt_start: usize },

    /// The device is paginating and waits for a continuation keypress.
    Pagination,

    /// No prompt yet; keep reading.
    Pending,
}

/// Strategy deciding whether accumulated output ends in a shell prompt.
///
/// Implementations must only accept a prompt as the final line of the
/// buffer. Prompt-like text in the middle of a response (for example a
/// config line quoting `>`) must never terminate the read loop.
pub trait PromptDetector: Send + Sync {
    /// Inspect the accumulated, ANSI-stripped output.
    fn inspect(&self, output: &[u8]) -> PromptSignal;

    /// Whether the output currently ends in a secondary credential
    /// prompt. Only consulted during administrator elevation.
    fn auth_prompt(&self, output: &[u8]) -> bool;

    /// Whether the prompt line is the elevated (`#`) form.
    fn is_elevated_prompt(&self, prompt_line: &[u8]) -> bool {
        prompt_line.contains(&b'#')
    }
}

/// Default detector for RTX-class routers.
///
/// Recognizes the bracketed `[hostname] >` / `[hostname] #` prompt and
/// the bare `>` / `#` form shown when no hostname is configured, plus
/// the English and Japanese pagination markers.
pub struct RtxPromptDetector {
    bracketed: Regex,
    bare: Regex,
    pagination: Regex,
    password: Regex,
}

impl RtxPromptDetector {
    pub fn new() -> Self {
        Self {
            bracketed: Regex::new(r"^\[[^\]]+\] ?[>#] ?$").unwrap(),
            bare: Regex::new(r"^[>#] ?$").unwrap(),
            pagination: Regex::new(r"---[ ]?(more|つづく)[ ]?---").unwrap(),
            password: Regex::new(r"[Pp]assword: ?$").unwrap(),
        }
    }

    /// Byte offset where the final line of `output` begins.
    fn final_line_start(output: &[u8]) -> usize {
        memchr::memrchr(b'\n', output).map_or(0, |i| i + 1)
    }
}

impl Default for RtxPromptDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptDetector for RtxPromptDetector {
    fn inspect(&self, output: &[u8]) -> PromptSignal {
        let start = Self::final_line_start(output);
        let line = output[start..].trim_ascii();
        if line.is_empty() {
            return PromptSignal::Pending;
        }

        if self.pagination.is_match(line) {
            return PromptSignal::Pagination;
        }

        if self.bracketed.is_match(line) || self.bare.is_match(line) {
            return PromptSignal::Complete {
                prompt_start: start,
            };
        }

        PromptSignal::Pending
    }

    fn auth_prompt(&self, output: &[u8]) -> bool {
        let start = Self::final_line_start(output);
        self.password.is_match(output[start..].trim_ascii())
    }
}

/// Strip the command echo, pagination markers and trailing prompt from
/// a raw response, yielding the body the caller actually asked for.
pub fn clean_response(raw: &[u8], payload: &str, detector: &dyn PromptDetector) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut lines: Vec<&str> = text.lines().map(|l| l.trim_end_matches('\r')).collect();

    // Drop the echoed command. The echo can carry a prompt prefix, so
    // match on suffix rather than equality.
    if let Some(&first) = lines.first() {
        let trimmed = first.trim();
        if trimmed == payload.trim() || trimmed.ends_with(payload.trim()) {
            lines.remove(0);
        }
    }

    // Drop the trailing prompt line.
    while let Some(&last) = lines.last() {
        let line = last.trim();
        if line.is_empty() {
            lines.pop();
            continue;
        }
        if matches!(
            detector.inspect(line.as_bytes()),
            PromptSignal::Complete { .. }
        ) {
            lines.pop();
        }
        break;
    }

    // Pagination markers appear mid-body when output spanned pages.
    lines.retain(|l| !matches!(detector.inspect(l.as_bytes()), PromptSignal::Pagination));

    let body = lines.join("\n");
    body.trim_matches(['\n', ' ']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracketed_prompt_on_final_line_completes() {
        let detector = RtxPromptDetector::new();
        let output = b"show status\r\nuptime 4 days\r\n[rtx830] > ";
        match detector.inspect(output) {
            PromptSignal::Complete { prompt_start } => {
                assert_eq!(&output[prompt_start..], b"[rtx830] > ");
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn bare_prompt_completes() {
        let detector = RtxPromptDetector::new();
        assert!(matches!(
            detector.inspect(b"output\r\n# "),
            PromptSignal::Complete { .. }
        ));
        assert!(matches!(
            detector.inspect(b"output\r\n> "),
            PromptSignal::Complete { .. }
        ));
    }

    #[test]
    fn prompt_like_text_mid_line_is_pending() {
        let detector = RtxPromptDetector::new();
        assert_eq!(
            detector.inspect(b"ip filter 200030 pass * * established > next"),
            PromptSignal::Pending
        );
        assert_eq!(
            detector.inspect(b"[rtx830] > still printing"),
            PromptSignal::Pending
        );
    }

    #[test]
    fn prompt_in_the_middle_of_the_buffer_is_pending() {
        let detector = RtxPromptDetector::new();
        let output = b"[rtx830] > \r\nstill going";
        assert_eq!(detector.inspect(output), PromptSignal::Pending);
    }

    #[test]
    fn pagination_markers_are_recognized() {
        let detector = RtxPromptDetector::new();
        assert_eq!(
            detector.inspect(b"line\r\n--- more ---"),
            PromptSignal::Pagination
        );
        assert_eq!(
            detector.inspect("line\r\n---つづく---".as_bytes()),
            PromptSignal::Pagination
        );
    }

    #[test]
    fn password_prompt_is_detected_only_on_final_line() {
        let detector = RtxPromptDetector::new();
        assert!(detector.auth_prompt(b"administrator\r\nPassword: "));
        assert!(!detector.auth_prompt(b"Password: \r\nsomething else"));
    }

    #[test]
    fn clean_response_strips_echo_pagination_and_prompt() {
        let detector = RtxPromptDetector::new();
        let raw = b"show config\r\nline 1\r\n--- more ---\r\nline 2\r\n[rtx830] # ";
        let body = clean_response(raw, "show config", &detector);
        assert_eq!(body, "line 1\nline 2");
    }

    #[test]
    fn clean_response_keeps_empty_body_empty() {
        let detector = RtxPromptDetector::new();
        let raw = b"dhcp scope 1 192.168.0.0/24\r\n[rtx830] # ";
        let body = clean_response(raw, "dhcp scope 1 192.168.0.0/24", &detector);
        assert_eq!(body, "");
    }
}
