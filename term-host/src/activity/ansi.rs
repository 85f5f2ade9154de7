// Escape-sequence stripping for prompt matching over terminal output

/// Remove terminal escape sequences and stray control characters.
///
/// Handles CSI (`ESC [ ... final`), OSC (`ESC ] ... BEL` or `ESC ] ... ESC \`),
/// DCS/APC/PM strings terminated by ST, and two-byte escapes (`ESC 7`, `ESC M`).
/// Newlines and tabs are kept; carriage returns and other C0 controls are dropped.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.next() {
                Some('[') => {
                    // Parameter and intermediate bytes, then one final byte
                    while let Some(&next) = chars.peek() {
                        chars.next();
                        if ('\x40'..='\x7e').contains(&next) {
                            break;
                        }
                    }
                }
                Some(']') | Some('P') | Some('_') | Some('^') => {
                    while let Some(next) = chars.next() {
                        if next == '\x07' {
                            break;
                        }
                        if next == '\x1b' {
                            if chars.peek() == Some(&'\\') {
                                chars.next();
                            }
                            break;
                        }
                    }
                }
                // Character set selection takes one more byte
                Some('(') | Some(')') | Some('*') | Some('+') => {
                    chars.next();
                }
                Some(_) | None => {}
            },
            '\n' | '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_unchanged() {
        assert_eq!(strip_ansi("hello world"), "hello world");
    }

    #[test]
    fn strips_sgr_and_cursor_movement() {
        assert_eq!(strip_ansi("\x1b[1;31merror\x1b[0m"), "error");
        assert_eq!(strip_ansi("\x1b[2A\x1b[?25lhello"), "hello");
    }

    #[test]
    fn strips_osc_with_either_terminator() {
        assert_eq!(strip_ansi("\x1b]0;title\x07rest"), "rest");
        assert_eq!(strip_ansi("\x1b]8;;http://x\x1b\\link"), "link");
    }

    #[test]
    fn drops_carriage_returns_keeps_newlines() {
        assert_eq!(strip_ansi("a\r\nb\tc\x08"), "a\nb\tc");
    }

    #[test]
    fn keeps_multibyte_text() {
        assert_eq!(strip_ansi("\x1b[32m✔ done ⛔\x1b[0m"), "✔ done ⛔");
    }

    #[test]
    fn truncated_escape_is_dropped() {
        assert_eq!(strip_ansi("text\x1b"), "text");
        assert_eq!(strip_ansi("text\x1b[3"), "text");
    }

    #[test]
    fn charset_selection() {
        assert_eq!(strip_ansi("\x1b(Bplain"), "plain");
    }
}
