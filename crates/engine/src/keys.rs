//! Symbolic key tokens for terminal input
//!
//! `$ENTER$`, `$CTRL_C$` and friends are translated to the bytes a terminal
//! would send. Tokens may sit inside ordinary text; unknown tokens pass
//! through untouched.

const KEY_TOKENS: &[(&str, &str)] = &[
    ("ENTER", "\r"),
    ("RETURN", "\r"),
    ("TAB", "\t"),
    ("ESCAPE", "\x1b"),
    ("BACKSPACE", "\x7f"),
    ("DELETE", "\x1b[3~"),
    ("SPACE", " "),
    ("ARROW_UP", "\x1b[A"),
    ("ARROW_DOWN", "\x1b[B"),
    ("ARROW_RIGHT", "\x1b[C"),
    ("ARROW_LEFT", "\x1b[D"),
    ("HOME", "\x1b[H"),
    ("END", "\x1b[F"),
    ("CTRL_C", "\x03"),
    ("CTRL_D", "\x04"),
    ("CTRL_L", "\x0c"),
    ("CTRL_Z", "\x1a"),
];

fn lookup(name: &str) -> Option<&'static str> {
    KEY_TOKENS
        .iter()
        .find(|(token, _)| token.eq_ignore_ascii_case(name))
        .map(|(_, bytes)| *bytes)
}

/// Translate every `$TOKEN$` in `input` to its control sequence
pub fn translate_keys(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find('$') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        match after.find('$') {
            Some(close) => match lookup(&after[..close]) {
                Some(bytes) => {
                    out.push_str(bytes);
                    rest = &after[close + 1..];
                }
                None => {
                    // Not a key; the closing `$` may open the next token
                    out.push('$');
                    rest = after;
                }
            },
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Translate and concatenate a sequence of key strings
pub fn translate_all<S: AsRef<str>>(keys: &[S]) -> String {
    keys.iter().map(|k| translate_keys(k.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_token() {
        assert_eq!(translate_keys("$ENTER$"), "\r");
        assert_eq!(translate_keys("ls -la$ENTER$"), "ls -la\r");
    }

    #[test]
    fn test_tokens_are_case_insensitive() {
        assert_eq!(translate_keys("$ctrl_c$"), "\x03");
    }

    #[test]
    fn test_unknown_tokens_pass_through() {
        assert_eq!(translate_keys("echo $HOME_DIR$"), "echo $HOME_DIR$");
        assert_eq!(translate_keys("cost: $5"), "cost: $5");
        assert_eq!(translate_keys("echo $PATH $ENTER$"), "echo $PATH \r");
    }

    #[test]
    fn test_translate_all_concatenates() {
        let keys = ["print(1)", "$ENTER$", "$CTRL_D$"];
        assert_eq!(translate_all(&keys), "print(1)\r\x04");
    }
}
