//! Shell-safe argument quoting for template interpolation.
//!
//! `Engine::exec` quotes every interpolated value; `Engine::raw` skips this
//! module entirely and trusts the caller.

/// Quote a single value for POSIX shell interpolation.
pub fn quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

/// Quote a sequence of values and join them with spaces, the representation
/// used when an array is interpolated into a template fragment.
pub fn quote_all<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| quote(v.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Join a sequence of values with spaces, unquoted — the `Raw` counterpart
/// of `quote_all` for array interpolation when shell quoting is disabled.
pub fn join_raw<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| v.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a shell command line into argv, used when the shell policy is
/// "disabled" and the first template fragment must be parsed into argv[0]
/// plus arguments.
pub fn split(command: &str) -> Result<Vec<String>, shell_words::ParseError> {
    shell_words::split(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_metacharacters() {
        let q = quote("hello; rm -rf /");
        assert_eq!(q, "'hello; rm -rf /'");
    }

    #[test]
    fn quotes_plain_word_without_wrapping() {
        assert_eq!(quote("hello"), "hello");
    }

    #[test]
    fn quote_all_joins_with_spaces() {
        assert_eq!(quote_all(["a", "b c", "d"]), "a 'b c' d");
    }

    #[test]
    fn split_parses_quoted_argv() {
        let argv = split("echo 'hello world' foo").unwrap();
        assert_eq!(argv, vec!["echo", "hello world", "foo"]);
    }

    #[test]
    fn join_raw_does_not_quote() {
        assert_eq!(join_raw(["a", "b c", "d"]), "a b c d");
    }
}
