/// Expand `${VAR}` and `${VAR:-fallback}` placeholders in raw config text.
///
/// A placeholder whose variable is unset and has no fallback is kept verbatim
/// so the parse error (if any) points at the original text.
pub fn substitute_env(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated: emit the remainder untouched.
            out.push_str(&rest[start..]);
            return out;
        };
        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (name.is_empty(), lookup(name), fallback) {
            (false, Some(value), _) => out.push_str(&value),
            (false, None, Some(fallback)) => out.push_str(fallback),
            _ => {
                out.push_str("${");
                out.push_str(body);
                out.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "BOTBOX_ROOT" => Some("/srv/botbox".into()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn expands_set_variable() {
        assert_eq!(
            expand_with("data_root = \"${BOTBOX_ROOT}/data\"", lookup),
            "data_root = \"/srv/botbox/data\""
        );
    }

    #[test]
    fn uses_fallback_when_unset() {
        assert_eq!(expand_with("${NOPE:-/tmp}", lookup), "/tmp");
        assert_eq!(expand_with("${BOTBOX_ROOT:-/tmp}", lookup), "/srv/botbox");
    }

    #[test]
    fn set_but_empty_wins_over_fallback() {
        assert_eq!(expand_with("[${EMPTY:-x}]", lookup), "[]");
    }

    #[test]
    fn keeps_unknown_and_malformed() {
        assert_eq!(expand_with("${NOPE}", lookup), "${NOPE}");
        assert_eq!(expand_with("${}", lookup), "${}");
        assert_eq!(expand_with("tail ${BOTBOX_ROOT", lookup), "tail ${BOTBOX_ROOT");
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(substitute_env("no placeholders $HOME"), "no placeholders $HOME");
    }
}
