//! Syntax highlighting for pattern source.
//!
//! The highlighter escapes HTML metacharacters and then masks tokens in a
//! fixed order: comments, quoted strings, numeric literals and finally known
//! function names. Each masked token is replaced by a placeholder so later
//! passes never see its contents, and all placeholders are expanded into
//! `<span class="hl-…">` elements at the end.
//!
//! The output is meant to be inserted as trusted markup. Only ever call
//! [`highlight`] on raw source text, never on its own output.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Function names that receive the `hl-function` class.
pub const KNOWN_FUNCTIONS: &[&str] = &[
    "note", "n", "s", "sound", "stack", "cat", "seq", "silence", "hush", "setcps", "setcpm",
    "play", "gain", "fast", "slow", "rev", "jux", "every", "sometimes", "often", "rarely",
    "degradeBy", "struct", "euclid", "scale", "chord", "arp", "bank", "vowel", "crush",
    "coarse", "shape", "lpf", "hpf", "cutoff", "resonance", "room", "size", "delay", "pan",
    "speed", "attack", "decay", "sustain", "release", "legato", "orbit", "sine", "saw",
    "square", "tri", "rand", "perlin", "range", "segment", "ply", "off", "superimpose",
    "iter", "palindrome", "chunk", "early", "late", "mask",
];

const PLACEHOLDER_OPEN: char = '\u{E000}';
const PLACEHOLDER_CLOSE: char = '\u{E001}';

static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/|//[^\n]*").expect("comment pattern"));

static STRING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:[^"\\\n]|\\.)*"|'(?:[^'\\\n]|\\.)*'|`(?:[^`\\]|\\.)*`"#)
        .expect("string pattern")
});

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("number pattern"));

static FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    let names = KNOWN_FUNCTIONS.join("|");
    Regex::new(&format!(r"\b(?:{names})\b")).expect("function pattern")
});

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("{PLACEHOLDER_OPEN}([A-J]+){PLACEHOLDER_CLOSE}"))
        .expect("placeholder pattern")
});

/// Token classes, in masking order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    Comment,
    String,
    Number,
    Function,
}

impl TokenClass {
    pub fn css_class(self) -> &'static str {
        match self {
            TokenClass::Comment => "hl-comment",
            TokenClass::String => "hl-string",
            TokenClass::Number => "hl-number",
            TokenClass::Function => "hl-function",
        }
    }
}

/// Renders pattern source as highlighted HTML.
pub fn highlight(source: &str) -> String {
    let mut masker = Masker::default();
    let text = escape_html(source);
    let text = masker.mask(&text, &COMMENT, TokenClass::Comment);
    let text = masker.mask(&text, &STRING, TokenClass::String);
    let text = masker.mask(&text, &NUMBER, TokenClass::Number);
    let text = masker.mask(&text, &FUNCTION, TokenClass::Function);
    masker.restore(&text)
}

/// Escapes `&`, `<` and `>`. Placeholder delimiters in the input are
/// replaced so user text can never forge a token.
pub fn escape_html(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    for ch in source.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            PLACEHOLDER_OPEN | PLACEHOLDER_CLOSE => out.push(char::REPLACEMENT_CHARACTER),
            other => out.push(other),
        }
    }
    out
}

#[derive(Debug, Default)]
struct Masker {
    tokens: Vec<(TokenClass, String)>,
}

impl Masker {
    fn mask(&mut self, text: &str, pattern: &Regex, class: TokenClass) -> String {
        pattern
            .replace_all(text, |caps: &Captures<'_>| {
                let index = self.tokens.len();
                self.tokens.push((class, caps[0].to_string()));
                placeholder(index)
            })
            .into_owned()
    }

    // A token can contain placeholders masked by an earlier pass (a block
    // comment inside a template string), so restoration recurses.
    fn restore(&self, text: &str) -> String {
        PLACEHOLDER
            .replace_all(text, |caps: &Captures<'_>| {
                match decode_index(&caps[1]).and_then(|index| self.tokens.get(index)) {
                    Some((class, token)) => format!(
                        "<span class=\"{}\">{}</span>",
                        class.css_class(),
                        self.restore(token)
                    ),
                    None => String::new(),
                }
            })
            .into_owned()
    }
}

// Indices are spelled with the letters A-J so the numeric pass cannot match
// inside a placeholder.
fn placeholder(index: usize) -> String {
    let digits: String = index
        .to_string()
        .bytes()
        .map(|digit| char::from(b'A' + (digit - b'0')))
        .collect();
    format!("{PLACEHOLDER_OPEN}{digits}{PLACEHOLDER_CLOSE}")
}

fn decode_index(encoded: &str) -> Option<usize> {
    encoded.bytes().try_fold(0usize, |acc, letter| {
        let digit = letter.checked_sub(b'A').filter(|d| *d < 10)?;
        acc.checked_mul(10)?.checked_add(usize::from(digit))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn strip_spans(html: &str) -> String {
        let open = Regex::new(r#"<span class="hl-[a-z]+">"#).unwrap();
        open.replace_all(html, "").replace("</span>", "")
    }

    #[test]
    fn highlights_function_string_and_comment() {
        let html = highlight("note('c3') // play middle C");

        assert!(html.contains(r#"<span class="hl-function">note</span>"#));
        assert!(html.contains(r#"<span class="hl-string">'c3'</span>"#));
        assert!(html.contains(r#"<span class="hl-comment">// play middle C</span>"#));
        assert!(!html.contains("hl-number"));
    }

    #[test]
    fn comments_hide_their_contents_from_later_passes() {
        let html = highlight("// note 42 'x'");
        assert_eq!(
            html,
            r#"<span class="hl-comment">// note 42 'x'</span>"#
        );
    }

    #[test]
    fn numbers_inside_identifiers_are_left_alone() {
        let html = highlight("c3 + 12.5");
        assert_eq!(html, r#"c3 + <span class="hl-number">12.5</span>"#);
    }

    #[test]
    fn many_tokens_use_distinct_placeholders() {
        let source = (0..25).map(|i| format!("gain({i})")).collect::<Vec<_>>().join(" ");
        let html = highlight(&source);
        assert!(html.contains(r#"<span class="hl-number">24</span>"#));
        assert_eq!(html.matches("hl-function").count(), 25);
        assert!(!html.contains(PLACEHOLDER_OPEN));
    }

    #[test]
    fn escapes_markup_in_source() {
        let html = highlight("s(\"<b>\") && x > 1");
        assert!(html.contains(r#"<span class="hl-string">"&lt;b&gt;"</span>"#));
        assert!(html.contains("&amp;&amp; x &gt; "));
    }

    #[test]
    fn forged_placeholders_are_neutralised() {
        let forged = format!("{PLACEHOLDER_OPEN}A{PLACEHOLDER_CLOSE}");
        let html = highlight(&forged);
        assert!(!html.contains("<span"));
    }

    #[test]
    fn block_comment_inside_template_string_is_restored() {
        let html = highlight("`a /* b */ c`");
        assert!(!html.contains(PLACEHOLDER_OPEN));
        assert!(html.contains("/* b */"));
    }

    #[test]
    fn placeholder_indices_round_trip() {
        for index in [0, 7, 10, 99, 1234] {
            let encoded = placeholder(index);
            let inner = encoded.trim_matches(|c| c == PLACEHOLDER_OPEN || c == PLACEHOLDER_CLOSE);
            assert!(!inner.bytes().any(|b| b.is_ascii_digit()));
            assert_eq!(decode_index(inner), Some(index));
        }
    }

    proptest! {
        #[test]
        fn plain_text_is_only_escaped(source in "[A-Z &<>!?.,;:()=+*-]{0,64}") {
            prop_assert_eq!(highlight(&source), escape_html(&source));
        }

        #[test]
        fn never_leaks_raw_angle_brackets(source in "\\PC{0,80}") {
            let stripped = strip_spans(&highlight(&source));
            prop_assert!(!stripped.contains('<'));
            prop_assert!(!stripped.contains('>'));
        }
    }
}
