/// Sanitize extracted text before passing downstream.
/// Strips control and replacement characters, trims lines, drops blank ones.
/// Medical symbols (µ, ±, ≥, °) pass through untouched.
pub fn sanitize_extracted_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| match c {
            '\n' | '\t' => true,
            '\u{FFFD}' | '\u{FEFF}' => false,
            c => !c.is_control(),
        })
        .collect::<String>()
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
