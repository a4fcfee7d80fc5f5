/// Entities that upstream form encoding is known to leave in command text.
const ENTITIES: &[(&str, &str)] = &[
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#34;", "\""),
    ("&#39;", "'"),
    ("&apos;", "'"),
    ("&nbsp;", " "),
];

/// Decode HTML entities left in a command by upstream encoding.
///
/// `&amp;` is decoded last so that `&amp;lt;` becomes the literal `&lt;`
/// rather than `<`.
pub fn clean_html_entities(command: &str) -> String {
    if !command.contains('&') {
        return command.to_string();
    }

    let mut cleaned = command.to_string();
    for (entity, replacement) in ENTITIES {
        cleaned = cleaned.replace(entity, replacement);
    }
    cleaned.replace("&amp;", "&")
}
