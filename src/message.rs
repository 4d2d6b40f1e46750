use std::fmt::Write;

use crate::model::SubstitutionMap;

pub const NO_NEW_SUBSTITUTIONS: &str = "You have no new substitutions.";

/// Render new substitution lines as a text message: a `Day:` header per
/// weekday followed by one line per entry.
pub fn format_message(diff: &SubstitutionMap) -> String {
    if diff.is_empty() {
        return NO_NEW_SUBSTITUTIONS.to_string();
    }

    let mut text = String::new();
    for (day, lines) in diff {
        let _ = writeln!(text, "{day}:");
        for line in lines {
            let _ = writeln!(text, "{line}");
        }
    }
    text
}
