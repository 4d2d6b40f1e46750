use crate::model::SubstitutionMap;

/// Lines in `current` that `previous` does not know about, per weekday.
///
/// Lines are compared by string equality against the whole previous list of
/// the same day, not by position. Days without new lines are left out, so an
/// empty result means nothing changed.
pub fn diff(previous: &SubstitutionMap, current: &SubstitutionMap) -> SubstitutionMap {
    let mut result = SubstitutionMap::new();

    for (day, lines) in current {
        let new_lines: Vec<String> = match previous.get(day) {
            None => lines.clone(),
            Some(known) => lines
                .iter()
                .filter(|line| !known.contains(line))
                .cloned()
                .collect(),
        };
        if !new_lines.is_empty() {
            result.insert(*day, new_lines);
        }
    }

    result
}
