//! Label helpers shared by templates and workers.
//!
//! Label expressions are deliberately small:
//! - `a || b` disjunction, `a && b` conjunction (`&&` binds tighter)
//! - `!a` negation of a single atom
//! - `*` inside an atom matches any substring (including empty)

/// Split a whitespace-separated label string, dropping empties and duplicates.
pub fn parse_labels(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for label in raw.split_whitespace() {
        if !out.iter().any(|l| l == label) {
            out.push(label.to_string());
        }
    }
    out
}

/// Return true if `value` matches the glob `pattern`.
pub fn glob_matches(value: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return value == pattern;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts.first().copied().unwrap_or("");
    let last = parts.last().copied().unwrap_or("");

    if !value.starts_with(first) {
        return false;
    }
    let mut idx = first.len();

    // Middle parts must appear in order after the prefix.
    for part in &parts[1..parts.len().saturating_sub(1)] {
        if part.is_empty() {
            continue;
        }
        match value[idx..].find(part) {
            Some(pos) => idx += pos + part.len(),
            None => return false,
        }
    }

    // Suffix must not overlap what was already consumed.
    value.len() >= idx + last.len() && value.ends_with(last)
}

fn atom_matches(atom: &str, labels: &[String]) -> bool {
    let atom = atom.trim();
    if let Some(negated) = atom.strip_prefix('!') {
        return !atom_matches(negated, labels);
    }
    if atom.is_empty() {
        return false;
    }
    labels.iter().any(|l| glob_matches(l, atom))
}

/// Evaluate a label expression against a label set.
pub fn expression_matches(expression: &str, labels: &[String]) -> bool {
    expression.split("||").any(|clause| {
        let atoms: Vec<&str> = clause.split("&&").collect();
        !clause.trim().is_empty() && atoms.iter().all(|atom| atom_matches(atom, labels))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(raw: &str) -> Vec<String> {
        parse_labels(raw)
    }

    #[test]
    fn parse_drops_duplicates_and_blanks() {
        assert_eq!(labels("  linux  docker linux "), vec!["linux", "docker"]);
        assert!(labels("   ").is_empty());
    }

    #[test]
    fn glob_handles_prefix_suffix_and_middle() {
        assert!(glob_matches("linux-x64", "linux-*"));
        assert!(glob_matches("linux-x64", "*x64"));
        assert!(glob_matches("linux-arm-x64", "linux*arm*"));
        assert!(!glob_matches("linux", "linux-*"));
        assert!(!glob_matches("ab", "a*b*b"));
        assert!(glob_matches("anything", "*"));
    }

    #[test]
    fn expressions_combine_atoms() {
        let set = labels("linux docker gpu-l4");
        assert!(expression_matches("linux && docker", &set));
        assert!(expression_matches("windows || gpu-*", &set));
        assert!(expression_matches("linux && !windows", &set));
        assert!(!expression_matches("linux && windows", &set));
        assert!(!expression_matches("", &set));
    }
}
