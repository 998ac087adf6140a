/// Predicate over observed target URLs.
///
/// The same matching rules the IDE applies when attaching to an existing tab:
/// case-insensitive, `*` matches any run of characters, a trailing slash on
/// either side is ignored, and a pattern without a scheme matches any scheme.
/// Stateless; one filter is reused across every candidate of a launch.
#[derive(Debug, Clone)]
pub struct TargetFilter {
    pattern: Option<String>,
}

impl TargetFilter {
    /// `None` (no URL requested) matches every candidate.
    pub fn new(pattern: Option<&str>) -> Self {
        Self {
            pattern: pattern
                .map(|p| normalize(p))
                .filter(|p| !p.is_empty()),
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        let Some(pattern) = &self.pattern else {
            return true;
        };

        let mut url = normalize(url);
        if !pattern.contains("://") {
            // Scheme-less pattern: compare against the URL without its scheme.
            if let Some((_, rest)) = url.split_once("://") {
                url = rest.to_string();
            }
        }

        wildcard_match(pattern, &url)
    }
}

fn normalize(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Classic two-pointer glob match; only `*` is special.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            // Backtrack: let the last `*` consume one more character.
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
