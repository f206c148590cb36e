//! Structured blocks pulled out of finalized assistant content.

use std::sync::LazyLock;

use regex::Regex;

use parley_core::{Artifact, ArtifactKind};

static FENCED_BLOCK: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*```[ \t]*([A-Za-z0-9_+#.-]*)[^\n]*\n(.*?)^[ \t]*```").ok()
});

/// Fenced code blocks in `content`, in order of appearance. An unterminated
/// fence is not an artifact.
pub fn detect(content: &str) -> Vec<Artifact> {
    let Some(re) = FENCED_BLOCK.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(content)
        .map(|caps| {
            let language = caps
                .get(1)
                .map(|m| m.as_str())
                .filter(|lang| !lang.is_empty())
                .map(str::to_string);
            let body = caps.get(2).map_or("", |m| m.as_str());
            Artifact {
                kind: ArtifactKind::Code,
                language,
                content: body.strip_suffix('\n').unwrap_or(body).to_string(),
            }
        })
        .collect()
}
