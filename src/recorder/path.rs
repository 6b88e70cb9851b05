use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Datelike, Timelike, Utc};

/// Resolves segment file paths from a template. Recognized tokens:
/// `%path` (recording name), `%Y` `%m` `%d` `%H` `%M` `%S` and `%f`
/// (microseconds). Unknown tokens pass through untouched.
#[derive(Debug, Clone)]
pub struct PathFormatter {
    template: String,
}

impl PathFormatter {
    pub fn new(template: &str) -> Result<Self> {
        if template.trim().is_empty() {
            anyhow::bail!("path template cannot be empty");
        }
        Ok(Self {
            template: template.to_string(),
        })
    }

    pub fn resolve(&self, path_name: &str, now: DateTime<Utc>) -> PathBuf {
        let mut out = String::with_capacity(self.template.len() + path_name.len());
        let mut chars = self.template.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            // %path is the only multi-character token.
            let mut lookahead = chars.clone();
            if lookahead.by_ref().take(4).collect::<String>() == "path" {
                out.push_str(path_name);
                for _ in 0..4 {
                    chars.next();
                }
                continue;
            }
            match chars.next() {
                Some('Y') => out.push_str(&format!("{:04}", now.year())),
                Some('m') => out.push_str(&format!("{:02}", now.month())),
                Some('d') => out.push_str(&format!("{:02}", now.day())),
                Some('H') => out.push_str(&format!("{:02}", now.hour())),
                Some('M') => out.push_str(&format!("{:02}", now.minute())),
                Some('S') => out.push_str(&format!("{:02}", now.second())),
                Some('f') => out.push_str(&format!("{:06}", now.nanosecond() / 1_000)),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        PathBuf::from(out)
    }

    /// Resolve and sidestep collisions with already-existing files by
    /// appending a monotonic suffix before the extension.
    pub fn resolve_unique(&self, path_name: &str, now: DateTime<Utc>, extension: &str) -> PathBuf {
        let base = self.resolve(path_name, now);
        let mut candidate = base.with_extension(extension);
        let mut seq = 0u32;
        while candidate.exists() {
            seq += 1;
            let stem = base
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            candidate = base.with_file_name(format!("{stem}-{seq}")).with_extension(extension);
        }
        candidate
    }
}
