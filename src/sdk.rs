use std::fmt::{Display, Formatter};
use std::str::FromStr;
use serde::Serialize;

/// Source languages a pipeline may declare.
///
/// The language is passed on to the Dockerfile as the `LANGUAGE` build argument,
/// so multi-language base Dockerfiles can branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Java,
    Kotlin,
    Go,
    Rust,
    Node,
    Python,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Java,
        Language::Kotlin,
        Language::Go,
        Language::Rust,
        Language::Node,
        Language::Python,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Java => "java",
            Language::Kotlin => "kotlin",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Node => "node",
            Language::Python => "python",
        }
    }
}

impl Display for Language {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        match lowered.as_str() {
            "golang" => return Ok(Language::Go),
            "nodejs" | "javascript" | "typescript" => return Ok(Language::Node),
            _ => {}
        }
        Language::ALL
            .into_iter()
            .find(|lang| lang.as_str() == lowered)
            .ok_or_else(|| {
                let known: Vec<_> = Language::ALL.iter().map(Language::as_str).collect();
                format!("unsupported language '{s}', expected one of: {}", known.join(", "))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::Language;

    #[test]
    fn parse_languages() {
        assert_eq!("java".parse::<Language>(), Ok(Language::Java));
        assert_eq!("Java".parse::<Language>(), Ok(Language::Java));
        assert_eq!("golang".parse::<Language>(), Ok(Language::Go));
        assert_eq!("typescript".parse::<Language>(), Ok(Language::Node));
        assert!("cobol".parse::<Language>().unwrap_err().contains("cobol"));
    }
}
