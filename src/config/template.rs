//! Start command templates.
//!
//! A `start_cmd` such as `java -jar {server} nogui.` names the server
//! executable through the `{server}` placeholder. `{{` and `}}` stand for
//! literal braces and are never treated as placeholders.

use std::fmt;
use std::path::Path;

/// Placeholder replaced by the absolute executable path.
pub const SERVER_PLACEHOLDER: &str = "server";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Server,
}

/// A validated start command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl StartTemplate {
    /// Parse a template, requiring at least one `{server}` placeholder.
    pub fn parse(source: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(format!("unterminated placeholder in '{}'", source));
                            }
                            Some(other) => name.push(other),
                        }
                    }
                    if name != SERVER_PLACEHOLDER {
                        return Err(format!("unknown placeholder '{{{}}}'", name));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Server);
                }
                '}' => return Err("single '}' encountered, use '}}' for a literal brace".into()),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if !segments.contains(&Segment::Server) {
            return Err(format!("missing '{{{}}}' placeholder", SERVER_PLACEHOLDER));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Substitute the executable path for every placeholder.
    pub fn expand(&self, executable: &Path) -> String {
        let server = executable.display().to_string();
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_str(),
                Segment::Server => server.as_str(),
            })
            .collect()
    }

    /// The template as written in `server.conf`.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for StartTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
