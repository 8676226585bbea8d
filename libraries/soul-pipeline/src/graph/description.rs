//! Raw graph descriptions
//!
//! Parses the launch-line syntax used for diagnostic graphs:
//!
//! ```text
//! audiotestsrc freq=440 num-buffers=20 ! audioconvert
//! filesrc location="/music/My Song.flac" ! decodebin
//! ```
//!
//! Elements are separated by `!`. Each element is a factory name followed by
//! `key=value` properties; values may be double-quoted to carry spaces.
//! Parsing is purely syntactic. Whether a factory exists is up to the
//! runtime that instantiates the chain.

use thiserror::Error;

/// Errors produced while parsing a description
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptionError {
    #[error("Empty graph description")]
    Empty,

    #[error("Empty element at position {0}")]
    EmptyElement(usize),

    #[error("Property \"{0}\" has no value")]
    MissingValue(String),

    #[error("Property without a name in element \"{0}\"")]
    MissingKey(String),

    #[error("Unterminated quote in element \"{0}\"")]
    UnterminatedQuote(String),

    #[error("Invalid factory name \"{0}\"")]
    InvalidFactory(String),
}

/// One element of a parsed description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementDesc {
    pub factory: String,
    pub properties: Vec<(String, String)>,
}

impl ElementDesc {
    /// Value of a property, if set
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse a property into `T`, falling back to `default` when absent
    pub fn parse_property<T: std::str::FromStr>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, String> {
        match self.property(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| raw.to_string()),
        }
    }
}

/// A parsed linear chain of elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementChain {
    pub elements: Vec<ElementDesc>,
}

impl ElementChain {
    pub fn parse(description: &str) -> Result<Self, DescriptionError> {
        let tokens = tokenize(description)?;
        if tokens.is_empty() {
            return Err(DescriptionError::Empty);
        }

        let mut elements = Vec::new();
        let mut current: Vec<String> = Vec::new();

        for token in tokens {
            match token {
                Token::Link => {
                    elements.push(finish_element(std::mem::take(&mut current), elements.len())?);
                }
                Token::Word(word) => current.push(word),
            }
        }
        elements.push(finish_element(current, elements.len())?);

        Ok(Self { elements })
    }

    pub fn first(&self) -> Option<&ElementDesc> {
        self.elements.first()
    }

    pub fn factories(&self) -> impl Iterator<Item = &str> {
        self.elements.iter().map(|e| e.factory.as_str())
    }
}

impl std::str::FromStr for ElementChain {
    type Err = DescriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

enum Token {
    Word(String),
    Link,
}

fn tokenize(input: &str) -> Result<Vec<Token>, DescriptionError> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_quotes = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    word.push(escaped);
                }
            }
            '!' if !in_quotes => {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
                tokens.push(Token::Link);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
            }
            c => word.push(c),
        }
    }

    if in_quotes {
        return Err(DescriptionError::UnterminatedQuote(word));
    }
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    Ok(tokens)
}

fn finish_element(words: Vec<String>, index: usize) -> Result<ElementDesc, DescriptionError> {
    let mut words = words.into_iter();
    let factory = words.next().ok_or(DescriptionError::EmptyElement(index))?;

    let valid_factory = factory
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && factory.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    if !valid_factory {
        return Err(DescriptionError::InvalidFactory(factory));
    }

    let mut properties = Vec::new();
    for word in words {
        let Some((key, value)) = word.split_once('=') else {
            return Err(DescriptionError::MissingValue(word));
        };
        if key.is_empty() {
            return Err(DescriptionError::MissingKey(factory));
        }
        properties.push((key.to_string(), value.to_string()));
    }

    Ok(ElementDesc {
        factory,
        properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_linked_elements_with_properties() {
        let chain = ElementChain::parse("audiotestsrc freq=220 wave=sine ! audioconvert").unwrap();
        assert_eq!(chain.elements.len(), 2);
        assert_eq!(chain.elements[0].factory, "audiotestsrc");
        assert_eq!(chain.elements[0].property("freq"), Some("220"));
        assert_eq!(chain.elements[0].property("wave"), Some("sine"));
        assert_eq!(chain.elements[1].factory, "audioconvert");
    }

    #[test]
    fn quoted_values_keep_spaces() {
        let chain = ElementChain::parse(r#"filesrc location="/music/My Song.flac" ! decodebin"#)
            .unwrap();
        assert_eq!(
            chain.elements[0].property("location"),
            Some("/music/My Song.flac")
        );
    }

    #[test]
    fn later_property_wins() {
        let chain = ElementChain::parse("audiotestsrc freq=1 freq=2").unwrap();
        assert_eq!(chain.elements[0].parse_property("freq", 0.0), Ok(2.0));
    }

    #[test]
    fn malformed_descriptions_are_rejected() {
        assert_eq!(ElementChain::parse("   "), Err(DescriptionError::Empty));
        assert_eq!(
            ElementChain::parse("audiotestsrc !"),
            Err(DescriptionError::EmptyElement(1))
        );
        assert_eq!(
            ElementChain::parse("! fakesink"),
            Err(DescriptionError::EmptyElement(0))
        );
        assert!(matches!(
            ElementChain::parse("audiotestsrc freq"),
            Err(DescriptionError::MissingValue(_))
        ));
        assert!(matches!(
            ElementChain::parse("audiotestsrc =3"),
            Err(DescriptionError::MissingKey(_))
        ));
        assert!(matches!(
            ElementChain::parse(r#"filesrc location="/open"#),
            Err(DescriptionError::UnterminatedQuote(_))
        ));
        assert!(matches!(
            ElementChain::parse("3src"),
            Err(DescriptionError::InvalidFactory(_))
        ));
    }
}
