use thiserror::Error;

pub const DEFAULT_MAX_CONTENT_CHARS: usize = 4000;
pub const DEFAULT_MAX_ATTACHMENTS: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message is empty")]
    Empty,
    #[error("value is too long (max {max}, got {got})")]
    TooLong { max: usize, got: usize },
    #[error("too many attachments (max {max}, got {got})")]
    TooManyAttachments { max: usize, got: usize },
    #[error("invalid format")]
    InvalidFormat,
}

#[derive(Debug, Clone, Copy)]
pub struct ContentLimits {
    pub max_content_chars: usize,
    pub max_attachments: usize,
}

impl Default for ContentLimits {
    fn default() -> Self {
        Self {
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            max_attachments: DEFAULT_MAX_ATTACHMENTS,
        }
    }
}

/// Strip control and zero-width characters (newlines and tabs survive) and
/// trim surrounding whitespace.
pub fn filter_message_content(raw: &str) -> String {
    raw.chars()
        .filter(|&c| c == '\n' || c == '\t' || !(c.is_control() || is_zero_width(c)))
        .collect::<String>()
        .trim()
        .to_string()
}

fn is_zero_width(c: char) -> bool {
    matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}')
}

/// Filter the content and check it against the limits. A message must carry
/// text or at least one attachment.
pub fn validate_message(
    raw: &str,
    attachment_count: usize,
    limits: &ContentLimits,
) -> Result<String, ValidationError> {
    if attachment_count > limits.max_attachments {
        return Err(ValidationError::TooManyAttachments {
            max: limits.max_attachments,
            got: attachment_count,
        });
    }
    let content = filter_message_content(raw);
    let len = content.chars().count();
    if len > limits.max_content_chars {
        return Err(ValidationError::TooLong {
            max: limits.max_content_chars,
            got: len,
        });
    }
    if content.is_empty() && attachment_count == 0 {
        return Err(ValidationError::Empty);
    }
    Ok(content)
}

/// Client nonces are short opaque strings.
pub fn normalize_nonce(raw: Option<&str>) -> Result<Option<String>, ValidationError> {
    let Some(nonce) = raw.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(None);
    };
    if nonce.len() > 64 {
        return Err(ValidationError::TooLong {
            max: 64,
            got: nonce.len(),
        });
    }
    if !nonce.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ValidationError::InvalidFormat);
    }
    Ok(Some(nonce.to_string()))
}
