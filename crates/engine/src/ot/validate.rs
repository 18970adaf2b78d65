use concord_core::wire::ValidationRuleSpec;
use regex::Regex;

use crate::error::ValidationError;

/// A compiled content rule, checked against the text an edit would produce.
#[derive(Debug, Clone)]
pub enum ValidationRule {
    MaxLength(usize),
    MinLength(usize),
    Pattern(Regex),
    ForbiddenPattern(Regex),
    NonEmpty,
}

impl ValidationRule {
    pub fn compile(spec: &ValidationRuleSpec) -> Result<Self, ValidationError> {
        Ok(match spec {
            ValidationRuleSpec::MaxLength(n) => Self::MaxLength(*n),
            ValidationRuleSpec::MinLength(n) => Self::MinLength(*n),
            ValidationRuleSpec::NonEmpty => Self::NonEmpty,
            ValidationRuleSpec::Pattern(p) => Self::Pattern(compile_regex(p)?),
            ValidationRuleSpec::ForbiddenPattern(p) => Self::ForbiddenPattern(compile_regex(p)?),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MaxLength(_) => "max_length",
            Self::MinLength(_) => "min_length",
            Self::Pattern(_) => "pattern",
            Self::ForbiddenPattern(_) => "forbidden_pattern",
            Self::NonEmpty => "non_empty",
        }
    }

    pub fn check(&self, text: &str) -> Result<(), ValidationError> {
        let len = text.chars().count();
        let failure = match self {
            Self::MaxLength(max) if len > *max => Some(format!("length {len} exceeds maximum {max}")),
            Self::MinLength(min) if len < *min => Some(format!("length {len} is below minimum {min}")),
            Self::Pattern(re) if !re.is_match(text) => Some(format!("text does not match /{}/", re.as_str())),
            Self::ForbiddenPattern(re) => re
                .find(text)
                .map(|m| format!("text contains forbidden {:?} at {}", m.as_str(), m.start())),
            Self::NonEmpty if text.trim().is_empty() => Some("text must not be empty".to_string()),
            _ => None,
        };
        match failure {
            Some(message) => Err(ValidationError::new(self.name(), message)),
            None => Ok(()),
        }
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, ValidationError> {
    Regex::new(pattern).map_err(|e| ValidationError::new("pattern", format!("invalid pattern: {e}")))
}

/// Compile every rule, then check each in order. The first failure wins.
pub fn validate(text: &str, rules: &[ValidationRuleSpec]) -> Result<(), ValidationError> {
    let compiled = rules
        .iter()
        .map(ValidationRule::compile)
        .collect::<Result<Vec<_>, _>>()?;
    compiled.iter().try_for_each(|rule| rule.check(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_bounds() {
        let rules = [ValidationRuleSpec::MinLength(2), ValidationRuleSpec::MaxLength(4)];
        assert!(validate("abc", &rules).is_ok());
        assert_eq!(validate("a", &rules).unwrap_err().rule, "min_length");
        assert_eq!(validate("abcde", &rules).unwrap_err().rule, "max_length");
    }

    #[test]
    fn length_counts_chars_not_bytes() {
        assert!(validate("héé", &[ValidationRuleSpec::MaxLength(3)]).is_ok());
    }

    #[test]
    fn patterns() {
        let rules = [
            ValidationRuleSpec::Pattern("^[A-Z]".into()),
            ValidationRuleSpec::ForbiddenPattern("(?i)secret".into()),
        ];
        assert!(validate("Hello", &rules).is_ok());
        assert_eq!(validate("hello", &rules).unwrap_err().rule, "pattern");
        let err = validate("Top SECRET", &rules).unwrap_err();
        assert_eq!(err.rule, "forbidden_pattern");
        assert!(err.message.contains("SECRET"));
    }

    #[test]
    fn non_empty_ignores_whitespace() {
        assert_eq!(validate("  ", &[ValidationRuleSpec::NonEmpty]).unwrap_err().rule, "non_empty");
    }

    #[test]
    fn bad_regex_is_a_validation_error() {
        let err = validate("x", &[ValidationRuleSpec::Pattern("(".into())]).unwrap_err();
        assert_eq!(err.rule, "pattern");
    }
}
